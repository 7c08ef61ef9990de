use pvgpu_protocol::{Errno, ProtocolError};

use crate::channel::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel {0} has been removed")]
    DeviceRemoved(String),

    #[error("timed out waiting for a reply on channel {0}")]
    Timeout(String),

    #[error("host reply of {got} bytes exceeds the {expected}-byte result buffer")]
    ResponseTooLarge { got: usize, expected: usize },

    #[error("send on channel {channel} failed: {reason}")]
    SendFailed { channel: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    pub(crate) fn from_channel(channel: &str, err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout => TransportError::Timeout(channel.to_string()),
            ChannelError::Removed => TransportError::DeviceRemoved(channel.to_string()),
            ChannelError::Send(reason) => TransportError::SendFailed { channel: channel.to_string(), reason },
        }
    }

    /// Local error code reported to the caller.
    pub fn errno(&self) -> Errno {
        match self {
            TransportError::DeviceRemoved(_) => Errno::NoSuchDevice,
            TransportError::Timeout(_) => Errno::TryAgain,
            TransportError::ResponseTooLarge { .. } => Errno::InvalidArgument,
            TransportError::SendFailed { .. } => Errno::Io,
            TransportError::Protocol(e) => e.errno(),
        }
    }
}
