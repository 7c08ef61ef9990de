use crate::status::Errno;
use crate::wire::WireError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command type: {0}")]
    UnknownCommand(u32),

    #[error("unknown channel type: {0}")]
    UnknownChannel(u8),

    #[error("truncated header: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("extended header has invalid command offset {0}")]
    BadCommandOffset(u32),

    #[error("host reported {got} entries, expected {expected}")]
    CountMismatch { expected: u32, got: u32 },

    #[error("malformed reply: {0}")]
    MalformedReply(&'static str),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),
}

impl ProtocolError {
    /// Every protocol violation surfaces as an invalid-argument class error.
    pub fn errno(&self) -> Errno {
        Errno::InvalidArgument
    }
}
