use pvgpu_protocol::{Errno, NtStatus, ProtocolError, WireError};
use pvgpu_transport::TransportError;

use crate::handle_table::HandleTableError;
use crate::memory::{MapError, PinError};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("host returned {status}: {errno}")]
    Host { status: NtStatus, errno: Errno },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("message of {size} bytes exceeds the {max}-byte packet limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("{what} of {size} bytes is too large")]
    ValueTooLarge { what: &'static str, size: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("host returned a null {0} handle")]
    NullHandle(&'static str),

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("page list needs more than {capacity} entries")]
    RleOverflow { capacity: usize },

    #[error("pinning user pages failed: {0}")]
    Pin(#[from] PinError),

    #[error("io space mapping failed: {0}")]
    Map(#[from] MapError),

    #[error("handle table: {0}")]
    HandleTable(#[from] HandleTableError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Local error code reported to the caller.
    pub fn errno(&self) -> Errno {
        match self {
            CoreError::Host { errno, .. } => *errno,
            CoreError::Transport(e) => e.errno(),
            CoreError::Protocol(e) => e.errno(),
            CoreError::MessageTooLarge { .. }
            | CoreError::ValueTooLarge { .. }
            | CoreError::RleOverflow { .. } => Errno::ValueTooLarge,
            CoreError::InvalidArgument(_) | CoreError::Config(_) => Errno::InvalidArgument,
            CoreError::NullHandle(_) => Errno::NotRecoverable,
            CoreError::OutOfMemory(_) | CoreError::Pin(_) => Errno::OutOfMemory,
            CoreError::Map(e) => e.errno(),
            CoreError::HandleTable(e) => e.errno(),
            CoreError::Io(_) => Errno::Io,
        }
    }

    /// Translate a host status, passing success codes through.
    pub fn check_status(status: NtStatus) -> CoreResult<i32> {
        status.into_result().map_err(|errno| CoreError::Host { status, errno })
    }
}

impl From<WireError> for CoreError {
    fn from(e: WireError) -> Self {
        CoreError::Protocol(ProtocolError::Wire(e))
    }
}
