/// Errors a bus channel implementation reports for a single send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("timed out waiting for host completion")]
    Timeout,

    #[error("channel torn down")]
    Removed,

    #[error("send failed: {0}")]
    Send(String),
}

/// A byte-oriented bus endpoint to the host GPU service.
///
/// Implementations perform the actual ring/packet I/O. They may assume the
/// caller holds the endpoint's access lock for the whole call.
pub trait VmBusChannel: Send + Sync {
    /// Send `request` and block until the host completes it, returning the
    /// completion payload.
    fn send_sync(&self, request: &[u8]) -> Result<Vec<u8>, ChannelError>;

    /// Send `request` without waiting for a completion.
    fn send_async(&self, request: &[u8]) -> Result<(), ChannelError>;
}
