use bytemuck::Zeroable;
use pvgpu_protocol::NtStatus;
use tracing::{debug, warn};

use crate::access::ChannelGuard;
use crate::error::TransportError;

impl ChannelGuard<'_> {
    /// Send `request` and block for the reply, copying it into `result`.
    ///
    /// Returns the reply length. A reply shorter than `result` leaves the
    /// remainder untouched. A longer reply is rejected.
    pub fn send_sync(&self, request: &[u8], result: &mut [u8]) -> Result<usize, TransportError> {
        debug!(channel = self.name(), len = request.len(), "sync send");
        let reply = self
            .channel()
            .send_sync(request)
            .map_err(|e| TransportError::from_channel(self.name(), e))?;

        if reply.len() > result.len() {
            warn!(
                channel = self.name(),
                got = reply.len(),
                expected = result.len(),
                "oversized host reply"
            );
            return Err(TransportError::ResponseTooLarge { got: reply.len(), expected: result.len() });
        }
        result[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }

    /// Send `request` and return the single status the host replies with.
    pub fn send_sync_status(&self, request: &[u8]) -> Result<NtStatus, TransportError> {
        let mut status = NtStatus::zeroed();
        self.send_sync(request, bytemuck::bytes_of_mut(&mut status))?;
        Ok(status)
    }

    /// Send `request` without waiting for the host.
    pub fn send_async(&self, request: &[u8]) -> Result<(), TransportError> {
        debug!(channel = self.name(), len = request.len(), "async send");
        self.channel()
            .send_async(request)
            .map_err(|e| TransportError::from_channel(self.name(), e))
    }
}
