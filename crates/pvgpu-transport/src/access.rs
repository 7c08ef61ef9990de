use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::channel::VmBusChannel;
use crate::error::TransportError;

/// A shared channel plus the lock that serializes exchanges on it.
///
/// At most one exchange is in flight per endpoint. The lock is held by a
/// [`ChannelGuard`] from acquisition until the guard is dropped.
pub struct ChannelEndpoint {
    name: String,
    channel: Arc<dyn VmBusChannel>,
    lock: Mutex<()>,
    removed: AtomicBool,
}

impl ChannelEndpoint {
    pub fn new(name: impl Into<String>, channel: Arc<dyn VmBusChannel>) -> Self {
        Self {
            name: name.into(),
            channel,
            lock: Mutex::new(()),
            removed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire exclusive use of the channel.
    ///
    /// Fails with [`TransportError::DeviceRemoved`] once the endpoint has been
    /// torn down; no guard exists in that case so nothing needs releasing.
    pub fn acquire(&self) -> Result<ChannelGuard<'_>, TransportError> {
        if self.is_removed() {
            return Err(TransportError::DeviceRemoved(self.name.clone()));
        }
        let lock = self.lock.lock();
        // Teardown may have raced with the wait for the lock.
        if self.is_removed() {
            return Err(TransportError::DeviceRemoved(self.name.clone()));
        }
        Ok(ChannelGuard { endpoint: self, _lock: lock })
    }

    /// Mark the endpoint torn down. Later acquisitions fail; an exchange
    /// already holding the lock runs to completion.
    pub fn mark_removed(&self) {
        debug!(channel = %self.name, "channel marked removed");
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// Proof of exclusive access to a [`ChannelEndpoint`]. Released on drop.
pub struct ChannelGuard<'a> {
    endpoint: &'a ChannelEndpoint,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> ChannelGuard<'a> {
    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub(crate) fn channel(&self) -> &dyn VmBusChannel {
        self.endpoint.channel.as_ref()
    }
}
