//! In-process bus pair for tests and diagnostics.
//!
//! [`LoopbackChannel`] implements [`VmBusChannel`] by handing each request to
//! a [`HostEndpoint`] over a crossbeam channel and waiting on a per-request
//! completion, correlated by request id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use tracing::debug;

use crate::channel::{ChannelError, VmBusChannel};

type PendingMap = DashMap<u64, Sender<Vec<u8>>>;

/// A request as seen by the host side of a loopback pair.
#[derive(Debug, Clone)]
pub struct HostRequest {
    pub request_id: u64,
    pub payload: Vec<u8>,
    /// False for fire-and-forget sends
    pub expects_reply: bool,
}

pub struct LoopbackChannel {
    requests: Sender<HostRequest>,
    pending: Arc<PendingMap>,
    next_request_id: AtomicU64,
    timeout: Duration,
}

pub struct HostEndpoint {
    requests: Receiver<HostRequest>,
    pending: Arc<PendingMap>,
}

/// Create a connected guest/host pair. Synchronous sends give up after `timeout`.
pub fn loopback(timeout: Duration) -> (LoopbackChannel, HostEndpoint) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let pending = Arc::new(PendingMap::new());
    let channel = LoopbackChannel {
        requests: tx,
        pending: pending.clone(),
        next_request_id: AtomicU64::new(1),
        timeout,
    };
    (channel, HostEndpoint { requests: rx, pending })
}

impl LoopbackChannel {
    fn allocate_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, request_id: u64, request: &[u8], expects_reply: bool) -> Result<(), ChannelError> {
        let msg = HostRequest { request_id, payload: request.to_vec(), expects_reply };
        self.requests.send(msg).map_err(|_| ChannelError::Removed)
    }
}

impl VmBusChannel for LoopbackChannel {
    fn send_sync(&self, request: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let request_id = self.allocate_id();
        self.pending.insert(request_id, tx);
        if let Err(e) = self.submit(request_id, request, true) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.pending.remove(&request_id);
                debug!(request_id, "loopback request timed out");
                Err(ChannelError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Removed),
        }
    }

    fn send_async(&self, request: &[u8]) -> Result<(), ChannelError> {
        self.submit(self.allocate_id(), request, false)
    }
}

impl HostEndpoint {
    /// Next request, or `None` once the guest side is gone.
    pub fn recv(&self) -> Option<HostRequest> {
        self.requests.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<HostRequest> {
        self.requests.recv_timeout(timeout).ok()
    }

    /// Complete a synchronous request. Returns false when nobody is waiting
    /// any more (timed out, or the request was asynchronous).
    pub fn complete(&self, request_id: u64, reply: Vec<u8>) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Answer every request on a background thread until the guest side disconnects.
    pub fn serve<F>(self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&HostRequest) -> Vec<u8> + Send + 'static,
    {
        std::thread::spawn(move || {
            while let Some(req) = self.recv() {
                let reply = handler(&req);
                if req.expects_reply {
                    self.complete(req.request_id, reply);
                }
            }
        })
    }
}

impl Drop for HostEndpoint {
    fn drop(&mut self) {
        // Wake every waiter with a disconnect.
        self.pending.clear();
    }
}
