//! Request framing: sizing, storage, extended header and channel choice.

use bytemuck::Pod;
use pvgpu_protocol::command::{ExtHeader, EXT_HEADER_SIZE};
use pvgpu_protocol::wire::align_result_size;
use pvgpu_protocol::PayloadWriter;
use pvgpu_transport::ChannelEndpoint;

use crate::error::{CoreError, CoreResult};
use crate::session::{Adapter, Dispatch, Session};

/// Messages up to this many bytes (extended header included) are stored inline.
pub const INLINE_MESSAGE_CAPACITY: usize = 64;

/// Which channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Global,
    Adapter,
}

/// Channel for a plain message: the adapter's own channel only when an
/// adapter is involved and async messaging is off.
pub fn select_route(has_adapter: bool, async_enabled: bool) -> Route {
    if has_adapter && !async_enabled {
        Route::Adapter
    } else {
        Route::Global
    }
}

/// Channel for a per-adapter message with a separate result buffer.
/// Async-enabled sessions route these through the global channel.
pub fn select_result_route(async_enabled: bool) -> Route {
    if async_enabled {
        Route::Global
    } else {
        Route::Adapter
    }
}

enum Storage {
    Empty,
    Inline { buf: [u8; INLINE_MESSAGE_CAPACITY], len: usize },
    Heap(Vec<u8>),
}

impl Storage {
    fn zeroed(len: usize, inline_ok: bool) -> CoreResult<Self> {
        if inline_ok && len <= INLINE_MESSAGE_CAPACITY {
            return Ok(Storage::Inline { buf: [0; INLINE_MESSAGE_CAPACITY], len });
        }
        Ok(Storage::Heap(zeroed_vec(len)?))
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Empty => &[],
            Storage::Inline { buf, len } => &buf[..*len],
            Storage::Heap(v) => v,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Empty => &mut [],
            Storage::Inline { buf, len } => &mut buf[..*len],
            Storage::Heap(v) => v,
        }
    }
}

pub(crate) fn zeroed_vec(len: usize) -> CoreResult<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| CoreError::OutOfMemory(len))?;
    v.resize(len, 0);
    Ok(v)
}

/// One framed request, owned by the operation issuing it.
pub struct Message<'s> {
    storage: Storage,
    payload_offset: usize,
    route: Route,
    channel: &'s ChannelEndpoint,
}

impl<'s> Message<'s> {
    /// Frame a request of `size` payload bytes.
    pub fn new(session: &'s Session, adapter: Option<&'s Adapter>, size: usize) -> CoreResult<Self> {
        let route = select_route(adapter.is_some(), session.async_msg_enabled());
        Self::build(session, adapter, size, route, true)
    }

    fn build(
        session: &'s Session,
        adapter: Option<&'s Adapter>,
        size: usize,
        route: Route,
        inline_ok: bool,
    ) -> CoreResult<Self> {
        debug_assert!(size > 0, "zero-sized message");
        let ext = if session.uses_ext_header() { EXT_HEADER_SIZE } else { 0 };
        let max = session.max_packet_size();
        let total = size.saturating_add(ext);
        if total > max {
            return Err(CoreError::MessageTooLarge { size: total, max });
        }

        let channel = match (route, adapter) {
            (Route::Adapter, Some(adapter)) => adapter.channel(),
            _ => session.global_channel(),
        };

        let mut storage = Storage::zeroed(total, inline_ok)?;
        if ext != 0 {
            let header = ExtHeader {
                command_offset: ext as u32,
                reserved: 0,
                vgpu_luid: adapter.map(Adapter::host_vgpu_luid).unwrap_or_default(),
            };
            storage.bytes_mut()[..ext].copy_from_slice(bytemuck::bytes_of(&header));
        }

        Ok(Self { storage, payload_offset: ext, route, channel })
    }

    /// Total framed length, extended header included.
    pub fn len(&self) -> usize {
        self.storage.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage.bytes()
    }

    /// The command region after the extended header.
    pub fn payload(&self) -> &[u8] {
        let bytes = self.storage.bytes();
        &bytes[self.payload_offset.min(bytes.len())..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let offset = self.payload_offset;
        let bytes = self.storage.bytes_mut();
        let start = offset.min(bytes.len());
        &mut bytes[start..]
    }

    /// Section writer positioned at the start of the command.
    pub fn writer(&mut self) -> PayloadWriter<'_> {
        PayloadWriter::new(self.payload_mut())
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn channel(&self) -> &'s ChannelEndpoint {
        self.channel
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.storage, Storage::Inline { .. })
    }

    /// Release the buffer. Safe to call more than once.
    pub fn free(&mut self) {
        self.storage = Storage::Empty;
    }

    /// Exchange synchronously, copying the reply into `result`.
    pub fn send_sync_into(&self, result: &mut [u8]) -> CoreResult<usize> {
        let guard = self.channel.acquire()?;
        Ok(guard.send_sync(self.as_bytes(), result)?)
    }

    /// Exchange synchronously and decode a fixed-size reply.
    pub fn send_sync_typed<R: Pod>(&self) -> CoreResult<R> {
        let mut reply = R::zeroed();
        self.send_sync_into(bytemuck::bytes_of_mut(&mut reply))?;
        Ok(reply)
    }

    /// Exchange synchronously and translate the status-only reply.
    pub fn send_sync_status(&self) -> CoreResult<i32> {
        let guard = self.channel.acquire()?;
        let status = guard.send_sync_status(self.as_bytes())?;
        drop(guard);
        CoreError::check_status(status)
    }

    pub fn send_async(&self) -> CoreResult<()> {
        let guard = self.channel.acquire()?;
        Ok(guard.send_async(self.as_bytes())?)
    }

    /// Send according to `dispatch`: blocking for a status, or fire-and-forget.
    pub fn submit(&self, dispatch: Dispatch) -> CoreResult<()> {
        match dispatch {
            Dispatch::Sync => self.send_sync_status().map(|_| ()),
            Dispatch::Async => self.send_async(),
        }
    }
}

/// A request plus an independently sized reply buffer.
pub struct MessageWithResult<'s> {
    message: Message<'s>,
    result: Vec<u8>,
}

impl<'s> MessageWithResult<'s> {
    /// Frame a per-adapter request of `size` bytes whose reply needs up to
    /// `result_size` bytes (rounded up to 8).
    pub fn new(session: &'s Session, adapter: &'s Adapter, size: usize, result_size: usize) -> CoreResult<Self> {
        let result_len = align_result_size(result_size);
        let max = session.max_packet_size();
        if result_len > max {
            return Err(CoreError::MessageTooLarge { size: result_len, max });
        }
        let route = select_result_route(session.async_msg_enabled());
        let message = Message::build(session, Some(adapter), size, route, false)?;
        let result = zeroed_vec(result_len)?;
        Ok(Self { message, result })
    }

    pub fn message(&self) -> &Message<'s> {
        &self.message
    }

    pub fn writer(&mut self) -> PayloadWriter<'_> {
        self.message.writer()
    }

    pub fn result(&self) -> &[u8] {
        &self.result
    }

    pub fn route(&self) -> Route {
        self.message.route()
    }

    /// Exchange synchronously into the result buffer.
    pub fn send_sync(&mut self) -> CoreResult<usize> {
        let guard = self.message.channel.acquire()?;
        Ok(guard.send_sync(self.message.as_bytes(), &mut self.result)?)
    }

    pub fn free(&mut self) {
        self.message.free();
        self.result = Vec::new();
    }
}
