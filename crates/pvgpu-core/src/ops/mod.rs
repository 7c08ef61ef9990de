//! Command operations. Each one frames a request, runs the payload codecs,
//! exchanges it on the selected channel and translates the host's answer.

pub mod adapter;
pub mod allocation;
pub mod context;
pub mod device;
pub mod global;
pub mod lock;
pub mod paging;
pub mod residency;
pub mod sync_object;

use bytemuck::Pod;
use pvgpu_protocol::{VgpuCommand, VgpuToHostHeader};
use tracing::{debug, error};

use crate::error::CoreResult;
use crate::message::Message;
use crate::session::{Adapter, Dispatch, Process, Session};

/// Log a failed operation and hand the result back unchanged.
pub(crate) fn traced<T>(op: &'static str, result: CoreResult<T>) -> CoreResult<T> {
    if let Err(e) = &result {
        debug!(op, errno = e.errno().code(), "command failed: {e}");
    }
    result
}

/// Run a compensating host call during rollback. Its failure is logged and
/// never replaces the error that triggered the rollback.
pub(crate) fn compensate(what: &'static str, result: CoreResult<()>) {
    if let Err(e) = result {
        error!(what, "rollback step failed: {e}");
    }
}

/// Per-adapter header stamped with the process's host handle.
pub(crate) fn process_header(command: VgpuCommand, process: &Process) -> VgpuToHostHeader {
    VgpuToHostHeader::new(command, process.host_handle())
}

/// Per-adapter header for a command that may be sent fire-and-forget.
pub(crate) fn dispatch_header(command: VgpuCommand, process: &Process, dispatch: Dispatch) -> VgpuToHostHeader {
    let mut hdr = process_header(command, process);
    if dispatch == Dispatch::Async {
        hdr.set_async();
    }
    hdr
}

/// Frame a message consisting of exactly one fixed command struct.
pub(crate) fn fixed_message<'s, C: Pod>(
    session: &'s Session,
    adapter: Option<&'s Adapter>,
    command: &C,
) -> CoreResult<Message<'s>> {
    let mut msg = Message::new(session, adapter, std::mem::size_of::<C>())?;
    msg.writer().put(command)?;
    Ok(msg)
}

/// Send a single-struct command and translate the status-only reply.
pub(crate) fn send_status<C: Pod>(session: &Session, adapter: Option<&Adapter>, command: &C) -> CoreResult<i32> {
    fixed_message(session, adapter, command)?.send_sync_status()
}

/// Send a single-struct command and decode its fixed reply.
pub(crate) fn send_typed<C: Pod, R: Pod>(session: &Session, adapter: Option<&Adapter>, command: &C) -> CoreResult<R> {
    fixed_message(session, adapter, command)?.send_sync_typed()
}

/// Map a host-supplied io space range into the process, after checking it
/// lies inside the region the host registered.
pub(crate) fn map_iospace(session: &Session, process: &Process, phys: u64, size: u64, cached: bool) -> CoreResult<u64> {
    session.check_iospace(phys, size)?;
    Ok(process.mapper().map(phys, size, true, cached)?)
}

/// Map the single page of fence storage at `phys`.
pub(crate) fn map_fence_page(session: &Session, process: &Process, phys: u64) -> CoreResult<u64> {
    map_iospace(session, process, phys, session.page_geometry().page_size(), true)
}
