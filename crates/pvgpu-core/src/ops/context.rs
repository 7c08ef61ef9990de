//! Contexts, hardware queues and command submission.

use std::sync::Arc;

use pvgpu_protocol::adapter_commands::{
    CreateContextVirtualCommand, CreateHwQueueCommand, GetContextSchPriorityCommand, GetContextSchPriorityReturn,
    SetContextSchPriorityCommand, SubmitCommandArgs, SubmitCommandCommand, SubmitCommandToHwQueueArgs,
    SubmitCommandToHwQueueCommand,
};
use pvgpu_protocol::{D3dkmtHandle, PayloadReader, VgpuCommand};
use tracing::{debug, warn};

use crate::codec::{array_size, command_size, wire_u32};
use crate::error::{CoreError, CoreResult};
use crate::message::{zeroed_vec, Message};
use crate::objects::{HandleKind, HandleObject, HwQueue};
use crate::ops::device::send_handle_command;
use crate::ops::{compensate, dispatch_header, map_fence_page, process_header, send_status, send_typed, traced};
use crate::session::{Adapter, Process, Session};

/// Where a new context runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextRequest {
    pub device: D3dkmtHandle,
    pub node_ordinal: u32,
    pub engine_affinity: u32,
    pub flags: u32,
}

fn check_echoed_data(what: &'static str, len: usize, session: &Session) -> CoreResult<()> {
    if len > session.max_packet_size() {
        return Err(CoreError::InvalidArgument(what));
    }
    Ok(())
}

/// Create a context. The host echoes the command and private data back;
/// `private_data` receives the echoed copy.
pub fn create_context(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &ContextRequest,
    private_data: &mut [u8],
) -> CoreResult<D3dkmtHandle> {
    traced("create_context", send_create_context(session, adapter, process, request, private_data))
}

fn send_create_context(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &ContextRequest,
    private_data: &mut [u8],
) -> CoreResult<D3dkmtHandle> {
    check_echoed_data("context private data exceeds the packet limit", private_data.len(), session)?;
    let command = CreateContextVirtualCommand {
        hdr: process_header(VgpuCommand::CreateContextVirtual, process),
        device: request.device,
        node_ordinal: request.node_ordinal,
        engine_affinity: request.engine_affinity,
        flags: request.flags,
        client_hint: 1,
        priv_drv_data_size: wire_u32("context private data", private_data.len())?,
        context: D3dkmtHandle::NULL,
        reserved: 0,
    };
    let size = command_size::<CreateContextVirtualCommand>(&[private_data.len()])?;
    let mut msg = Message::new(session, Some(adapter), size)?;
    let mut w = msg.writer();
    w.put(&command)?;
    w.put_bytes(private_data)?;

    let mut reply = zeroed_vec(size)?;
    msg.send_sync_into(&mut reply)?;
    msg.free();

    let mut reader = PayloadReader::new(&reply);
    let echoed: CreateContextVirtualCommand = reader.read()?;
    if echoed.context.is_null() {
        return Err(CoreError::NullHandle("context"));
    }
    private_data.copy_from_slice(reader.read_bytes(private_data.len())?);
    debug!(context = %echoed.context, "context created");
    Ok(echoed.context)
}

pub fn destroy_context(session: &Session, adapter: &Adapter, process: &Process, context: D3dkmtHandle) -> CoreResult<()> {
    traced(
        "destroy_context",
        send_handle_command(session, adapter, process, VgpuCommand::DestroyContext, context),
    )
}

pub fn set_context_sch_priority(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    context: D3dkmtHandle,
    priority: i32,
    in_process: bool,
) -> CoreResult<()> {
    let command = SetContextSchPriorityCommand {
        hdr: process_header(VgpuCommand::SetContextSchedulingPriority, process),
        context,
        priority,
        in_process: u32::from(in_process),
        reserved: 0,
    };
    traced("set_context_sch_priority", send_status(session, Some(adapter), &command)).map(|_| ())
}

pub fn get_context_sch_priority(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    context: D3dkmtHandle,
    in_process: bool,
) -> CoreResult<i32> {
    let command = GetContextSchPriorityCommand {
        hdr: process_header(VgpuCommand::GetContextSchedulingPriority, process),
        context,
        in_process: u32::from(in_process),
    };
    let reply: GetContextSchPriorityReturn =
        traced("get_context_sch_priority", send_typed(session, Some(adapter), &command))?;
    traced("get_context_sch_priority", CoreError::check_status(reply.status))?;
    Ok(reply.priority)
}

/// Submit a command buffer to a context. History buffer handles and the
/// private data follow the fixed arguments; counts are taken from the slices.
pub fn submit_command(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: &SubmitCommandArgs,
    history_buffers: &[D3dkmtHandle],
    private_data: &[u8],
) -> CoreResult<()> {
    let run = || -> CoreResult<()> {
        let mut args = *args;
        args.num_history_buffers = wire_u32("history buffer count", history_buffers.len())?;
        args.priv_drv_data_size = wire_u32("submit private data", private_data.len())?;

        let dispatch = session.dispatch();
        let command = SubmitCommandCommand {
            hdr: dispatch_header(VgpuCommand::SubmitCommand, process, dispatch),
            args,
        };
        let size = command_size::<SubmitCommandCommand>(&[
            array_size::<D3dkmtHandle>(history_buffers.len())?,
            private_data.len(),
        ])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(history_buffers)?;
        w.put_bytes(private_data)?;
        msg.submit(dispatch)
    };
    traced("submit_command", run())
}

/// Create a hardware queue on `context` and register it, with its progress
/// fence, in the process handle table. The fence storage is mapped into
/// the process before returning.
pub fn create_hwqueue(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    context: D3dkmtHandle,
    flags: u32,
    private_data: &mut [u8],
) -> CoreResult<Arc<HwQueue>> {
    let reply = traced(
        "create_hwqueue",
        send_create_hwqueue(session, adapter, process, context, flags, private_data),
    )?;

    let queue = Arc::new(HwQueue::new(
        reply.hwqueue,
        reply.hwqueue_progress_fence,
        reply.hwqueue_progress_fence_gpuva,
    ));
    let mut assigned = Vec::with_capacity(2);
    let registered = register_hwqueue(process, &queue, &mut assigned)
        .and_then(|()| map_fence_page(session, process, reply.hwqueue_progress_fence_cpuva));

    match registered {
        Ok(cpu_va) => {
            queue.set_progress_fence_cpu_va(cpu_va);
            debug!(hwqueue = %queue.handle(), fence = %queue.progress_fence(), "hardware queue created");
            Ok(queue)
        }
        Err(e) => {
            // Entries held by other objects on a handle collision stay put.
            for &(handle, kind) in assigned.iter().rev() {
                process.handles().free(handle, kind);
            }
            compensate(
                "destroy_hwqueue",
                send_handle_command(session, adapter, process, VgpuCommand::DestroyHwQueue, queue.handle()),
            );
            traced("create_hwqueue", Err(e))
        }
    }
}

fn send_create_hwqueue(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    context: D3dkmtHandle,
    flags: u32,
    private_data: &mut [u8],
) -> CoreResult<CreateHwQueueCommand> {
    check_echoed_data("hardware queue private data exceeds the packet limit", private_data.len(), session)?;
    let command = CreateHwQueueCommand {
        hdr: process_header(VgpuCommand::CreateHwQueue, process),
        status: Default::default(),
        hwqueue: D3dkmtHandle::NULL,
        hwqueue_progress_fence: D3dkmtHandle::NULL,
        context,
        flags,
        priv_drv_data_size: wire_u32("hardware queue private data", private_data.len())?,
        hwqueue_progress_fence_cpuva: 0,
        hwqueue_progress_fence_gpuva: 0,
    };
    let size = command_size::<CreateHwQueueCommand>(&[private_data.len()])?;
    let mut msg = Message::new(session, Some(adapter), size)?;
    let mut w = msg.writer();
    w.put(&command)?;
    w.put_bytes(private_data)?;

    let mut reply = zeroed_vec(size)?;
    msg.send_sync_into(&mut reply)?;
    msg.free();

    let mut reader = PayloadReader::new(&reply);
    let echoed: CreateHwQueueCommand = reader.read()?;
    CoreError::check_status(echoed.status)?;
    private_data.copy_from_slice(reader.read_bytes(private_data.len())?);
    Ok(echoed)
}

/// Register the queue and its progress fence, recording each entry that
/// was actually taken in `assigned`.
fn register_hwqueue(
    process: &Process,
    queue: &Arc<HwQueue>,
    assigned: &mut Vec<(D3dkmtHandle, HandleKind)>,
) -> CoreResult<()> {
    process
        .handles()
        .assign(queue.handle(), HandleObject::HwQueue(Arc::clone(queue)))?;
    assigned.push((queue.handle(), HandleKind::HwQueue));
    process
        .handles()
        .assign(queue.progress_fence(), HandleObject::MonitoredFence(Arc::clone(queue)))?;
    assigned.push((queue.progress_fence(), HandleKind::MonitoredFence));
    Ok(())
}

/// Destroy a hardware queue on the host and drop its local state: the
/// table entries and the progress fence mapping.
pub fn destroy_hwqueue(session: &Session, adapter: &Adapter, process: &Process, hwqueue: D3dkmtHandle) -> CoreResult<()> {
    let result = send_handle_command(session, adapter, process, VgpuCommand::DestroyHwQueue, hwqueue);

    if let Some(HandleObject::HwQueue(queue)) = process.handles().free(hwqueue, HandleKind::HwQueue) {
        process.handles().free(queue.progress_fence(), HandleKind::MonitoredFence);
        if let Some(cpu_va) = queue.take_progress_fence_cpu_va() {
            if let Err(e) = process.mapper().unmap(cpu_va, session.page_geometry().page_size()) {
                warn!(hwqueue = %hwqueue, "unmapping progress fence failed: {e}");
            }
        }
    }
    traced("destroy_hwqueue", result)
}

/// Submit a command buffer to a hardware queue. Written primaries and the
/// private data follow the fixed arguments.
pub fn submit_command_hwqueue(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: &SubmitCommandToHwQueueArgs,
    primaries: &[D3dkmtHandle],
    private_data: &[u8],
) -> CoreResult<()> {
    let run = || -> CoreResult<()> {
        let mut args = *args;
        args.num_primaries = wire_u32("primary count", primaries.len())?;
        args.priv_drv_data_size = wire_u32("submit private data", private_data.len())?;

        let dispatch = session.dispatch();
        let command = SubmitCommandToHwQueueCommand {
            hdr: dispatch_header(VgpuCommand::SubmitCommandToHwQueue, process, dispatch),
            args,
        };
        let size = command_size::<SubmitCommandToHwQueueCommand>(&[
            array_size::<D3dkmtHandle>(primaries.len())?,
            private_data.len(),
        ])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(primaries)?;
        w.put_bytes(private_data)?;
        msg.submit(dispatch)
    };
    traced("submit_command_hwqueue", run())
}
