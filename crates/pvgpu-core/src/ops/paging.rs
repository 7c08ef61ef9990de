//! Paging queues, residency and GPU virtual address management.

use pvgpu_protocol::adapter_commands::{
    CreatePagingQueueArgs, CreatePagingQueueCommand, CreatePagingQueueReturn, EvictCommand, EvictReturn,
    FreeGpuVaArgs, FreeGpuVaCommand, GpuVaReturn, MakeResidentCommand, MakeResidentReturn, MapGpuVaArgs,
    MapGpuVaCommand, ReserveGpuVaArgs, ReserveGpuVaCommand, UpdateGpuVaCommand, UpdateGpuVaOperation,
};
use pvgpu_protocol::{D3dkmtHandle, NtStatus, VgpuCommand};
use tracing::{debug, warn};

use crate::codec::{array_size, command_size, wire_u32};
use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use crate::ops::device::send_handle_command;
use crate::ops::{compensate, map_fence_page, process_header, send_status, send_typed, traced};
use crate::session::{Adapter, Process, Session};

/// A paging queue with its fence storage mapped into the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingQueue {
    pub paging_queue: D3dkmtHandle,
    pub sync_object: D3dkmtHandle,
    /// Start of the mapped fence page
    pub fence_page_va: u64,
    /// Address of the fence value inside that page
    pub fence_cpu_va: u64,
}

pub fn create_paging_queue(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: CreatePagingQueueArgs,
) -> CoreResult<PagingQueue> {
    let command = CreatePagingQueueCommand {
        hdr: process_header(VgpuCommand::CreatePagingQueue, process),
        args,
    };
    let reply: CreatePagingQueueReturn =
        traced("create_paging_queue", send_typed(session, Some(adapter), &command))?;

    match map_fence_page(session, process, reply.fence_storage_physical_address) {
        Ok(fence_page_va) => {
            debug!(paging_queue = %reply.paging_queue, sync_object = %reply.sync_object, "paging queue created");
            Ok(PagingQueue {
                paging_queue: reply.paging_queue,
                sync_object: reply.sync_object,
                fence_page_va,
                fence_cpu_va: fence_page_va + reply.fence_storage_offset,
            })
        }
        Err(e) => {
            compensate(
                "destroy_paging_queue",
                send_handle_command(session, adapter, process, VgpuCommand::DestroyPagingQueue, reply.paging_queue),
            );
            traced("create_paging_queue", Err(e))
        }
    }
}

/// Destroy the queue on the host, then unmap its fence page.
pub fn destroy_paging_queue(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    queue: &PagingQueue,
) -> CoreResult<()> {
    let result = send_handle_command(session, adapter, process, VgpuCommand::DestroyPagingQueue, queue.paging_queue);
    if let Err(e) = process.mapper().unmap(queue.fence_page_va, session.page_geometry().page_size()) {
        warn!(paging_queue = %queue.paging_queue, "unmapping fence page failed: {e}");
    }
    traced("destroy_paging_queue", result)
}

/// Outcome of a residency request. The host may finish it asynchronously,
/// in which case `pending` is set and `paging_fence_value` signals completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Residency {
    pub paging_fence_value: u64,
    pub num_bytes_to_trim: u64,
    pub pending: bool,
}

pub fn make_resident(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    paging_queue: D3dkmtHandle,
    flags: u32,
    allocations: &[D3dkmtHandle],
) -> CoreResult<Residency> {
    let run = || -> CoreResult<Residency> {
        let command = MakeResidentCommand {
            hdr: process_header(VgpuCommand::MakeResident, process),
            paging_queue,
            flags,
            alloc_count: wire_u32("allocation count", allocations.len())?,
            reserved: 0,
        };
        let size = command_size::<MakeResidentCommand>(&[array_size::<D3dkmtHandle>(allocations.len())?])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(allocations)?;
        let reply: MakeResidentReturn = msg.send_sync_typed()?;
        let status = CoreError::check_status(reply.status)?;
        Ok(Residency {
            paging_fence_value: reply.paging_fence_value,
            num_bytes_to_trim: reply.num_bytes_to_trim,
            pending: status == NtStatus::PENDING.0,
        })
    };
    traced("make_resident", run())
}

/// Evict allocations and return how many bytes the host still wants trimmed.
pub fn evict(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    flags: u32,
    allocations: &[D3dkmtHandle],
) -> CoreResult<u64> {
    let run = || -> CoreResult<u64> {
        let command = EvictCommand {
            hdr: process_header(VgpuCommand::Evict, process),
            device,
            flags,
            alloc_count: wire_u32("allocation count", allocations.len())?,
            reserved: 0,
        };
        let size = command_size::<EvictCommand>(&[array_size::<D3dkmtHandle>(allocations.len())?])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(allocations)?;
        let reply: EvictReturn = msg.send_sync_typed()?;
        Ok(reply.num_bytes_to_trim)
    };
    traced("evict", run())
}

/// A GPU virtual address granted by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuVa {
    pub virtual_address: u64,
    pub paging_fence_value: u64,
    pub pending: bool,
}

fn gpu_va_reply(reply: GpuVaReturn) -> CoreResult<GpuVa> {
    let status = CoreError::check_status(reply.status)?;
    Ok(GpuVa {
        virtual_address: reply.virtual_address,
        paging_fence_value: reply.paging_fence_value,
        pending: status == NtStatus::PENDING.0,
    })
}

pub fn map_gpu_va(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    args: MapGpuVaArgs,
) -> CoreResult<GpuVa> {
    let command = MapGpuVaCommand {
        hdr: process_header(VgpuCommand::MapGpuVirtualAddress, process),
        args,
        device,
        reserved: 0,
    };
    traced(
        "map_gpu_va",
        send_typed(session, Some(adapter), &command).and_then(gpu_va_reply),
    )
}

pub fn reserve_gpu_va(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: ReserveGpuVaArgs,
) -> CoreResult<u64> {
    let command = ReserveGpuVaCommand {
        hdr: process_header(VgpuCommand::ReserveGpuVirtualAddress, process),
        args,
    };
    traced(
        "reserve_gpu_va",
        send_typed(session, Some(adapter), &command).and_then(gpu_va_reply),
    )
    .map(|va| va.virtual_address)
}

pub fn free_gpu_va(session: &Session, adapter: &Adapter, process: &Process, args: FreeGpuVaArgs) -> CoreResult<()> {
    let command = FreeGpuVaCommand {
        hdr: process_header(VgpuCommand::FreeGpuVirtualAddress, process),
        args,
    };
    traced("free_gpu_va", send_status(session, Some(adapter), &command)).map(|_| ())
}

/// Fence and addressing of a batch of GPU VA updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateGpuVaRequest {
    pub fence_value: u64,
    pub device: D3dkmtHandle,
    pub context: D3dkmtHandle,
    pub fence_object: D3dkmtHandle,
    pub flags: u32,
}

pub fn update_gpu_va(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &UpdateGpuVaRequest,
    operations: &[UpdateGpuVaOperation],
) -> CoreResult<()> {
    let run = || -> CoreResult<()> {
        let max_operations = session.max_packet_size() / std::mem::size_of::<UpdateGpuVaOperation>();
        if operations.is_empty() || operations.len() > max_operations {
            return Err(CoreError::InvalidArgument("GPU VA update operation count out of range"));
        }
        let command = UpdateGpuVaCommand {
            hdr: process_header(VgpuCommand::UpdateGpuVirtualAddress, process),
            fence_value: request.fence_value,
            device: request.device,
            context: request.context,
            fence_object: request.fence_object,
            num_operations: wire_u32("operation count", operations.len())?,
            flags: request.flags,
            reserved: 0,
        };
        let size = command_size::<UpdateGpuVaCommand>(&[array_size::<UpdateGpuVaOperation>(operations.len())?])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(operations)?;
        msg.send_sync_status().map(|_| ())
    };
    traced("update_gpu_va", run())
}
