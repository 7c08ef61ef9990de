//! CPU access to allocations.

use pvgpu_protocol::allocation_commands::{
    Lock2Args, Lock2Command, Lock2Return, Unlock2Command, UpdateAllocPropertyArgs, UpdateAllocPropertyCommand,
    UpdateAllocPropertyReturn,
};
use pvgpu_protocol::{D3dkmtHandle, NtStatus, VgpuCommand};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::objects::{Allocation, CpuMapping, HandleKind, HandleObject};
use crate::ops::{map_iospace, process_header, send_status, send_typed, traced};
use crate::session::{Adapter, Process, Session};

fn mapping_size(session: &Session, allocation: &Allocation) -> u64 {
    let geometry = session.page_geometry();
    allocation.num_pages(geometry) << geometry.shift()
}

/// Lock an allocation for CPU access and return its user address.
///
/// The first lock of a device-memory allocation maps the host's CPU-visible
/// buffer; nested locks share that mapping. `deliver` hands the address to
/// the caller. If it fails, the lock's reference is dropped again.
pub fn lock2(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: Lock2Args,
    deliver: impl FnOnce(u64) -> CoreResult<()>,
) -> CoreResult<u64> {
    let run = || -> CoreResult<u64> {
        let command = Lock2Command {
            hdr: process_header(VgpuCommand::Lock2, process),
            args,
        };
        let reply: Lock2Return = send_typed(session, Some(adapter), &command)?;
        CoreError::check_status(reply.status)?;

        let Some(HandleObject::Allocation(allocation)) = process.handles().get(args.allocation, HandleKind::Allocation)
        else {
            return Err(CoreError::InvalidArgument("lock of an unknown allocation"));
        };

        if let Some(user_va) = allocation.sysmem_user_va() {
            deliver(user_va)?;
            return Ok(user_va);
        }

        let user_va = {
            let mut slot = allocation.cpu_slot().lock();
            match slot.as_mut() {
                Some(mapping) => {
                    mapping.refcount += 1;
                    mapping.user_va
                }
                None => {
                    let user_va = map_iospace(
                        session,
                        process,
                        reply.cpu_visible_buffer_offset,
                        mapping_size(session, &allocation),
                        allocation.is_cached(),
                    )?;
                    *slot = Some(CpuMapping { user_va, refcount: 1 });
                    user_va
                }
            }
        };

        if let Err(e) = deliver(user_va) {
            release_cpu_mapping(session, process, &allocation);
            return Err(e);
        }
        debug!(allocation = %args.allocation, user_va, "allocation locked");
        Ok(user_va)
    };
    traced("lock2", run())
}

/// Drop one CPU mapping reference, unmapping when it was the last.
fn release_cpu_mapping(session: &Session, process: &Process, allocation: &Allocation) {
    let mut slot = allocation.cpu_slot().lock();
    let Some(mapping) = slot.as_mut() else {
        return;
    };
    mapping.refcount = mapping.refcount.saturating_sub(1);
    if mapping.refcount == 0 {
        let user_va = mapping.user_va;
        *slot = None;
        if let Err(e) = process.mapper().unmap(user_va, mapping_size(session, allocation)) {
            warn!(allocation = %allocation.handle(), "unmapping allocation failed: {e}");
        }
    }
}

pub fn unlock2(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    allocation: D3dkmtHandle,
) -> CoreResult<()> {
    let command = Unlock2Command {
        hdr: process_header(VgpuCommand::Unlock2, process),
        device,
        allocation,
    };
    traced("unlock2", send_status(session, Some(adapter), &command))?;
    if let Some(HandleObject::Allocation(object)) = process.handles().get(allocation, HandleKind::Allocation) {
        release_cpu_mapping(session, process, &object);
    }
    Ok(())
}

/// Change an allocation's segment preferences. When the host completes the
/// change asynchronously the paging fence value to wait for is returned.
pub fn update_alloc_property(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: UpdateAllocPropertyArgs,
) -> CoreResult<Option<u64>> {
    let command = UpdateAllocPropertyCommand {
        hdr: process_header(VgpuCommand::UpdateAllocationProperty, process),
        args,
    };
    let reply: UpdateAllocPropertyReturn =
        traced("update_alloc_property", send_typed(session, Some(adapter), &command))?;
    let status = traced("update_alloc_property", CoreError::check_status(reply.status))?;
    Ok((status == NtStatus::PENDING.0).then_some(reply.paging_fence_value))
}
