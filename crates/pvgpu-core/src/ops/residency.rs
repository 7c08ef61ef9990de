//! Allocation priorities, offers, reclaims and residency queries.

use pvgpu_protocol::allocation_commands::{
    AllocationPriorityCommand, OfferAllocationsCommand, QueryAllocationResidencyCommand, ReclaimAllocationsCommand,
    ReclaimAllocationsReturn,
};
use pvgpu_protocol::{D3dkmtHandle, NtStatus, PayloadReader, VgpuCommand};

use crate::codec::{array_size, command_size, wire_u32};
use crate::error::{CoreError, CoreResult};
use crate::message::{Message, MessageWithResult};
use crate::ops::{process_header, traced};
use crate::session::{Adapter, Process, Session};

/// Number of priority slots a request carries: one for a whole resource,
/// otherwise one per allocation.
fn priority_slots(session: &Session, resource: D3dkmtHandle, allocations: &[D3dkmtHandle]) -> CoreResult<usize> {
    if allocations.len() > session.max_packet_size() {
        return Err(CoreError::InvalidArgument("too many allocations"));
    }
    if !resource.is_null() {
        if !allocations.is_empty() {
            return Err(CoreError::InvalidArgument("resource priority takes no allocation list"));
        }
        return Ok(1);
    }
    if allocations.is_empty() {
        return Err(CoreError::InvalidArgument("priority request names no allocations"));
    }
    Ok(allocations.len())
}

fn priority_command(
    command: VgpuCommand,
    process: &Process,
    device: D3dkmtHandle,
    resource: D3dkmtHandle,
    allocations: &[D3dkmtHandle],
) -> CoreResult<AllocationPriorityCommand> {
    Ok(AllocationPriorityCommand {
        hdr: process_header(command, process),
        device,
        resource,
        allocation_count: wire_u32("allocation count", allocations.len())?,
        reserved: 0,
    })
}

/// Set the eviction priority of a resource (one value) or of each allocation.
pub fn set_allocation_priority(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    resource: D3dkmtHandle,
    allocations: &[D3dkmtHandle],
    priorities: &[u32],
) -> CoreResult<()> {
    let run = || -> CoreResult<()> {
        let slots = priority_slots(session, resource, allocations)?;
        if priorities.len() != slots {
            return Err(CoreError::InvalidArgument("priority count does not match the request"));
        }
        let command = priority_command(VgpuCommand::SetAllocationPriority, process, device, resource, allocations)?;
        let size = command_size::<AllocationPriorityCommand>(&[
            array_size::<D3dkmtHandle>(allocations.len())?,
            array_size::<u32>(slots)?,
        ])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(allocations)?;
        w.put_slice(priorities)?;
        msg.send_sync_status().map(|_| ())
    };
    traced("set_allocation_priority", run())
}

pub fn get_allocation_priority(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    resource: D3dkmtHandle,
    allocations: &[D3dkmtHandle],
) -> CoreResult<Vec<u32>> {
    let run = || -> CoreResult<Vec<u32>> {
        let slots = priority_slots(session, resource, allocations)?;
        let command = priority_command(VgpuCommand::GetAllocationPriority, process, device, resource, allocations)?;
        let size = command_size::<AllocationPriorityCommand>(&[array_size::<D3dkmtHandle>(allocations.len())?])?;
        let result_size = command_size::<NtStatus>(&[array_size::<u32>(slots)?])?;
        let mut msg = MessageWithResult::new(session, adapter, size, result_size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(allocations)?;
        msg.send_sync()?;

        let mut reader = PayloadReader::new(msg.result());
        CoreError::check_status(reader.read()?)?;
        Ok(reader.read_vec(slots)?)
    };
    traced("get_allocation_priority", run())
}

/// Handles of an offer or reclaim: allocations, or whole resources.
#[derive(Debug, Clone, Copy)]
pub enum OfferTarget<'a> {
    Allocations(&'a [D3dkmtHandle]),
    Resources(&'a [D3dkmtHandle]),
}

impl<'a> OfferTarget<'a> {
    fn handles(self) -> &'a [D3dkmtHandle] {
        match self {
            OfferTarget::Allocations(h) | OfferTarget::Resources(h) => h,
        }
    }

    fn resources_flag(self) -> u32 {
        u32::from(matches!(self, OfferTarget::Resources(_)))
    }
}

/// Offer allocations for the host to discard under memory pressure.
pub fn offer_allocations(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    target: OfferTarget<'_>,
    priority: u32,
    flags: u32,
) -> CoreResult<()> {
    let run = || -> CoreResult<()> {
        let handles = target.handles();
        let command = OfferAllocationsCommand {
            hdr: process_header(VgpuCommand::OfferAllocations, process),
            device,
            priority,
            flags,
            allocation_count: wire_u32("allocation count", handles.len())?,
            resources: target.resources_flag(),
            reserved: 0,
        };
        let size = command_size::<OfferAllocationsCommand>(&[array_size::<D3dkmtHandle>(handles.len())?])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(handles)?;
        msg.send_sync_status().map(|_| ())
    };
    traced("offer_allocations", run())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub paging_fence_value: u64,
    /// One reclaim result per handle, when requested
    pub results: Option<Vec<u32>>,
}

/// Reclaim previously offered allocations.
pub fn reclaim_allocations(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    paging_queue: D3dkmtHandle,
    target: OfferTarget<'_>,
    want_results: bool,
) -> CoreResult<Reclaimed> {
    let run = || -> CoreResult<Reclaimed> {
        let handles = target.handles();
        let command = ReclaimAllocationsCommand {
            hdr: process_header(VgpuCommand::ReclaimAllocations, process),
            device,
            paging_queue,
            allocation_count: wire_u32("allocation count", handles.len())?,
            resources: target.resources_flag(),
            write_results: u32::from(want_results),
            reserved: 0,
        };
        let size = command_size::<ReclaimAllocationsCommand>(&[array_size::<D3dkmtHandle>(handles.len())?])?;
        let results_len = if want_results { array_size::<u32>(handles.len())? } else { 0 };
        let result_size = command_size::<ReclaimAllocationsReturn>(&[results_len])?;
        let mut msg = MessageWithResult::new(session, adapter, size, result_size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(handles)?;
        msg.send_sync()?;

        let mut reader = PayloadReader::new(msg.result());
        let reply: ReclaimAllocationsReturn = reader.read()?;
        CoreError::check_status(reply.status)?;
        let results = if want_results { Some(reader.read_vec(handles.len())?) } else { None };
        Ok(Reclaimed { paging_fence_value: reply.paging_fence_value, results })
    };
    traced("reclaim_allocations", run())
}

/// Residency status of each allocation, or of the resource as a whole when
/// no allocations are named.
pub fn query_alloc_residency(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    resource: D3dkmtHandle,
    allocations: &[D3dkmtHandle],
) -> CoreResult<Vec<u32>> {
    let run = || -> CoreResult<Vec<u32>> {
        if allocations.len() > session.max_packet_size() {
            return Err(CoreError::InvalidArgument("too many allocations"));
        }
        let slots = allocations.len().max(1);
        let command = QueryAllocationResidencyCommand {
            hdr: process_header(VgpuCommand::QueryAllocationResidency, process),
            device,
            resource,
            allocation_count: wire_u32("allocation count", allocations.len())?,
            reserved: 0,
        };
        let size =
            command_size::<QueryAllocationResidencyCommand>(&[array_size::<D3dkmtHandle>(allocations.len())?])?;
        let result_size = command_size::<NtStatus>(&[array_size::<u32>(slots)?])?;
        let mut msg = MessageWithResult::new(session, adapter, size, result_size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(allocations)?;
        msg.send_sync()?;

        let mut reader = PayloadReader::new(msg.result());
        CoreError::check_status(reader.read()?)?;
        Ok(reader.read_vec(slots)?)
    };
    traced("query_alloc_residency", run())
}
