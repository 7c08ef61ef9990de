//! Integration test: CPU access and residency
//!
//! Lock reference counting over io space mappings, allocation property
//! updates, priorities, offers, reclaims and residency queries.
//!
//! Run with: cargo test -p pvgpu-core --test residency_test -- --nocapture

mod common;

use std::mem::size_of;
use std::sync::Arc;

use common::*;
use pvgpu_core::memory::PinnedPages;
use pvgpu_core::ops::lock;
use pvgpu_core::ops::residency::{self, OfferTarget};
use pvgpu_core::{Allocation, CoreError, CoreResult, HandleObject, HandleTable};
use pvgpu_protocol::allocation_commands::{
    AllocationPriorityCommand, Lock2Args, Lock2Return, OfferAllocationsCommand, QueryAllocationResidencyCommand,
    ReclaimAllocationsCommand, ReclaimAllocationsReturn, UpdateAllocPropertyArgs, UpdateAllocPropertyReturn,
};
use pvgpu_protocol::{D3dkmtHandle, Errno, NtStatus, VgpuCommand};

const ALLOCATION: D3dkmtHandle = D3dkmtHandle(0x4000_1000);
const SECOND_ALLOCATION: D3dkmtHandle = D3dkmtHandle(0x4000_1001);
const RESOURCE: D3dkmtHandle = D3dkmtHandle(0x4000_0500);
const PAGING_QUEUE: D3dkmtHandle = D3dkmtHandle(0x4000_0f01);
const CPU_VISIBLE: u64 = IOSPACE_BASE + 0x4000;

fn register(h: &Harness, allocation: Allocation) -> Arc<Allocation> {
    let allocation = Arc::new(allocation);
    h.handles
        .assign(allocation.handle(), HandleObject::Allocation(Arc::clone(&allocation)))
        .unwrap();
    allocation
}

fn lock_reply(h: &Harness) {
    h.on(VgpuCommand::Lock2, |_| {
        reply(&Lock2Return { status: NtStatus::SUCCESS, reserved: 0, cpu_visible_buffer_offset: CPU_VISIBLE })
    });
}

fn lock_args(allocation: D3dkmtHandle) -> Lock2Args {
    Lock2Args { device: DEVICE, allocation, ..Default::default() }
}

#[test]
fn test_nested_locks_share_one_mapping() {
    let h = Harness::new();
    lock_reply(&h);
    let allocation = register(&h, Allocation::new(ALLOCATION, 0x2800, true, None));

    let mut delivered = Vec::new();
    let first = lock::lock2(&h.session, &h.adapter, &h.process, lock_args(ALLOCATION), |va| {
        delivered.push(va);
        Ok(())
    })
    .unwrap();
    let second = lock::lock2(&h.session, &h.adapter, &h.process, lock_args(ALLOCATION), |_| Ok(())).unwrap();

    assert_eq!(first, USER_MAP_BASE + CPU_VISIBLE);
    assert_eq!(first, second);
    assert_eq!(delivered, vec![first]);
    // Only whole pages of the allocation are mapped.
    assert_eq!(h.memory.live_mappings(), vec![(first, 0x2000)]);
    assert_eq!(allocation.cpu_mapping().map(|m| m.refcount), Some(2));

    lock::unlock2(&h.session, &h.adapter, &h.process, DEVICE, ALLOCATION).unwrap();
    assert_eq!(h.memory.live_mappings().len(), 1);
    lock::unlock2(&h.session, &h.adapter, &h.process, DEVICE, ALLOCATION).unwrap();
    assert!(h.memory.live_mappings().is_empty());
    assert_eq!(allocation.cpu_mapping(), None);
    assert_eq!(h.vgpu.sent(VgpuCommand::Unlock2).len(), 2);
}

#[test]
fn test_failed_delivery_drops_the_mapping() {
    let h = Harness::new();
    lock_reply(&h);
    let allocation = register(&h, Allocation::new(ALLOCATION, 0x1000, false, None));

    let result = lock::lock2(&h.session, &h.adapter, &h.process, lock_args(ALLOCATION), |_| {
        Err(CoreError::InvalidArgument("caller buffer unwritable"))
    });
    match result {
        Err(CoreError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    assert!(h.memory.live_mappings().is_empty());
    assert_eq!(allocation.cpu_mapping(), None);
}

#[test]
fn test_lock_of_unknown_allocation() {
    let h = Harness::new();
    lock_reply(&h);
    let err = lock::lock2(&h.session, &h.adapter, &h.process, lock_args(ALLOCATION), |_| Ok(())).unwrap_err();
    assert_eq!(err.errno(), Errno::InvalidArgument);
    assert!(h.memory.live_mappings().is_empty());
}

#[test]
fn test_sysmem_lock_returns_pinned_address() {
    let h = Harness::new();
    lock_reply(&h);
    let pages = PinnedPages { user_va: 0x5555_0000, writable: true, frames: vec![0x5555, 0x5556] };
    register(&h, Allocation::new(ALLOCATION, 0x2000, true, Some(pages)));

    let va = lock::lock2(&h.session, &h.adapter, &h.process, lock_args(ALLOCATION), |_| Ok(())).unwrap();
    assert_eq!(va, 0x5555_0000);
    assert!(h.memory.live_mappings().is_empty());
}

#[test]
fn test_lock_host_failure_maps_nothing() {
    let h = Harness::new();
    h.on(VgpuCommand::Lock2, |_| {
        reply(&Lock2Return { status: NtStatus::NO_MEMORY, reserved: 0, cpu_visible_buffer_offset: 0 })
    });
    register(&h, Allocation::new(ALLOCATION, 0x1000, true, None));

    let err = lock::lock2(&h.session, &h.adapter, &h.process, lock_args(ALLOCATION), |_| Ok(())).unwrap_err();
    assert_eq!(err.errno(), Errno::OutOfMemory);
    assert!(h.memory.live_mappings().is_empty());
}

#[test]
fn test_update_alloc_property_pending_returns_fence() {
    let h = Harness::new();
    h.on(VgpuCommand::UpdateAllocationProperty, |_| {
        reply(&UpdateAllocPropertyReturn { paging_fence_value: 77, status: NtStatus::PENDING, reserved: 0 })
    });
    let args = UpdateAllocPropertyArgs { paging_queue: PAGING_QUEUE, allocation: ALLOCATION, ..Default::default() };
    assert_eq!(lock::update_alloc_property(&h.session, &h.adapter, &h.process, args).unwrap(), Some(77));

    h.on(VgpuCommand::UpdateAllocationProperty, |_| {
        reply(&UpdateAllocPropertyReturn { paging_fence_value: 78, status: NtStatus::SUCCESS, reserved: 0 })
    });
    assert_eq!(lock::update_alloc_property(&h.session, &h.adapter, &h.process, args).unwrap(), None);
}

#[test]
fn test_priority_requests_are_validated() {
    let h = Harness::new();
    let set = |resource, allocations: &[D3dkmtHandle], priorities: &[u32]| {
        residency::set_allocation_priority(&h.session, &h.adapter, &h.process, DEVICE, resource, allocations, priorities)
    };

    let cases: [(&str, CoreResult<()>); 3] = [
        ("resource with allocations", set(RESOURCE, &[ALLOCATION], &[1])),
        ("nothing named", set(D3dkmtHandle::NULL, &[], &[])),
        ("count mismatch", set(D3dkmtHandle::NULL, &[ALLOCATION, SECOND_ALLOCATION], &[1])),
    ];
    for (name, result) in cases {
        println!("{name}: {result:?}");
        assert_eq!(result.unwrap_err().errno(), Errno::InvalidArgument, "{name}");
    }
    assert!(h.vgpu.requests().is_empty());

    set(RESOURCE, &[], &[0x7800_0000]).unwrap();
    let sent = h.only(VgpuCommand::SetAllocationPriority);
    let cmd: AllocationPriorityCommand = read_command(&sent.payload);
    assert_eq!(cmd.resource, RESOURCE);
    assert_eq!(cmd.allocation_count, 0);
    assert_eq!(trailing::<u32>(&sent.payload, size_of::<AllocationPriorityCommand>(), 1), vec![0x7800_0000]);
}

#[test]
fn test_get_allocation_priority_reads_one_value_per_allocation() {
    let h = Harness::new();
    h.on(VgpuCommand::GetAllocationPriority, |_| {
        let mut out = status(NtStatus::SUCCESS);
        extend(&mut out, &[0x5000_0000u32, 0x2800_0000]);
        out
    });

    let priorities = residency::get_allocation_priority(
        &h.session,
        &h.adapter,
        &h.process,
        DEVICE,
        D3dkmtHandle::NULL,
        &[ALLOCATION, SECOND_ALLOCATION],
    )
    .unwrap();
    assert_eq!(priorities, vec![0x5000_0000, 0x2800_0000]);
}

#[test]
fn test_residency_query_for_a_whole_resource() {
    let h = Harness::new();
    h.on(VgpuCommand::QueryAllocationResidency, |_| {
        let mut out = status(NtStatus::SUCCESS);
        extend(&mut out, &[3u32]);
        out
    });

    let residency = residency::query_alloc_residency(&h.session, &h.adapter, &h.process, DEVICE, RESOURCE, &[]).unwrap();
    assert_eq!(residency, vec![3]);
    let cmd: QueryAllocationResidencyCommand = read_command(&h.only(VgpuCommand::QueryAllocationResidency).payload);
    assert_eq!(cmd.resource, RESOURCE);
    assert_eq!(cmd.allocation_count, 0);
}

#[test]
fn test_reclaim_with_results() {
    let h = Harness::new();
    h.on(VgpuCommand::ReclaimAllocations, |_| {
        let mut out = reply(&ReclaimAllocationsReturn { paging_fence_value: 9, status: NtStatus::SUCCESS, reserved: 0 });
        extend(&mut out, &[0u32, 1]);
        out
    });

    let target = OfferTarget::Allocations(&[ALLOCATION, SECOND_ALLOCATION]);
    let reclaimed = residency::reclaim_allocations(
        &h.session,
        &h.adapter,
        &h.process,
        DEVICE,
        PAGING_QUEUE,
        target,
        true,
    )
    .unwrap();
    assert_eq!(reclaimed.paging_fence_value, 9);
    assert_eq!(reclaimed.results, Some(vec![0, 1]));

    let cmd: ReclaimAllocationsCommand = read_command(&h.only(VgpuCommand::ReclaimAllocations).payload);
    assert_eq!(cmd.write_results, 1);
    assert_eq!(cmd.resources, 0);
    assert_eq!(cmd.allocation_count, 2);
}

#[test]
fn test_reclaim_failure_is_reported() {
    let h = Harness::new();
    h.on(VgpuCommand::ReclaimAllocations, |_| {
        reply(&ReclaimAllocationsReturn { paging_fence_value: 0, status: NtStatus::INVALID_PARAMETER, reserved: 0 })
    });
    let err = residency::reclaim_allocations(
        &h.session,
        &h.adapter,
        &h.process,
        DEVICE,
        PAGING_QUEUE,
        OfferTarget::Resources(&[RESOURCE]),
        false,
    )
    .unwrap_err();
    assert_eq!(err.errno(), Errno::InvalidArgument);
}

#[test]
fn test_offer_marks_resource_handles() {
    let h = Harness::new();
    residency::offer_allocations(&h.session, &h.adapter, &h.process, DEVICE, OfferTarget::Resources(&[RESOURCE]), 2, 0)
        .unwrap();

    let sent = h.only(VgpuCommand::OfferAllocations);
    let cmd: OfferAllocationsCommand = read_command(&sent.payload);
    assert_eq!(cmd.resources, 1);
    assert_eq!(cmd.priority, 2);
    assert_eq!(trailing::<D3dkmtHandle>(&sent.payload, size_of::<OfferAllocationsCommand>(), 1), vec![RESOURCE]);
}
