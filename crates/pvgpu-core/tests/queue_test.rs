//! Integration test: contexts, queues and submission
//!
//! Echoed context and hardware queue creation, paging queue fence mapping,
//! residency status and command submission dispatch.
//!
//! Run with: cargo test -p pvgpu-core --test queue_test -- --nocapture

mod common;

use std::mem::size_of;
use std::sync::atomic::Ordering;

use bytemuck::Zeroable;
use common::*;
use pvgpu_core::ops::context::{self, ContextRequest};
use pvgpu_core::ops::paging::{self, UpdateGpuVaRequest};
use pvgpu_core::{CoreError, HandleKind, HandleObject, HandleTable, HandleTableError};
use pvgpu_protocol::adapter_commands::{
    CreateContextVirtualCommand, CreateHwQueueCommand, CreatePagingQueueArgs, CreatePagingQueueReturn,
    EvictCommand, EvictReturn, GpuVaReturn, HandleCommand, MakeResidentCommand, MakeResidentReturn, MapGpuVaArgs,
    MapGpuVaCommand, ReserveGpuVaArgs, SubmitCommandArgs, SubmitCommandCommand,
};
use pvgpu_protocol::{D3dkmtHandle, Errno, NtStatus, VgpuCommand};

const CONTEXT: D3dkmtHandle = D3dkmtHandle(0x4000_0c01);
const HWQUEUE: D3dkmtHandle = D3dkmtHandle(0x4000_0e01);
const PROGRESS_FENCE: D3dkmtHandle = D3dkmtHandle(0x4000_0e02);
const PAGING_QUEUE: D3dkmtHandle = D3dkmtHandle(0x4000_0f01);
const PAGING_SYNC_OBJECT: D3dkmtHandle = D3dkmtHandle(0x4000_0f02);

/// Echo the context command with `context` filled in and the private data reversed.
fn echo_context(context: D3dkmtHandle) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
    move |payload| {
        let mut cmd: CreateContextVirtualCommand = read_command(payload);
        cmd.context = context;
        let mut out = reply(&cmd);
        let mut data = payload[size_of::<CreateContextVirtualCommand>()..].to_vec();
        data.reverse();
        out.extend_from_slice(&data);
        out
    }
}

fn echo_hwqueue(fence_cpuva: u64) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
    move |payload| {
        let mut cmd: CreateHwQueueCommand = read_command(payload);
        cmd.status = NtStatus::SUCCESS;
        cmd.hwqueue = HWQUEUE;
        cmd.hwqueue_progress_fence = PROGRESS_FENCE;
        cmd.hwqueue_progress_fence_cpuva = fence_cpuva;
        cmd.hwqueue_progress_fence_gpuva = 0x9000;
        let mut out = reply(&cmd);
        out.extend_from_slice(&payload[size_of::<CreateHwQueueCommand>()..]);
        out
    }
}

fn paging_queue_reply(phys: u64) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
    move |_| {
        reply(&CreatePagingQueueReturn {
            paging_queue: PAGING_QUEUE,
            sync_object: PAGING_SYNC_OBJECT,
            fence_storage_physical_address: phys,
            fence_storage_offset: 0x18,
        })
    }
}

#[test]
fn test_create_context_returns_echoed_private_data() {
    let h = Harness::new();
    h.on(VgpuCommand::CreateContextVirtual, echo_context(CONTEXT));

    let request = ContextRequest { device: DEVICE, node_ordinal: 2, engine_affinity: 1, flags: 0 };
    let mut private_data = [1u8, 2, 3, 4, 5];
    let context = context::create_context(&h.session, &h.adapter, &h.process, &request, &mut private_data).unwrap();
    assert_eq!(context, CONTEXT);
    assert_eq!(private_data, [5, 4, 3, 2, 1]);

    let cmd: CreateContextVirtualCommand = read_command(&h.only(VgpuCommand::CreateContextVirtual).payload);
    assert_eq!(cmd.device, DEVICE);
    assert_eq!(cmd.node_ordinal, 2);
    assert_eq!(cmd.priv_drv_data_size, 5);
    assert_eq!(cmd.client_hint, 1);
}

#[test]
fn test_create_context_rejects_null_context() {
    let h = Harness::new();
    h.on(VgpuCommand::CreateContextVirtual, echo_context(D3dkmtHandle::NULL));

    let mut private_data = [0u8; 4];
    let request = ContextRequest { device: DEVICE, ..Default::default() };
    match context::create_context(&h.session, &h.adapter, &h.process, &request, &mut private_data) {
        Err(e @ CoreError::NullHandle(_)) => assert_eq!(e.errno(), Errno::NotRecoverable),
        other => panic!("expected NullHandle, got {:?}", other),
    }
}

#[test]
fn test_hwqueue_registers_and_maps_progress_fence() {
    let h = Harness::new();
    h.on(VgpuCommand::CreateHwQueue, echo_hwqueue(IOSPACE_BASE + 0x2000));

    let mut private_data = [7u8; 8];
    let queue = context::create_hwqueue(&h.session, &h.adapter, &h.process, CONTEXT, 0, &mut private_data).unwrap();
    assert_eq!(queue.handle(), HWQUEUE);
    assert_eq!(queue.progress_fence(), PROGRESS_FENCE);
    assert_eq!(queue.progress_fence_gpu_va(), 0x9000);
    let cpu_va = USER_MAP_BASE + IOSPACE_BASE + 0x2000;
    assert_eq!(queue.progress_fence_cpu_va(), Some(cpu_va));

    assert!(matches!(h.handles.get(HWQUEUE, HandleKind::HwQueue), Some(HandleObject::HwQueue(_))));
    assert!(matches!(
        h.handles.get(PROGRESS_FENCE, HandleKind::MonitoredFence),
        Some(HandleObject::MonitoredFence(_))
    ));
    assert_eq!(h.memory.live_mappings(), vec![(cpu_va, 4096)]);

    context::destroy_hwqueue(&h.session, &h.adapter, &h.process, HWQUEUE).unwrap();
    assert!(h.handles.is_empty());
    assert!(h.memory.live_mappings().is_empty());
    let cmd: HandleCommand = read_command(&h.only(VgpuCommand::DestroyHwQueue).payload);
    assert_eq!(cmd.handle, HWQUEUE);
}

#[test]
fn test_hwqueue_mapping_failure_destroys_the_queue() {
    let h = Harness::new();
    h.on(VgpuCommand::CreateHwQueue, echo_hwqueue(IOSPACE_BASE + 0x2000));
    h.memory.fail_map.store(true, Ordering::SeqCst);

    let mut private_data = [0u8; 0];
    let err = context::create_hwqueue(&h.session, &h.adapter, &h.process, CONTEXT, 0, &mut private_data).unwrap_err();
    println!("create_hwqueue failed: {err}");
    assert!(h.handles.is_empty());
    let cmd: HandleCommand = read_command(&h.only(VgpuCommand::DestroyHwQueue).payload);
    assert_eq!(cmd.handle, HWQUEUE);
}

#[test]
fn test_hwqueue_handle_collision_keeps_existing_entries() {
    let h = Harness::new();
    h.on(VgpuCommand::CreateHwQueue, echo_hwqueue(IOSPACE_BASE + 0x2000));

    let mut private_data = [0u8; 0];
    let first = context::create_hwqueue(&h.session, &h.adapter, &h.process, CONTEXT, 0, &mut private_data).unwrap();

    match context::create_hwqueue(&h.session, &h.adapter, &h.process, CONTEXT, 0, &mut private_data) {
        Err(CoreError::HandleTable(HandleTableError::Occupied(handle))) => assert_eq!(handle, HWQUEUE),
        other => panic!("expected HandleTable(Occupied), got {:?}", other),
    }

    match h.handles.get(HWQUEUE, HandleKind::HwQueue) {
        Some(HandleObject::HwQueue(queue)) => assert!(std::sync::Arc::ptr_eq(&queue, &first)),
        other => panic!("expected the first queue, got {:?}", other),
    }
    assert!(h.handles.get(PROGRESS_FENCE, HandleKind::MonitoredFence).is_some());
    assert_eq!(h.memory.live_mappings().len(), 1);

    context::destroy_hwqueue(&h.session, &h.adapter, &h.process, HWQUEUE).unwrap();
    assert!(h.handles.is_empty());
    assert!(h.memory.live_mappings().is_empty());
}

#[test]
fn test_hwqueue_fence_collision_frees_only_the_new_queue() {
    let h = Harness::new();
    h.on(VgpuCommand::CreateHwQueue, echo_hwqueue(IOSPACE_BASE + 0x2000));
    let mut private_data = [0u8; 0];
    context::create_hwqueue(&h.session, &h.adapter, &h.process, CONTEXT, 0, &mut private_data).unwrap();

    // The host hands out a fresh queue handle but reuses the progress fence.
    let second_queue = D3dkmtHandle(0x4000_0e11);
    h.on(VgpuCommand::CreateHwQueue, move |payload| {
        let mut cmd: CreateHwQueueCommand = read_command(payload);
        cmd.status = NtStatus::SUCCESS;
        cmd.hwqueue = second_queue;
        cmd.hwqueue_progress_fence = PROGRESS_FENCE;
        cmd.hwqueue_progress_fence_cpuva = IOSPACE_BASE + 0x3000;
        reply(&cmd)
    });
    let err = context::create_hwqueue(&h.session, &h.adapter, &h.process, CONTEXT, 0, &mut private_data).unwrap_err();
    println!("second create_hwqueue failed: {err}");

    assert!(h.handles.get(second_queue, HandleKind::HwQueue).is_none());
    assert!(h.handles.get(HWQUEUE, HandleKind::HwQueue).is_some());
    match h.handles.get(PROGRESS_FENCE, HandleKind::MonitoredFence) {
        Some(HandleObject::MonitoredFence(queue)) => assert_eq!(queue.handle(), HWQUEUE),
        other => panic!("expected the first queue's fence, got {:?}", other),
    }
    let destroys = h.vgpu.sent(VgpuCommand::DestroyHwQueue);
    assert_eq!(destroys.len(), 1);
    let cmd: HandleCommand = read_command(&destroys[0].payload);
    assert_eq!(cmd.handle, second_queue);
}

#[test]
fn test_hwqueue_host_failure_registers_nothing() {
    let h = Harness::new();
    h.on(VgpuCommand::CreateHwQueue, |payload| {
        let mut cmd: CreateHwQueueCommand = read_command(payload);
        cmd.status = NtStatus::NO_MEMORY;
        reply(&cmd)
    });

    let mut private_data = [0u8; 0];
    let err = context::create_hwqueue(&h.session, &h.adapter, &h.process, CONTEXT, 0, &mut private_data).unwrap_err();
    assert_eq!(err.errno(), Errno::OutOfMemory);
    assert!(h.handles.is_empty());
    assert!(h.vgpu.sent(VgpuCommand::DestroyHwQueue).is_empty());
}

#[test]
fn test_paging_queue_fence_address_includes_offset() {
    let h = Harness::new();
    h.on(VgpuCommand::CreatePagingQueue, paging_queue_reply(IOSPACE_BASE + 0x3000));

    let args = CreatePagingQueueArgs { device: DEVICE, ..Default::default() };
    let queue = paging::create_paging_queue(&h.session, &h.adapter, &h.process, args).unwrap();
    assert_eq!(queue.paging_queue, PAGING_QUEUE);
    assert_eq!(queue.sync_object, PAGING_SYNC_OBJECT);
    assert_eq!(queue.fence_page_va, USER_MAP_BASE + IOSPACE_BASE + 0x3000);
    assert_eq!(queue.fence_cpu_va, queue.fence_page_va + 0x18);

    paging::destroy_paging_queue(&h.session, &h.adapter, &h.process, &queue).unwrap();
    assert!(h.memory.live_mappings().is_empty());
}

#[test]
fn test_paging_queue_outside_io_space_is_destroyed() {
    let h = Harness::new();
    h.on(VgpuCommand::CreatePagingQueue, paging_queue_reply(IOSPACE_BASE + IOSPACE_SIZE));

    let args = CreatePagingQueueArgs { device: DEVICE, ..Default::default() };
    let err = paging::create_paging_queue(&h.session, &h.adapter, &h.process, args).unwrap_err();
    assert_eq!(err.errno(), Errno::InvalidArgument);
    let cmd: HandleCommand = read_command(&h.only(VgpuCommand::DestroyPagingQueue).payload);
    assert_eq!(cmd.handle, PAGING_QUEUE);
}

#[test]
fn test_make_resident_reports_pending_paging() {
    let h = Harness::new();
    h.on(VgpuCommand::MakeResident, |_| {
        reply(&MakeResidentReturn {
            paging_fence_value: 42,
            num_bytes_to_trim: 0x1000,
            status: NtStatus::PENDING,
            reserved: 0,
        })
    });

    let allocations = [D3dkmtHandle(0x4000_1000), D3dkmtHandle(0x4000_1001)];
    let residency = paging::make_resident(&h.session, &h.adapter, &h.process, PAGING_QUEUE, 0, &allocations).unwrap();
    assert!(residency.pending);
    assert_eq!(residency.paging_fence_value, 42);
    assert_eq!(residency.num_bytes_to_trim, 0x1000);

    let sent = h.only(VgpuCommand::MakeResident);
    let cmd: MakeResidentCommand = read_command(&sent.payload);
    assert_eq!(cmd.alloc_count, 2);
    assert_eq!(trailing::<D3dkmtHandle>(&sent.payload, size_of::<MakeResidentCommand>(), 2), allocations);
}

#[test]
fn test_make_resident_completed_synchronously() {
    let h = Harness::new();
    h.on(VgpuCommand::MakeResident, |_| {
        reply(&MakeResidentReturn { paging_fence_value: 1, num_bytes_to_trim: 0, status: NtStatus::SUCCESS, reserved: 0 })
    });
    let residency = paging::make_resident(&h.session, &h.adapter, &h.process, PAGING_QUEUE, 0, &[]).unwrap();
    assert!(!residency.pending);
}

#[test]
fn test_async_submit_goes_to_global_channel() {
    let h = Harness::builder().async_msg().build();
    let mut args = SubmitCommandArgs::zeroed();
    args.command_buffer = 0x10_0000;
    args.command_length = 0x200;
    let history = [D3dkmtHandle(0x4000_1000)];
    context::submit_command(&h.session, &h.adapter, &h.process, &args, &history, &[9, 9]).unwrap();

    assert!(h.vgpu.requests().is_empty());
    let sent = h.global.sent(VgpuCommand::SubmitCommand);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_async);
    assert!(!sent[0].expects_reply);

    let cmd: SubmitCommandCommand = read_command(&sent[0].payload);
    assert_eq!(cmd.args.command_length, 0x200);
    assert_eq!(cmd.args.num_history_buffers, 1);
    assert_eq!(cmd.args.priv_drv_data_size, 2);
    assert_eq!(sent[0].payload.len(), size_of::<SubmitCommandCommand>() + 4 + 2);
}

#[test]
fn test_sync_submit_waits_for_status() {
    let h = Harness::new();
    h.on(VgpuCommand::SubmitCommand, |_| status(NtStatus::INVALID_PARAMETER));
    let err = context::submit_command(&h.session, &h.adapter, &h.process, &SubmitCommandArgs::zeroed(), &[], &[])
        .unwrap_err();
    assert_eq!(err.errno(), Errno::InvalidArgument);
    assert!(h.only(VgpuCommand::SubmitCommand).expects_reply);
}

#[test]
fn test_update_gpu_va_needs_operations() {
    let h = Harness::new();
    let request = UpdateGpuVaRequest { device: DEVICE, context: CONTEXT, ..Default::default() };
    let err = paging::update_gpu_va(&h.session, &h.adapter, &h.process, &request, &[]).unwrap_err();
    assert_eq!(err.errno(), Errno::InvalidArgument);
    assert!(h.vgpu.requests().is_empty());
}

#[test]
fn test_map_gpu_va_may_complete_later() {
    let h = Harness::new();
    h.on(VgpuCommand::MapGpuVirtualAddress, |_| {
        reply(&GpuVaReturn {
            virtual_address: 0x8_0000_0000,
            paging_fence_value: 11,
            status: NtStatus::PENDING,
            reserved: 0,
        })
    });

    let va = paging::map_gpu_va(&h.session, &h.adapter, &h.process, DEVICE, MapGpuVaArgs::default()).unwrap();
    assert_eq!(va.virtual_address, 0x8_0000_0000);
    assert_eq!(va.paging_fence_value, 11);
    assert!(va.pending);
    let cmd: MapGpuVaCommand = read_command(&h.only(VgpuCommand::MapGpuVirtualAddress).payload);
    assert_eq!(cmd.device, DEVICE);
}

#[test]
fn test_reserve_gpu_va_failure() {
    let h = Harness::new();
    h.on(VgpuCommand::ReserveGpuVirtualAddress, |_| {
        reply(&GpuVaReturn { virtual_address: 0, paging_fence_value: 0, status: NtStatus::NO_MEMORY, reserved: 0 })
    });
    let err = paging::reserve_gpu_va(&h.session, &h.adapter, &h.process, ReserveGpuVaArgs::default()).unwrap_err();
    assert_eq!(err.errno(), Errno::OutOfMemory);
}

#[test]
fn test_evict_reports_bytes_to_trim() {
    let h = Harness::new();
    h.on(VgpuCommand::Evict, |_| reply(&EvictReturn { num_bytes_to_trim: 0x4000 }));

    let allocations = [D3dkmtHandle(0x4000_1000)];
    let trim = paging::evict(&h.session, &h.adapter, &h.process, DEVICE, 0, &allocations).unwrap();
    assert_eq!(trim, 0x4000);
    let cmd: EvictCommand = read_command(&h.only(VgpuCommand::Evict).payload);
    assert_eq!(cmd.alloc_count, 1);
}
