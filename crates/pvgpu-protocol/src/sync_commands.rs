//! Synchronization object command layouts.

use bytemuck::{Pod, Zeroable};

use crate::command::VgpuToHostHeader;
use crate::handle::D3dkmtHandle;

/// Maximum number of objects a GPU wait may reference.
pub const MAX_OBJECT_WAITED_ON: usize = 32;

/// Sync object types.
pub const SYNC_OBJECT_MUTEX: u32 = 1;
pub const SYNC_OBJECT_SEMAPHORE: u32 = 2;
pub const SYNC_OBJECT_FENCE: u32 = 3;
pub const SYNC_OBJECT_CPU_NOTIFICATION: u32 = 4;
pub const SYNC_OBJECT_MONITORED_FENCE: u32 = 5;
pub const SYNC_OBJECT_PERIODIC_MONITORED_FENCE: u32 = 6;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SyncObjectFlags: u32 {
        const SHARED = 1 << 0;
        const NT_SECURITY_SHARING = 1 << 1;
        const CROSS_ADAPTER = 1 << 2;
        const TOP_OF_PIPELINE = 1 << 3;
        const NO_SIGNAL = 1 << 4;
        const NO_WAIT = 1 << 5;
        const NO_SIGNAL_MAX_VALUE_ON_TDR = 1 << 6;
        const NO_GPU_ACCESS = 1 << 7;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SignalFlags: u32 {
        const SIGNAL_EXACT_VALUE = 1 << 0;
        const ENQUEUE_CPU_EVENT = 1 << 1;
        const ALLOW_FENCE_REWIND = 1 << 2;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SyncObjectInfo {
    pub object_type: u32,
    pub flags: u32,
    pub initial_fence_value: u64,
    pub fence_cpu_virtual_address: u64,
    pub fence_gpu_virtual_address: u64,
    pub engine_affinity: u32,
    pub shared_handle: D3dkmtHandle,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct CreateSyncObjectArgs {
    pub device: D3dkmtHandle,
    pub reserved: u32,
    pub info: SyncObjectInfo,
    pub sync_object: D3dkmtHandle,
    pub reserved1: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateSyncObjectCommand {
    pub hdr: VgpuToHostHeader,
    pub args: CreateSyncObjectArgs,
    pub client_hint: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateSyncObjectReturn {
    pub sync_object: D3dkmtHandle,
    pub global_sync_object: D3dkmtHandle,
    pub fence_gpu_va: u64,
    pub fence_storage_address: u64,
    pub fence_storage_offset: u32,
    pub reserved: u32,
}

/// Followed by `object_count` objects, the optional issuing context and
/// further contexts (`context_count` in total), then `object_count` fence values.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SignalSyncObjectCommand {
    pub hdr: VgpuToHostHeader,
    pub flags: u32,
    pub context_count: u32,
    pub fence_value: u64,
    /// Device handle, or the CPU event when [`SignalFlags::ENQUEUE_CPU_EVENT`] is set
    pub device_or_cpu_event: u64,
    pub object_count: u32,
    pub reserved: u32,
}

/// Followed by `object_count` objects, then `object_count` fence values.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct WaitSyncObjectCpuCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub flags: u32,
    pub object_count: u32,
    pub reserved: u32,
    pub guest_event_pointer: u64,
}

/// Followed by `object_count` fence values, then `object_count` objects.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct WaitSyncObjectGpuCommand {
    pub hdr: VgpuToHostHeader,
    pub context: D3dkmtHandle,
    pub object_count: u32,
    pub legacy_fence_object: u32,
    pub reserved: u32,
}
