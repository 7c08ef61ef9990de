//! Per-adapter command layouts for adapters, devices, contexts, queues and GPU VA.
//! Every command struct starts with [`VgpuToHostHeader`].

use bytemuck::{Pod, Zeroable};

use crate::command::VgpuToHostHeader;
use crate::global_commands::WIN_MAX_PATH;
use crate::handle::{D3dkmtHandle, WinLuid};
use crate::status::NtStatus;

/// Maximum contexts a single submission can broadcast to.
pub const MAX_BROADCAST_CONTEXT: usize = 64;

/// Maximum primaries a single submission can reference.
pub const MAX_WRITTEN_PRIMARIES: usize = 16;

// ── Adapter ─────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OpenAdapterCommand {
    pub hdr: VgpuToHostHeader,
    pub vmbus_interface_version: u32,
    pub vmbus_last_compatible_interface_version: u32,
    pub guest_adapter_luid: WinLuid,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OpenAdapterReturn {
    pub host_adapter_handle: D3dkmtHandle,
    pub status: NtStatus,
    pub vmbus_interface_version: u32,
    pub vmbus_last_compatible_interface_version: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CloseAdapterCommand {
    pub hdr: VgpuToHostHeader,
    pub host_handle: D3dkmtHandle,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetInternalAdapterInfoCommand {
    pub hdr: VgpuToHostHeader,
}

pub const ADAPTER_INFO_ASYNC_MSG: u32 = 1;

/// Hosts older than the extended-header interface omit the trailing `host_vgpu_luid`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetInternalAdapterInfoReturn {
    pub device_types: u32,
    pub driver_store_copy_mode: u32,
    pub driver_ddi_version: u32,
    /// bit 0: asynchronous messages supported
    pub flags: u32,
    pub host_adapter_luid: WinLuid,
    pub device_description: [u16; 80],
    pub device_instance_id: [u16; WIN_MAX_PATH],
    pub host_vgpu_luid: WinLuid,
}

/// Followed by `private_data_size` bytes. The host replies with the same
/// amount of data, prefixed by a status on extended-header interfaces.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueryAdapterInfoCommand {
    pub hdr: VgpuToHostHeader,
    pub query_type: u32,
    pub private_data_size: u32,
}

pub const KMTQAITYPE_ADAPTERTYPE: u32 = 15;
pub const KMTQAITYPE_ADAPTERTYPE_RENDER: u32 = 57;

bitflags::bitflags! {
    /// Adapter type bits reported by the adapter-type queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdapterTypeFlags: u32 {
        const RENDER_SUPPORTED          = 1 << 0;
        const DISPLAY_SUPPORTED         = 1 << 1;
        const SOFTWARE_DEVICE           = 1 << 2;
        const POST_DEVICE               = 1 << 3;
        const HYBRID_DISCRETE           = 1 << 4;
        const HYBRID_INTEGRATED         = 1 << 5;
        const INDIRECT_DISPLAY_DEVICE   = 1 << 6;
        const PARAVIRTUALIZED           = 1 << 7;
        const ACG_SUPPORTED             = 1 << 8;
        const SET_TIMINGS_FROM_VIDPN    = 1 << 9;
        const DETACHABLE                = 1 << 10;
        const COMPUTE_ONLY              = 1 << 11;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueryVideoMemoryInfoCommand {
    pub hdr: VgpuToHostHeader,
    pub adapter: D3dkmtHandle,
    pub memory_segment_group: u32,
    pub physical_adapter_index: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct QueryVideoMemoryInfoReturn {
    pub budget: u64,
    pub current_usage: u64,
    pub current_reservation: u64,
    pub available_for_reservation: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ClockCalibrationData {
    pub gpu_frequency: u64,
    pub gpu_clock_counter: u64,
    pub cpu_clock_counter: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct QueryClockCalibrationArgs {
    pub adapter: D3dkmtHandle,
    pub node_ordinal: u32,
    pub physical_adapter_index: u32,
    pub reserved: u32,
    pub clock_data: ClockCalibrationData,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueryClockCalibrationCommand {
    pub hdr: VgpuToHostHeader,
    pub args: QueryClockCalibrationArgs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueryClockCalibrationReturn {
    pub status: NtStatus,
    pub reserved: u32,
    pub clock_data: ClockCalibrationData,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FlushHeapTransitionsCommand {
    pub hdr: VgpuToHostHeader,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ChangeVidmemReservationArgs {
    /// Target process, when changing another process's reservation
    pub process: u64,
    pub adapter: D3dkmtHandle,
    pub memory_segment_group: u32,
    pub reservation: u64,
    pub physical_adapter_index: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ChangeVidmemReservationCommand {
    pub hdr: VgpuToHostHeader,
    pub args: ChangeVidmemReservationArgs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct QueryStatisticsArgs {
    pub query_type: u32,
    pub reserved: u32,
    pub adapter_luid: WinLuid,
    pub process: u64,
    pub query_id: u32,
    pub reserved1: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueryStatisticsCommand {
    pub hdr: VgpuToHostHeader,
    pub args: QueryStatisticsArgs,
}

/// Opaque statistics payload; its interpretation depends on the query type.
pub const QUERY_STATISTICS_RESULT_WORDS: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueryStatisticsReturn {
    pub status: NtStatus,
    pub reserved: u32,
    pub result: [u64; QUERY_STATISTICS_RESULT_WORDS],
}

/// Followed by `priv_drv_data_size` bytes, echoed back by the host.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EscapeCommand {
    pub hdr: VgpuToHostHeader,
    pub adapter: D3dkmtHandle,
    pub device: D3dkmtHandle,
    pub escape_type: u32,
    pub flags: u32,
    pub priv_drv_data_size: u32,
    pub context: D3dkmtHandle,
}

// ── Device ──────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateDeviceCommand {
    pub hdr: VgpuToHostHeader,
    pub flags: u32,
    pub cdd_device: u32,
    pub error_code: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateDeviceReturn {
    pub device: D3dkmtHandle,
}

/// Shared layout of commands whose only argument is one handle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct HandleCommand {
    pub hdr: VgpuToHostHeader,
    pub handle: D3dkmtHandle,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FlushDeviceCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub reason: u32,
}

pub const DEVICE_STATE_WORDS: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DeviceStateArgs {
    pub device: D3dkmtHandle,
    pub state_type: u32,
    pub execution_state: u32,
    pub reserved: u32,
    /// Type-specific state (present, reset or page fault details)
    pub state_data: [u64; DEVICE_STATE_WORDS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetDeviceStateCommand {
    pub hdr: VgpuToHostHeader,
    pub args: DeviceStateArgs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetDeviceStateReturn {
    pub args: DeviceStateArgs,
    pub status: NtStatus,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MarkDeviceAsErrorCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub reason: u32,
}

// ── Context ─────────────────────────────────────────────────────────

/// Followed by `priv_drv_data_size` bytes. The host echoes the whole
/// command back with `context` filled in.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateContextVirtualCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub node_ordinal: u32,
    pub engine_affinity: u32,
    pub flags: u32,
    pub client_hint: u32,
    pub priv_drv_data_size: u32,
    pub context: D3dkmtHandle,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SetContextSchPriorityCommand {
    pub hdr: VgpuToHostHeader,
    pub context: D3dkmtHandle,
    pub priority: i32,
    pub in_process: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetContextSchPriorityCommand {
    pub hdr: VgpuToHostHeader,
    pub context: D3dkmtHandle,
    pub in_process: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetContextSchPriorityReturn {
    pub status: NtStatus,
    pub priority: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SubmitCommandArgs {
    pub command_buffer: u64,
    pub command_length: u32,
    pub flags: u32,
    pub present_history_token: u64,
    pub broadcast_context_count: u32,
    pub broadcast_context: [D3dkmtHandle; MAX_BROADCAST_CONTEXT],
    pub priv_drv_data_size: u32,
    pub num_primaries: u32,
    pub written_primaries: [D3dkmtHandle; MAX_WRITTEN_PRIMARIES],
    pub num_history_buffers: u32,
}

/// Followed by `num_history_buffers` handles, then private driver data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SubmitCommandCommand {
    pub hdr: VgpuToHostHeader,
    pub args: SubmitCommandArgs,
}

// ── Hardware queue ──────────────────────────────────────────────────

/// Followed by `priv_drv_data_size` bytes; echoed back with the queue and
/// progress fence fields filled in.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateHwQueueCommand {
    pub hdr: VgpuToHostHeader,
    pub status: NtStatus,
    pub hwqueue: D3dkmtHandle,
    pub hwqueue_progress_fence: D3dkmtHandle,
    pub context: D3dkmtHandle,
    pub flags: u32,
    pub priv_drv_data_size: u32,
    pub hwqueue_progress_fence_cpuva: u64,
    pub hwqueue_progress_fence_gpuva: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct SubmitCommandToHwQueueArgs {
    pub hwqueue: D3dkmtHandle,
    pub reserved: u32,
    pub hwqueue_progress_fence_id: u64,
    pub command_buffer: u64,
    pub command_length: u32,
    pub flags: u32,
    pub priv_drv_data_size: u32,
    pub num_primaries: u32,
}

/// Followed by `num_primaries` handles, then private driver data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SubmitCommandToHwQueueCommand {
    pub hdr: VgpuToHostHeader,
    pub args: SubmitCommandToHwQueueArgs,
}

// ── Paging queue ────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct CreatePagingQueueArgs {
    pub device: D3dkmtHandle,
    pub priority: i32,
    pub paging_queue: D3dkmtHandle,
    pub sync_object: D3dkmtHandle,
    pub fence_cpu_virtual_address: u64,
    pub physical_adapter_index: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreatePagingQueueCommand {
    pub hdr: VgpuToHostHeader,
    pub args: CreatePagingQueueArgs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreatePagingQueueReturn {
    pub paging_queue: D3dkmtHandle,
    pub sync_object: D3dkmtHandle,
    pub fence_storage_physical_address: u64,
    pub fence_storage_offset: u64,
}

/// Followed by `alloc_count` allocation handles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MakeResidentCommand {
    pub hdr: VgpuToHostHeader,
    pub paging_queue: D3dkmtHandle,
    pub flags: u32,
    pub alloc_count: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MakeResidentReturn {
    pub paging_fence_value: u64,
    pub num_bytes_to_trim: u64,
    pub status: NtStatus,
    pub reserved: u32,
}

/// Followed by `alloc_count` allocation handles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EvictCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub flags: u32,
    pub alloc_count: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct EvictReturn {
    pub num_bytes_to_trim: u64,
}

// ── GPU virtual address ─────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct MapGpuVaArgs {
    pub paging_queue: D3dkmtHandle,
    pub allocation: D3dkmtHandle,
    pub base_address: u64,
    pub minimum_address: u64,
    pub maximum_address: u64,
    pub offset_in_pages: u64,
    pub size_in_pages: u64,
    pub protection: u32,
    pub reserved0: u32,
    pub driver_protection: u64,
    pub virtual_address: u64,
    pub paging_fence_value: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MapGpuVaCommand {
    pub hdr: VgpuToHostHeader,
    pub args: MapGpuVaArgs,
    pub device: D3dkmtHandle,
    pub reserved: u32,
}

/// Shared reply of the map and reserve GPU VA commands.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuVaReturn {
    pub virtual_address: u64,
    pub paging_fence_value: u64,
    pub status: NtStatus,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ReserveGpuVaArgs {
    pub adapter: D3dkmtHandle,
    pub reserved0: u32,
    pub base_address: u64,
    pub minimum_address: u64,
    pub maximum_address: u64,
    pub size: u64,
    pub reservation_type: u32,
    pub reserved1: u32,
    pub driver_protection: u64,
    pub virtual_address: u64,
    pub paging_fence_value: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ReserveGpuVaCommand {
    pub hdr: VgpuToHostHeader,
    pub args: ReserveGpuVaArgs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct FreeGpuVaArgs {
    pub adapter: D3dkmtHandle,
    pub reserved: u32,
    pub base_address: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FreeGpuVaCommand {
    pub hdr: VgpuToHostHeader,
    pub args: FreeGpuVaArgs,
}

/// Followed by `num_operations` [`UpdateGpuVaOperation`] entries.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct UpdateGpuVaCommand {
    pub hdr: VgpuToHostHeader,
    pub fence_value: u64,
    pub device: D3dkmtHandle,
    pub context: D3dkmtHandle,
    pub fence_object: D3dkmtHandle,
    pub num_operations: u32,
    pub flags: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UpdateGpuVaOperation {
    pub operation: u32,
    pub reserved0: u32,
    pub base_address: u64,
    pub size: u64,
    pub allocation: D3dkmtHandle,
    pub protection: u32,
    pub allocation_offset: u64,
    pub allocation_size: u64,
    pub driver_protection: u64,
}
