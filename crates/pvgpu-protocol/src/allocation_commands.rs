//! Allocation and resource command layouts.

use bytemuck::{Pod, Zeroable};

use crate::command::VgpuToHostHeader;
use crate::handle::D3dkmtHandle;
use crate::status::NtStatus;

bitflags::bitflags! {
    /// Flags of a create-allocation request.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CreateAllocationFlags: u32 {
        const CREATE_RESOURCE       = 1 << 0;
        const CREATE_SHARED         = 1 << 1;
        const NON_SECURE            = 1 << 2;
        const CREATE_PROTECTED      = 1 << 3;
        const RESTRICT_SHARED_ACCESS = 1 << 4;
        const EXISTING_SYSMEM       = 1 << 5;
        const NT_SECURITY_SHARING   = 1 << 6;
        const READ_ONLY             = 1 << 7;
        const CREATE_WRITE_COMBINED = 1 << 8;
        const CREATE_CACHED         = 1 << 9;
        const SWAP_CHAIN_BACK_BUFFER = 1 << 10;
        const CROSS_ADAPTER         = 1 << 11;
        const OPEN_CROSS_ADAPTER    = 1 << 12;
        const PARTIAL_SHARED_CREATION = 1 << 13;
        const ZEROED                = 1 << 14;
        const WRITE_WATCH           = 1 << 15;
        const STANDARD_ALLOCATION   = 1 << 16;
        const EXISTING_SECTION      = 1 << 17;
    }
}

bitflags::bitflags! {
    /// Per-allocation flags returned by the host.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AllocationReturnFlags: u32 {
        const PRIMARY = 1 << 0;
        const CDD_PRIMARY = 1 << 1;
        const CACHED = 1 << 2;
    }
}

/// Followed by `alloc_count` u32 private-data sizes, then the concatenated private data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetAllocationSizeCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub alloc_count: u32,
}

/// Followed by `alloc_count` u64 allocation sizes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetAllocationSizeReturn {
    pub status: NtStatus,
    pub alloc_count: u32,
}

/// Layout of the trailing sections:
/// `[AllocInfo; alloc_count][runtime data][standard alloc | global private data]
/// [per-alloc private data...][RLE page entries]`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateAllocationCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub flags: u32,
    pub resource: D3dkmtHandle,
    pub private_runtime_resource_handle: D3dkmtHandle,
    pub alloc_count: u32,
    pub private_runtime_data_size: u32,
    pub priv_drv_data_size: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AllocInfo {
    pub flags: u32,
    pub priv_drv_data_size: u32,
    pub vidpn_source_id: u32,
    /// Number of RLE page entries this allocation contributes
    pub sysmem_pages_rle_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StandardAllocation {
    pub allocation_type: u32,
    pub flags: u32,
    pub existing_heap_size: u64,
}

pub const STANDARD_ALLOCATION_TYPE_EXISTING_HEAP: u32 = 1;

/// Followed by `alloc_count` [`AllocInfoReturn`], then per-allocation private data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateAllocationReturn {
    pub flags: u32,
    pub resource: D3dkmtHandle,
    pub global_share: D3dkmtHandle,
    pub status: NtStatus,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AllocInfoReturn {
    pub allocation: D3dkmtHandle,
    pub priv_drv_data_size: u32,
    pub allocation_flags: u32,
    pub reserved: u32,
    pub allocation_size: u64,
    pub driver_info: u64,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DestroyAllocationFlags: u32 {
        const ASSUME_NOT_IN_USE = 1 << 0;
        const SYNCHRONOUS_DESTROY = 1 << 1;
        const RESERVED = 1 << 2;
        const SYSTEM_USE_ONLY = 1 << 3;
    }
}

/// Followed by `alloc_count` allocation handles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DestroyAllocationCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub resource: D3dkmtHandle,
    pub alloc_count: u32,
    pub flags: u32,
}

/// Followed by `num_pages` u64 page frame numbers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SetExistingSysmemPagesCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub allocation: D3dkmtHandle,
    pub num_pages: u32,
    pub alloc_offset_in_pages: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OpenResourceCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub nt_security_sharing: u32,
    pub global_share: D3dkmtHandle,
    pub allocation_count: u32,
    pub total_priv_drv_data_size: u32,
    pub reserved: u32,
}

/// Followed by `allocation_count` handles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OpenResourceReturn {
    pub status: NtStatus,
    pub resource: D3dkmtHandle,
}

pub const STANDARD_ALLOCATION_GDI_SURFACE: u32 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GdiSurfaceData {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub surface_type: u32,
    pub flags: u32,
    pub pitch: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetStandardAllocPrivDataCommand {
    pub hdr: VgpuToHostHeader,
    pub alloc_type: u32,
    pub priv_driver_data_size: u32,
    pub priv_driver_resource_size: u32,
    pub physical_adapter_index: u32,
    pub gdi_surface: GdiSurfaceData,
}

/// Followed by allocation private data, then resource private data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GetStandardAllocPrivDataReturn {
    pub status: NtStatus,
    pub priv_driver_data_size: u32,
    pub priv_driver_resource_size: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct Lock2Args {
    pub device: D3dkmtHandle,
    pub allocation: D3dkmtHandle,
    pub flags: u32,
    pub reserved: u32,
    /// Receives the CPU virtual address on success
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Lock2Command {
    pub hdr: VgpuToHostHeader,
    pub args: Lock2Args,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Lock2Return {
    pub status: NtStatus,
    pub reserved: u32,
    pub cpu_visible_buffer_offset: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Unlock2Command {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub allocation: D3dkmtHandle,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct UpdateAllocPropertyArgs {
    pub paging_queue: D3dkmtHandle,
    pub allocation: D3dkmtHandle,
    pub supported_segment_set: u32,
    pub preferred_segment: u32,
    pub flags: u32,
    pub property_flags: u32,
    pub paging_fence_value: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct UpdateAllocPropertyCommand {
    pub hdr: VgpuToHostHeader,
    pub args: UpdateAllocPropertyArgs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct UpdateAllocPropertyReturn {
    pub paging_fence_value: u64,
    pub status: NtStatus,
    pub reserved: u32,
}

/// Shared layout of the set/get allocation priority commands.
/// Followed by `allocation_count` handles (and u32 priorities for set).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AllocationPriorityCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub resource: D3dkmtHandle,
    pub allocation_count: u32,
    pub reserved: u32,
}

/// Followed by `allocation_count` handles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueryAllocationResidencyCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub resource: D3dkmtHandle,
    pub allocation_count: u32,
    pub reserved: u32,
}

/// Followed by `allocation_count` handles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OfferAllocationsCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub priority: u32,
    pub flags: u32,
    pub allocation_count: u32,
    /// Non-zero when the handles name resources rather than allocations
    pub resources: u32,
    pub reserved: u32,
}

/// Followed by `allocation_count` handles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ReclaimAllocationsCommand {
    pub hdr: VgpuToHostHeader,
    pub device: D3dkmtHandle,
    pub paging_queue: D3dkmtHandle,
    pub allocation_count: u32,
    pub resources: u32,
    pub write_results: u32,
    pub reserved: u32,
}

/// Followed by `allocation_count` u32 results when results were requested.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ReclaimAllocationsReturn {
    pub paging_fence_value: u64,
    pub status: NtStatus,
    pub reserved: u32,
}
