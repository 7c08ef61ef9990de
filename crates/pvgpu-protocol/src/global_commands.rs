//! VM-to-host command layouts. Every struct starts with [`VmToHostHeader`].

use bytemuck::{Pod, Zeroable};

use crate::command::VmToHostHeader;
use crate::handle::D3dkmtHandle;
use crate::status::NtStatus;

/// Maximum UTF-16 units in a process name, terminator included.
pub const WIN_MAX_PATH: usize = 260;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SetIoSpaceRegionCommand {
    pub hdr: VmToHostHeader,
    pub start: u64,
    pub length: u64,
    pub shared_page_gpadl: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateProcessCommand {
    pub hdr: VmToHostHeader,
    /// Guest-side identity of the process object
    pub process: u64,
    pub process_id: u32,
    pub process_name: [u16; WIN_MAX_PATH],
    /// bit 0: guest process is a Linux process
    pub flags: u32,
}

pub const CREATE_PROCESS_LINUX: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateProcessReturn {
    pub hprocess: D3dkmtHandle,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DestroyProcessCommand {
    pub hdr: VmToHostHeader,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OpenSyncObjectCommand {
    pub hdr: VmToHostHeader,
    pub device: D3dkmtHandle,
    pub global_sync_object: D3dkmtHandle,
    pub flags: u32,
    pub engine_affinity: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OpenSyncObjectReturn {
    pub sync_object: D3dkmtHandle,
    pub status: NtStatus,
    pub gpu_virtual_address: u64,
    pub guest_cpu_physical_address: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CreateNtSharedObjectCommand {
    pub hdr: VmToHostHeader,
    pub object: D3dkmtHandle,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DestroyNtSharedObjectCommand {
    pub hdr: VmToHostHeader,
    pub shared_handle: D3dkmtHandle,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DestroySyncObjectCommand {
    pub hdr: VmToHostHeader,
    pub sync_object: D3dkmtHandle,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShareObjectWithHostCommand {
    pub hdr: VmToHostHeader,
    pub device: D3dkmtHandle,
    pub object: D3dkmtHandle,
    pub reserved: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShareObjectWithHostReturn {
    pub status: NtStatus,
    pub alignment: u32,
    pub vail_nt_handle: u64,
}

/// Followed by `private_data_size` bytes of driver data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PresentVirtualCommand {
    pub hdr: VmToHostHeader,
    pub acquire_semaphore_nt_handle: u64,
    pub release_semaphore_nt_handle: u64,
    pub composition_memory_nt_handle: u64,
    pub private_data_size: u32,
    pub reserved: u32,
}
