//! VM-wide commands. These always travel on the global channel.

use pvgpu_protocol::global_commands::{
    CreateNtSharedObjectCommand, CreateProcessCommand, CreateProcessReturn, DestroyNtSharedObjectCommand,
    DestroyProcessCommand, DestroySyncObjectCommand, OpenSyncObjectCommand, OpenSyncObjectReturn,
    PresentVirtualCommand, SetIoSpaceRegionCommand, ShareObjectWithHostCommand, ShareObjectWithHostReturn,
    CREATE_PROCESS_LINUX,
};
use pvgpu_protocol::handle::encode_wide;
use pvgpu_protocol::{D3dkmtHandle, GlobalCommand, VmToHostHeader};
use tracing::debug;

use crate::codec::{check_private_size, command_size, wire_u32};
use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use crate::objects::FenceMapping;
use crate::ops::{compensate, map_fence_page, send_status, send_typed, traced};
use crate::session::{IoSpaceRegion, Process, Session};

/// Register the physical io space window the host maps device memory into.
pub fn set_iospace_region(session: &Session, start: u64, length: u64, shared_page_gpadl: u32) -> CoreResult<()> {
    let command = SetIoSpaceRegionCommand {
        hdr: VmToHostHeader::new(GlobalCommand::SetIoSpaceRegion, D3dkmtHandle::NULL),
        start,
        length,
        shared_page_gpadl,
        reserved: 0,
    };
    traced("set_iospace_region", send_status(session, None, &command))?;
    session.record_iospace(IoSpaceRegion { base: start, size: length });
    Ok(())
}

/// Announce a guest process to the host and store the handle it grants.
pub fn create_process(session: &Session, process: &mut Process) -> CoreResult<D3dkmtHandle> {
    let command = CreateProcessCommand {
        hdr: VmToHostHeader::new(GlobalCommand::CreateProcess, D3dkmtHandle::NULL),
        process: u64::from(process.pid()),
        process_id: process.pid(),
        process_name: encode_wide(process.name()),
        flags: CREATE_PROCESS_LINUX,
    };
    let reply: CreateProcessReturn = traced("create_process", send_typed(session, None, &command))?;
    if reply.hprocess.is_null() {
        return traced("create_process", Err(CoreError::NullHandle("process")));
    }
    debug!(pid = process.pid(), handle = %reply.hprocess, "host process created");
    process.set_host_handle(reply.hprocess);
    Ok(reply.hprocess)
}

pub fn destroy_process(session: &Session, host_process: D3dkmtHandle) -> CoreResult<()> {
    let command = DestroyProcessCommand {
        hdr: VmToHostHeader::new(GlobalCommand::DestroyProcess, host_process),
    };
    traced("destroy_process", send_status(session, None, &command)).map(|_| ())
}

/// Arguments for opening a shared sync object through its NT handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSyncObjectRequest {
    pub device: D3dkmtHandle,
    pub global_sync_object: D3dkmtHandle,
    pub flags: u32,
    /// Set for monitored fences; the fence page is then mapped into the process
    pub monitored_fence: bool,
    pub engine_affinity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedSyncObject {
    pub sync_object: D3dkmtHandle,
    pub fence: Option<FenceMapping>,
}

pub fn open_sync_object_nt(
    session: &Session,
    process: &Process,
    request: &OpenSyncObjectRequest,
) -> CoreResult<OpenedSyncObject> {
    let command = OpenSyncObjectCommand {
        hdr: VmToHostHeader::new(GlobalCommand::OpenSyncObject, process.host_handle()),
        device: request.device,
        global_sync_object: request.global_sync_object,
        flags: request.flags,
        engine_affinity: if request.monitored_fence { request.engine_affinity } else { 0 },
    };
    let reply: OpenSyncObjectReturn = traced("open_sync_object_nt", send_typed(session, None, &command))?;
    traced("open_sync_object_nt", CoreError::check_status(reply.status))?;

    if !request.monitored_fence {
        return Ok(OpenedSyncObject { sync_object: reply.sync_object, fence: None });
    }

    match map_fence_page(session, process, reply.guest_cpu_physical_address) {
        Ok(cpu_va) => Ok(OpenedSyncObject {
            sync_object: reply.sync_object,
            fence: Some(FenceMapping { cpu_va, gpu_va: reply.gpu_virtual_address }),
        }),
        Err(e) => {
            compensate("destroy_sync_object", destroy_sync_object(session, process, reply.sync_object));
            traced("open_sync_object_nt", Err(e))
        }
    }
}

/// Wrap `object` in a host NT shared object and return its handle.
pub fn create_nt_shared_object(session: &Session, process: &Process, object: D3dkmtHandle) -> CoreResult<D3dkmtHandle> {
    let command = CreateNtSharedObjectCommand {
        hdr: VmToHostHeader::new(GlobalCommand::CreateNtSharedObject, process.host_handle()),
        object,
        reserved: 0,
    };
    let shared: D3dkmtHandle = traced("create_nt_shared_object", send_typed(session, None, &command))?;
    if shared.is_null() {
        return traced("create_nt_shared_object", Err(CoreError::NullHandle("shared object")));
    }
    Ok(shared)
}

pub fn destroy_nt_shared_object(session: &Session, shared_handle: D3dkmtHandle) -> CoreResult<()> {
    let command = DestroyNtSharedObjectCommand {
        hdr: VmToHostHeader::new(GlobalCommand::DestroyNtSharedObject, D3dkmtHandle::NULL),
        shared_handle,
        reserved: 0,
    };
    traced("destroy_nt_shared_object", send_status(session, None, &command)).map(|_| ())
}

pub fn destroy_sync_object(session: &Session, process: &Process, sync_object: D3dkmtHandle) -> CoreResult<()> {
    let command = DestroySyncObjectCommand {
        hdr: VmToHostHeader::new(GlobalCommand::DestroySyncObject, process.host_handle()),
        sync_object,
        reserved: 0,
    };
    traced("destroy_sync_object", send_status(session, None, &command)).map(|_| ())
}

/// Share `object` with the host and return the host-side NT handle.
pub fn share_object_with_host(
    session: &Session,
    process: &Process,
    device: D3dkmtHandle,
    object: D3dkmtHandle,
) -> CoreResult<u64> {
    let command = ShareObjectWithHostCommand {
        hdr: VmToHostHeader::new(GlobalCommand::ShareObjectWithHost, process.host_handle()),
        device,
        object,
        reserved: 0,
    };
    let reply: ShareObjectWithHostReturn = traced("share_object_with_host", send_typed(session, None, &command))?;
    traced("share_object_with_host", CoreError::check_status(reply.status))?;
    Ok(reply.vail_nt_handle)
}

/// NT handles the host composes a virtual present from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresentHandles {
    pub acquire_semaphore: u64,
    pub release_semaphore: u64,
    pub composition_memory: u64,
}

pub fn present_virtual(
    session: &Session,
    process: &Process,
    handles: &PresentHandles,
    private_data: &[u8],
) -> CoreResult<()> {
    traced("present_virtual", send_present(session, process, handles, private_data))
}

fn send_present(session: &Session, process: &Process, handles: &PresentHandles, private_data: &[u8]) -> CoreResult<()> {
    check_private_size("present private data", private_data.len(), session.max_packet_size())?;
    let command = PresentVirtualCommand {
        hdr: VmToHostHeader::new(GlobalCommand::PresentVirtual, process.host_handle()),
        acquire_semaphore_nt_handle: handles.acquire_semaphore,
        release_semaphore_nt_handle: handles.release_semaphore,
        composition_memory_nt_handle: handles.composition_memory,
        private_data_size: wire_u32("present private data", private_data.len())?,
        reserved: 0,
    };
    let size = command_size::<PresentVirtualCommand>(&[private_data.len()])?;
    let mut msg = Message::new(session, None, size)?;
    let mut w = msg.writer();
    w.put(&command)?;
    w.put_bytes(private_data)?;
    msg.send_sync_status().map(|_| ())
}
