use pvgpu_protocol::adapter_commands::{
    CreateDeviceCommand, CreateDeviceReturn, DeviceStateArgs, FlushDeviceCommand, GetDeviceStateCommand,
    GetDeviceStateReturn, HandleCommand, MarkDeviceAsErrorCommand,
};
use pvgpu_protocol::{D3dkmtHandle, VgpuCommand};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::ops::{process_header, send_status, send_typed, traced};
use crate::session::{Adapter, Process, Session};

pub fn create_device(session: &Session, adapter: &Adapter, process: &Process, flags: u32) -> CoreResult<D3dkmtHandle> {
    let command = CreateDeviceCommand {
        hdr: process_header(VgpuCommand::CreateDevice, process),
        flags,
        cdd_device: 0,
        error_code: 0,
    };
    let reply: CreateDeviceReturn = traced("create_device", send_typed(session, Some(adapter), &command))?;
    if reply.device.is_null() {
        return traced("create_device", Err(CoreError::NullHandle("device")));
    }
    debug!(device = %reply.device, "device created");
    Ok(reply.device)
}

/// Send a command whose only argument is one handle.
pub(crate) fn send_handle_command(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    command: VgpuCommand,
    handle: D3dkmtHandle,
) -> CoreResult<()> {
    let command = HandleCommand {
        hdr: process_header(command, process),
        handle,
        reserved: 0,
    };
    send_status(session, Some(adapter), &command).map(|_| ())
}

pub fn destroy_device(session: &Session, adapter: &Adapter, process: &Process, device: D3dkmtHandle) -> CoreResult<()> {
    traced(
        "destroy_device",
        send_handle_command(session, adapter, process, VgpuCommand::DestroyDevice, device),
    )
}

pub fn flush_device(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    reason: u32,
) -> CoreResult<()> {
    let command = FlushDeviceCommand {
        hdr: process_header(VgpuCommand::FlushDevice, process),
        device,
        reason,
    };
    traced("flush_device", send_status(session, Some(adapter), &command)).map(|_| ())
}

/// Ask the host for one facet of a device's state, chosen by `args.state_type`.
pub fn get_device_state(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: DeviceStateArgs,
) -> CoreResult<DeviceStateArgs> {
    let command = GetDeviceStateCommand {
        hdr: process_header(VgpuCommand::GetDeviceState, process),
        args,
    };
    let reply: GetDeviceStateReturn = traced("get_device_state", send_typed(session, Some(adapter), &command))?;
    traced("get_device_state", CoreError::check_status(reply.status))?;
    Ok(reply.args)
}

pub fn mark_device_as_error(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    reason: u32,
) -> CoreResult<()> {
    let command = MarkDeviceAsErrorCommand {
        hdr: process_header(VgpuCommand::MarkDeviceAsError, process),
        device,
        reason,
    };
    traced("mark_device_as_error", send_status(session, Some(adapter), &command)).map(|_| ())
}
