//! Adapter lifetime, capability negotiation and adapter-wide queries.

use bytemuck::Zeroable;
use pvgpu_protocol::adapter_commands::{
    AdapterTypeFlags, ChangeVidmemReservationArgs, ChangeVidmemReservationCommand, ClockCalibrationData,
    CloseAdapterCommand, EscapeCommand, FlushHeapTransitionsCommand, GetInternalAdapterInfoCommand,
    GetInternalAdapterInfoReturn, OpenAdapterCommand, OpenAdapterReturn, QueryAdapterInfoCommand,
    QueryClockCalibrationArgs, QueryClockCalibrationCommand, QueryClockCalibrationReturn, QueryStatisticsArgs,
    QueryStatisticsCommand, QueryStatisticsReturn, QueryVideoMemoryInfoCommand, QueryVideoMemoryInfoReturn,
    ADAPTER_INFO_ASYNC_MSG, KMTQAITYPE_ADAPTERTYPE, KMTQAITYPE_ADAPTERTYPE_RENDER, QUERY_STATISTICS_RESULT_WORDS,
};
use pvgpu_protocol::command::LAST_COMPATIBLE_INTERFACE_VERSION;
use pvgpu_protocol::handle::decode_wide;
use pvgpu_protocol::{D3dkmtHandle, NtStatus, PayloadReader, VgpuCommand, VgpuToHostHeader, WinLuid};
use tracing::{debug, info};

use crate::codec::{command_size, wire_u32};
use crate::error::{CoreError, CoreResult};
use crate::message::{zeroed_vec, Message, MessageWithResult};
use crate::ops::{fixed_message, process_header, send_status, send_typed, traced};
use crate::session::{Adapter, Process, Session};

/// Open the adapter on the host and store the host adapter handle.
pub fn open_adapter(session: &Session, adapter: &mut Adapter) -> CoreResult<D3dkmtHandle> {
    let command = OpenAdapterCommand {
        hdr: VgpuToHostHeader::without_process(VgpuCommand::OpenAdapter),
        vmbus_interface_version: session.vmbus_version(),
        vmbus_last_compatible_interface_version: LAST_COMPATIBLE_INTERFACE_VERSION,
        guest_adapter_luid: adapter.guest_luid(),
    };
    let reply: OpenAdapterReturn = traced("open_adapter", send_typed(session, Some(&*adapter), &command))?;
    traced("open_adapter", CoreError::check_status(reply.status))?;
    adapter.set_host_handle(reply.host_adapter_handle);
    info!(
        adapter = %reply.host_adapter_handle,
        host_version = reply.vmbus_interface_version,
        "adapter opened"
    );
    Ok(reply.host_adapter_handle)
}

pub fn close_adapter(session: &Session, adapter: &Adapter) -> CoreResult<()> {
    let command = CloseAdapterCommand {
        hdr: VgpuToHostHeader::without_process(VgpuCommand::CloseAdapter),
        host_handle: adapter.host_handle(),
        reserved: 0,
    };
    traced("close_adapter", send_status(session, Some(adapter), &command)).map(|_| ())
}

/// Host description of an adapter, returned by capability negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalAdapterInfo {
    pub device_types: u32,
    pub driver_store_copy_mode: u32,
    pub driver_ddi_version: u32,
    pub async_msg_enabled: bool,
}

/// Negotiate capabilities. Stores the adapter's host identity and records
/// the async-message capability in the session; only the first answer counts.
pub fn get_internal_adapter_info(session: &Session, adapter: &mut Adapter) -> CoreResult<InternalAdapterInfo> {
    let command = GetInternalAdapterInfoCommand {
        hdr: VgpuToHostHeader::without_process(VgpuCommand::GetInternalAdapterInfo),
    };
    let mut reply = GetInternalAdapterInfoReturn::zeroed();
    let mut reply_len = std::mem::size_of::<GetInternalAdapterInfoReturn>();
    if !session.uses_ext_header() {
        reply_len -= std::mem::size_of::<WinLuid>();
    }

    {
        let msg = fixed_message(session, Some(&*adapter), &command)?;
        let bytes = bytemuck::bytes_of_mut(&mut reply);
        traced("get_internal_adapter_info", msg.send_sync_into(&mut bytes[..reply_len]))?;
    }

    adapter.set_identity(
        reply.host_adapter_luid,
        reply.host_vgpu_luid,
        decode_wide(&reply.device_description),
        decode_wide(&reply.device_instance_id),
    );

    let async_msg_enabled = reply.flags & ADAPTER_INFO_ASYNC_MSG != 0;
    session.record_async_capability(async_msg_enabled);
    debug!(
        luid = %reply.host_adapter_luid,
        vgpu = %reply.host_vgpu_luid,
        async_msg_enabled,
        "adapter info received"
    );
    Ok(InternalAdapterInfo {
        device_types: reply.device_types,
        driver_store_copy_mode: reply.driver_store_copy_mode,
        driver_ddi_version: reply.driver_ddi_version,
        async_msg_enabled,
    })
}

/// Run an adapter info query. `data` carries the query input and receives the answer.
pub fn query_adapter_info(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    query_type: u32,
    data: &mut [u8],
) -> CoreResult<()> {
    traced("query_adapter_info", send_query_adapter_info(session, adapter, process, query_type, data))
}

fn send_query_adapter_info(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    query_type: u32,
    data: &mut [u8],
) -> CoreResult<()> {
    let command = QueryAdapterInfoCommand {
        hdr: process_header(VgpuCommand::QueryAdapterInfo, process),
        query_type,
        private_data_size: wire_u32("adapter info data", data.len())?,
    };
    let mut msg = Message::new(session, Some(adapter), command_size::<QueryAdapterInfoCommand>(&[data.len()])?)?;
    let mut w = msg.writer();
    w.put(&command)?;
    w.put_bytes(data)?;

    let status_len = if session.uses_ext_header() { std::mem::size_of::<NtStatus>() } else { 0 };
    let mut reply = zeroed_vec(status_len + data.len())?;
    msg.send_sync_into(&mut reply)?;
    msg.free();

    let mut reader = PayloadReader::new(&reply);
    if status_len != 0 {
        CoreError::check_status(reader.read::<NtStatus>()?)?;
    }
    data.copy_from_slice(reader.read_bytes(data.len())?);

    if matches!(query_type, KMTQAITYPE_ADAPTERTYPE | KMTQAITYPE_ADAPTERTYPE_RENDER) {
        patch_adapter_type(data);
    }
    Ok(())
}

/// A guest of a paravirtualized adapter never drives displays itself.
fn patch_adapter_type(data: &mut [u8]) {
    let Some(word) = data.get_mut(..4) else {
        return;
    };
    let mut flags = AdapterTypeFlags::from_bits_retain(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]));
    flags.insert(AdapterTypeFlags::PARAVIRTUALIZED);
    flags.remove(
        AdapterTypeFlags::DISPLAY_SUPPORTED
            | AdapterTypeFlags::POST_DEVICE
            | AdapterTypeFlags::INDIRECT_DISPLAY_DEVICE
            | AdapterTypeFlags::ACG_SUPPORTED
            | AdapterTypeFlags::SET_TIMINGS_FROM_VIDPN,
    );
    word.copy_from_slice(&flags.bits().to_ne_bytes());
}

pub fn query_vidmem_info(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    memory_segment_group: u32,
    physical_adapter_index: u32,
) -> CoreResult<QueryVideoMemoryInfoReturn> {
    let command = QueryVideoMemoryInfoCommand {
        hdr: process_header(VgpuCommand::QueryVideoMemoryInfo, process),
        adapter: adapter.host_handle(),
        memory_segment_group,
        physical_adapter_index,
        reserved: 0,
    };
    traced("query_vidmem_info", send_typed(session, Some(adapter), &command))
}

pub fn query_clock_calibration(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: QueryClockCalibrationArgs,
) -> CoreResult<ClockCalibrationData> {
    let command = QueryClockCalibrationCommand {
        hdr: process_header(VgpuCommand::QueryClockCalibration, process),
        args,
    };
    let reply: QueryClockCalibrationReturn =
        traced("query_clock_calibration", send_typed(session, Some(adapter), &command))?;
    traced("query_clock_calibration", CoreError::check_status(reply.status))?;
    Ok(reply.clock_data)
}

/// Run a statistics query and return the raw result words.
pub fn query_statistics(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: QueryStatisticsArgs,
) -> CoreResult<[u64; QUERY_STATISTICS_RESULT_WORDS]> {
    let command = QueryStatisticsCommand {
        hdr: process_header(VgpuCommand::QueryStatistics, process),
        args,
    };
    let run = || -> CoreResult<[u64; QUERY_STATISTICS_RESULT_WORDS]> {
        let mut msg = MessageWithResult::new(
            session,
            adapter,
            std::mem::size_of::<QueryStatisticsCommand>(),
            std::mem::size_of::<QueryStatisticsReturn>(),
        )?;
        msg.writer().put(&command)?;
        msg.send_sync()?;
        let reply: QueryStatisticsReturn = PayloadReader::new(msg.result()).read()?;
        CoreError::check_status(reply.status)?;
        Ok(reply.result)
    };
    traced("query_statistics", run())
}

pub fn flush_heap_transitions(session: &Session, adapter: &Adapter, process: &Process) -> CoreResult<()> {
    let command = FlushHeapTransitionsCommand {
        hdr: process_header(VgpuCommand::FlushHeapTransitions, process),
    };
    traced("flush_heap_transitions", send_status(session, Some(adapter), &command)).map(|_| ())
}

/// Change a video memory reservation, optionally on behalf of `other_process`.
pub fn change_vidmem_reservation(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    other_process: D3dkmtHandle,
    mut args: ChangeVidmemReservationArgs,
) -> CoreResult<()> {
    args.process = u64::from(other_process.0);
    let command = ChangeVidmemReservationCommand {
        hdr: process_header(VgpuCommand::ChangeVideoMemoryReservation, process),
        args,
    };
    traced("change_vidmem_reservation", send_status(session, Some(adapter), &command)).map(|_| ())
}

/// Addressing of a driver escape.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscapeRequest {
    pub adapter: D3dkmtHandle,
    pub device: D3dkmtHandle,
    pub escape_type: u32,
    pub flags: u32,
    pub context: D3dkmtHandle,
}

/// Pass private driver data to the host driver. The host's answer replaces `data`.
pub fn escape(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &EscapeRequest,
    data: &mut [u8],
) -> CoreResult<()> {
    let run = |data: &mut [u8]| -> CoreResult<()> {
        if data.len() > session.max_packet_size() {
            return Err(CoreError::InvalidArgument("escape private data exceeds the packet limit"));
        }
        let command = EscapeCommand {
            hdr: process_header(VgpuCommand::Escape, process),
            adapter: request.adapter,
            device: request.device,
            escape_type: request.escape_type,
            flags: request.flags,
            priv_drv_data_size: wire_u32("escape private data", data.len())?,
            context: request.context,
        };
        let mut msg = Message::new(session, Some(adapter), command_size::<EscapeCommand>(&[data.len()])?)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_bytes(data)?;
        msg.send_sync_into(data)?;
        Ok(())
    };
    traced("escape", run(data))
}
