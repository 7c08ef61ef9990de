//! Sync object creation, signaling and waits.

use pvgpu_protocol::sync_commands::{
    CreateSyncObjectArgs, CreateSyncObjectCommand, CreateSyncObjectReturn, SignalFlags, SignalSyncObjectCommand,
    SyncObjectFlags, WaitSyncObjectCpuCommand, WaitSyncObjectGpuCommand, MAX_OBJECT_WAITED_ON,
    SYNC_OBJECT_MONITORED_FENCE, SYNC_OBJECT_PERIODIC_MONITORED_FENCE,
};
use pvgpu_protocol::{D3dkmtHandle, VgpuCommand};
use tracing::debug;

use crate::codec::{array_size, command_size, wire_u32};
use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use crate::objects::FenceMapping;
use crate::ops::global::destroy_sync_object;
use crate::ops::{compensate, dispatch_header, map_fence_page, process_header, send_typed, traced};
use crate::session::{Adapter, Process, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedSyncObject {
    pub sync_object: D3dkmtHandle,
    /// Global handle, for objects created shared
    pub shared_handle: Option<D3dkmtHandle>,
    /// Fence value mapping, for monitored fences
    pub fence: Option<FenceMapping>,
}

fn is_monitored_fence(object_type: u32) -> bool {
    matches!(object_type, SYNC_OBJECT_MONITORED_FENCE | SYNC_OBJECT_PERIODIC_MONITORED_FENCE)
}

pub fn create_sync_object(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    args: CreateSyncObjectArgs,
) -> CoreResult<CreatedSyncObject> {
    let command = CreateSyncObjectCommand {
        hdr: process_header(VgpuCommand::CreateSyncObject, process),
        args,
        client_hint: 1,
        reserved: 0,
    };
    let reply: CreateSyncObjectReturn = traced("create_sync_object", send_typed(session, Some(adapter), &command))?;

    let shared = SyncObjectFlags::from_bits_truncate(args.info.flags).contains(SyncObjectFlags::SHARED);
    let mut created = CreatedSyncObject {
        sync_object: reply.sync_object,
        shared_handle: shared.then_some(reply.global_sync_object),
        fence: None,
    };
    if !is_monitored_fence(args.info.object_type) {
        return Ok(created);
    }

    match map_fence_page(session, process, reply.fence_storage_address) {
        Ok(cpu_va) => {
            debug!(sync_object = %reply.sync_object, cpu_va, "monitored fence mapped");
            created.fence = Some(FenceMapping { cpu_va, gpu_va: reply.fence_gpu_va });
            Ok(created)
        }
        Err(e) => {
            compensate("destroy_sync_object", destroy_sync_object(session, process, reply.sync_object));
            traced("create_sync_object", Err(e))
        }
    }
}

/// Who a signal is issued for.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalRequest {
    pub flags: SignalFlags,
    /// Legacy fence value
    pub fence_value: u64,
    pub device: D3dkmtHandle,
    /// Issuing context, sent ahead of `SignalTargets::contexts` when set
    pub context: D3dkmtHandle,
    /// Guest event to signal instead of naming a device, with `ENQUEUE_CPU_EVENT`
    pub cpu_event: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalTargets<'a> {
    pub objects: &'a [D3dkmtHandle],
    pub contexts: &'a [D3dkmtHandle],
    /// Per-object fence values. Empty for objects without one.
    pub fences: &'a [u64],
}

pub fn signal_sync_object(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &SignalRequest,
    targets: &SignalTargets<'_>,
) -> CoreResult<()> {
    let run = || -> CoreResult<()> {
        let issuing_context = (!request.context.is_null()).then_some(request.context);
        let context_count = targets.contexts.len() + usize::from(issuing_context.is_some());

        let device_or_cpu_event = if request.flags.contains(SignalFlags::ENQUEUE_CPU_EVENT) {
            request.cpu_event
        } else {
            u64::from(request.device.0)
        };

        let dispatch = session.dispatch();
        let command = SignalSyncObjectCommand {
            hdr: dispatch_header(VgpuCommand::SignalSyncObject, process, dispatch),
            flags: request.flags.bits(),
            context_count: wire_u32("context count", context_count)?,
            fence_value: request.fence_value,
            device_or_cpu_event,
            object_count: wire_u32("object count", targets.objects.len())?,
            reserved: 0,
        };
        let size = command_size::<SignalSyncObjectCommand>(&[
            array_size::<D3dkmtHandle>(targets.objects.len())?,
            array_size::<D3dkmtHandle>(context_count)?,
            array_size::<u64>(targets.fences.len())?,
        ])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(targets.objects)?;
        if let Some(context) = issuing_context {
            w.put(&context)?;
        }
        w.put_slice(targets.contexts)?;
        w.put_slice(targets.fences)?;
        msg.submit(dispatch)
    };
    traced("signal_sync_object", run())
}

/// Block on the host until every object reaches its fence value, or have
/// the host signal `guest_event` when non-zero.
#[allow(clippy::too_many_arguments)]
pub fn wait_sync_object_cpu(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    flags: u32,
    objects: &[D3dkmtHandle],
    fence_values: &[u64],
    guest_event: u64,
) -> CoreResult<()> {
    let run = || -> CoreResult<()> {
        if fence_values.len() != objects.len() {
            return Err(CoreError::InvalidArgument("one fence value is needed per object"));
        }
        let command = WaitSyncObjectCpuCommand {
            hdr: process_header(VgpuCommand::WaitForSyncObjectFromCpu, process),
            device,
            flags,
            object_count: wire_u32("object count", objects.len())?,
            reserved: 0,
            guest_event_pointer: guest_event,
        };
        let size = command_size::<WaitSyncObjectCpuCommand>(&[
            array_size::<D3dkmtHandle>(objects.len())?,
            array_size::<u64>(fence_values.len())?,
        ])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(objects)?;
        w.put_slice(fence_values)?;
        msg.send_sync_status().map(|_| ())
    };
    traced("wait_sync_object_cpu", run())
}

/// Make `context` wait on the GPU until the objects reach their fence values.
pub fn wait_sync_object_gpu(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    context: D3dkmtHandle,
    objects: &[D3dkmtHandle],
    fence_values: &[u64],
    legacy_fence: bool,
) -> CoreResult<()> {
    let run = || -> CoreResult<()> {
        if objects.is_empty() || objects.len() > MAX_OBJECT_WAITED_ON {
            return Err(CoreError::InvalidArgument("GPU wait object count out of range"));
        }
        if fence_values.len() != objects.len() {
            return Err(CoreError::InvalidArgument("one fence value is needed per object"));
        }
        let dispatch = session.dispatch();
        let command = WaitSyncObjectGpuCommand {
            hdr: dispatch_header(VgpuCommand::WaitForSyncObjectFromGpu, process, dispatch),
            context,
            object_count: wire_u32("object count", objects.len())?,
            legacy_fence_object: u32::from(legacy_fence),
            reserved: 0,
        };
        let size = command_size::<WaitSyncObjectGpuCommand>(&[
            array_size::<u64>(fence_values.len())?,
            array_size::<D3dkmtHandle>(objects.len())?,
        ])?;
        let mut msg = Message::new(session, Some(adapter), size)?;
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(fence_values)?;
        w.put_slice(objects)?;
        msg.submit(dispatch)
    };
    traced("wait_sync_object_gpu", run())
}
