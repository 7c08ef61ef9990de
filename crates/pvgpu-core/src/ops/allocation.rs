//! Allocation and resource lifetime.
//!
//! Creating allocations is the one operation that can leave host state
//! behind on failure. It runs in stages:
//!
//! 1. size the request and, for existing system memory, ask the host for the
//!    allocation sizes and pin the backing pages
//! 2. commit the request, with page lists encoded after the private data
//! 3. once the host acknowledges, register the granted handles locally
//!
//! A failure after the host acknowledged undoes the local registrations,
//! destroys every granted allocation on the host in one request and then
//! releases the pinned pages, in that order.

use std::sync::Arc;

use pvgpu_protocol::allocation_commands::{
    AllocInfo, AllocInfoReturn, AllocationReturnFlags, CreateAllocationCommand, CreateAllocationFlags,
    CreateAllocationReturn, DestroyAllocationCommand, DestroyAllocationFlags, GdiSurfaceData,
    GetAllocationSizeCommand, GetAllocationSizeReturn, GetStandardAllocPrivDataCommand,
    GetStandardAllocPrivDataReturn, OpenResourceCommand, OpenResourceReturn, SetExistingSysmemPagesCommand,
    StandardAllocation, STANDARD_ALLOCATION_GDI_SURFACE,
};
use pvgpu_protocol::pages::PAGE_ENTRY_SIZE;
use pvgpu_protocol::{D3dkmtHandle, PageGeometry, PayloadReader, PayloadWriter, ProtocolError, VgpuCommand};
use tracing::{debug, warn};

use crate::codec::{alloc_info, array_size, check_private_size, command_size, read_blob, total_private_size, wire_u32};
use crate::error::{CoreError, CoreResult};
use crate::memory::{PagePinner, PinnedPages};
use crate::message::{zeroed_vec, Message, MessageWithResult};
use crate::objects::{Allocation, HandleKind, HandleObject, Resource};
use crate::ops::{compensate, process_header, traced};
use crate::rle::{rle_capacity, RleEncoder};
use crate::session::{Adapter, Process, Session};

/// One allocation of a create request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationDesc<'a> {
    pub flags: u32,
    pub vidpn_source_id: u32,
    pub private_data: &'a [u8],
    /// User address of existing system memory backing the allocation
    pub sysmem: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateAllocationRequest<'a> {
    pub device: D3dkmtHandle,
    pub flags: CreateAllocationFlags,
    /// Resource the allocations join, unless `CREATE_RESOURCE` is set
    pub resource: D3dkmtHandle,
    pub private_runtime_resource_handle: D3dkmtHandle,
    pub runtime_data: &'a [u8],
    /// Global private driver data; replaced by `standard_allocation`
    /// when the `STANDARD_ALLOCATION` flag is set
    pub private_data: &'a [u8],
    pub standard_allocation: Option<StandardAllocation>,
    pub allocations: &'a [AllocationDesc<'a>],
}

#[derive(Debug, Clone)]
pub struct CreatedAllocation {
    pub allocation: Arc<Allocation>,
    pub allocation_flags: AllocationReturnFlags,
    pub driver_info: u64,
    /// Private driver data as returned by the host
    pub private_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CreatedAllocations {
    pub resource: D3dkmtHandle,
    pub global_share: D3dkmtHandle,
    pub allocations: Vec<CreatedAllocation>,
}

/// Ask the host how large each allocation will be.
pub fn get_allocation_size(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    allocations: &[AllocationDesc<'_>],
) -> CoreResult<Vec<u64>> {
    traced(
        "get_allocation_size",
        send_get_allocation_size(session, adapter, process, device, allocations),
    )
}

fn send_get_allocation_size(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    allocations: &[AllocationDesc<'_>],
) -> CoreResult<Vec<u64>> {
    let private_total = total_private_size(allocations.iter().map(|a| a.private_data), session.max_packet_size())?;
    let count = allocations.len();
    let command = GetAllocationSizeCommand {
        hdr: process_header(VgpuCommand::GetAllocationSize, process),
        device,
        alloc_count: wire_u32("allocation count", count)?,
    };
    let size = command_size::<GetAllocationSizeCommand>(&[array_size::<u32>(count)?, private_total])?;
    let mut msg = Message::new(session, Some(adapter), size)?;
    let mut w = msg.writer();
    w.put(&command)?;
    for desc in allocations {
        w.put(&(desc.private_data.len() as u32))?;
    }
    for desc in allocations {
        w.put_bytes(desc.private_data)?;
    }

    let mut reply = zeroed_vec(command_size::<GetAllocationSizeReturn>(&[array_size::<u64>(count)?])?)?;
    msg.send_sync_into(&mut reply)?;
    msg.free();

    let mut reader = PayloadReader::new(&reply);
    let header: GetAllocationSizeReturn = reader.read()?;
    if header.alloc_count != command.alloc_count {
        return Err(ProtocolError::CountMismatch { expected: command.alloc_count, got: header.alloc_count }.into());
    }
    CoreError::check_status(header.status)?;
    Ok(reader.read_vec(count)?)
}

/// Pages pinned for a create request, one slot per allocation. Whatever is
/// still held when the set drops is unpinned.
struct PinnedSet<'p> {
    pinner: &'p dyn PagePinner,
    pages: Vec<Option<PinnedPages>>,
}

impl<'p> PinnedSet<'p> {
    fn new(pinner: &'p dyn PagePinner) -> Self {
        Self { pinner, pages: Vec::new() }
    }

    fn frames(&self, index: usize) -> Option<&[u64]> {
        self.pages.get(index)?.as_ref().map(|p| p.frames.as_slice())
    }

    fn take(&mut self, index: usize) -> Option<PinnedPages> {
        self.pages.get_mut(index).and_then(Option::take)
    }
}

impl Drop for PinnedSet<'_> {
    fn drop(&mut self) {
        for pages in self.pages.drain(..).flatten() {
            self.pinner.unpin_user_pages(pages);
        }
    }
}

/// Pin the backing pages of every allocation that gets a page list: those
/// with private data and a non-zero host size.
fn pin_sysmem<'p>(
    process: &'p Process,
    geometry: PageGeometry,
    allocations: &[AllocationDesc<'_>],
    sizes: &[u64],
    writable: bool,
) -> CoreResult<PinnedSet<'p>> {
    let mut set = PinnedSet::new(process.pinner());
    for (desc, &size) in allocations.iter().zip(sizes) {
        let pinned = match desc.sysmem {
            Some(user_va) if !desc.private_data.is_empty() && size > 0 => {
                let count = geometry.pages_for(size) as usize;
                Some(process.pinner().pin_user_pages(user_va, count, writable)?)
            }
            _ => None,
        };
        set.pages.push(pinned);
    }
    Ok(set)
}

/// Create allocations, and optionally their resource, on the host and
/// register them in the process handle table.
pub fn create_allocation(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &CreateAllocationRequest<'_>,
) -> CoreResult<CreatedAllocations> {
    traced("create_allocation", run_create_allocation(session, adapter, process, request))
}

fn run_create_allocation(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &CreateAllocationRequest<'_>,
) -> CoreResult<CreatedAllocations> {
    let max = session.max_packet_size();
    let geometry = session.page_geometry();
    let allocations = request.allocations;
    let count = allocations.len();

    check_private_size("runtime private data", request.runtime_data.len(), max)?;
    check_private_size("global private data", request.private_data.len(), max)?;
    let per_alloc_total = total_private_size(allocations.iter().map(|a| a.private_data), max)?;

    let sysmem = allocations.first().is_some_and(|a| a.sysmem.is_some());
    if allocations.iter().any(|a| a.sysmem.is_some() != sysmem) {
        return Err(CoreError::InvalidArgument("allocations mix existing system memory with device memory"));
    }
    if sysmem && !session.config().memory.map_guest_pages {
        return Err(CoreError::InvalidArgument("existing system memory requires map_guest_pages"));
    }

    let global_section: &[u8] = if request.flags.contains(CreateAllocationFlags::STANDARD_ALLOCATION) {
        match &request.standard_allocation {
            Some(standard) => bytemuck::bytes_of(standard),
            None => return Err(CoreError::InvalidArgument("standard allocation flag without a description")),
        }
    } else {
        request.private_data
    };

    let (mut pins, rle_entries) = if sysmem {
        let sizes = send_get_allocation_size(session, adapter, process, request.device, allocations)?;
        let writable = !request.flags.contains(CreateAllocationFlags::READ_ONLY);
        let pins = pin_sysmem(process, geometry, allocations, &sizes, writable)?;
        (pins, rle_capacity(&sizes, geometry))
    } else {
        (PinnedSet::new(process.pinner()), 0)
    };

    let mut flags = request.flags;
    if sysmem {
        flags |= CreateAllocationFlags::EXISTING_SYSMEM;
    }
    let command = CreateAllocationCommand {
        hdr: process_header(VgpuCommand::CreateAllocation, process),
        device: request.device,
        flags: flags.bits(),
        resource: request.resource,
        private_runtime_resource_handle: request.private_runtime_resource_handle,
        alloc_count: wire_u32("allocation count", count)?,
        private_runtime_data_size: wire_u32("runtime private data", request.runtime_data.len())?,
        priv_drv_data_size: wire_u32("global private data", global_section.len())?,
        reserved: 0,
    };

    let rle_len = rle_entries * PAGE_ENTRY_SIZE;
    let size = command_size::<CreateAllocationCommand>(&[
        array_size::<AllocInfo>(count)?,
        request.runtime_data.len(),
        global_section.len(),
        per_alloc_total,
        rle_len,
    ])?;
    let mut msg = Message::new(session, Some(adapter), size)?;
    {
        let (head, rle_region) = msg.payload_mut().split_at_mut(size - rle_len);
        let mut encoder = RleEncoder::new(rle_region, geometry);
        let mut infos = Vec::with_capacity(count);
        for (index, desc) in allocations.iter().enumerate() {
            let entries = match pins.frames(index) {
                Some(frames) => encoder.encode(frames)?,
                None => 0,
            };
            infos.push(alloc_info(desc.flags, desc.vidpn_source_id, desc.private_data, entries));
        }
        debug!(allocations = count, rle_entries = encoder.used(), capacity = rle_entries, "allocation request encoded");

        let mut w = PayloadWriter::new(head);
        w.put(&command)?;
        w.put_slice(&infos)?;
        w.put_bytes(request.runtime_data)?;
        w.put_bytes(global_section)?;
        for desc in allocations {
            w.put_bytes(desc.private_data)?;
        }
    }

    let result_len = command_size::<CreateAllocationReturn>(&[array_size::<AllocInfoReturn>(count)?, per_alloc_total])?;
    let mut reply = zeroed_vec(result_len)?;
    msg.send_sync_into(&mut reply)?;
    msg.free();

    let mut reader = PayloadReader::new(&reply);
    let header: CreateAllocationReturn = reader.read()?;
    CoreError::check_status(header.status)?;
    let granted: Vec<AllocInfoReturn> = reader.read_vec(count)?;

    let mut local = LocalObjects::default();
    match register_allocations(process, request, &header, &granted, &mut reader, &mut pins, &mut local) {
        Ok(created) => Ok(created),
        Err(e) => {
            rollback(session, adapter, process, request, &header, &granted, local, pins);
            Err(e)
        }
    }
}

fn creates_resource(request: &CreateAllocationRequest<'_>, header: &CreateAllocationReturn) -> bool {
    request.flags.contains(CreateAllocationFlags::CREATE_RESOURCE) && !header.resource.is_null()
}

/// Objects registered so far, in registration order.
#[derive(Default)]
struct LocalObjects {
    assigned: Vec<(D3dkmtHandle, HandleKind)>,
    allocations: Vec<Arc<Allocation>>,
}

fn register_allocations(
    process: &Process,
    request: &CreateAllocationRequest<'_>,
    header: &CreateAllocationReturn,
    granted: &[AllocInfoReturn],
    reader: &mut PayloadReader<'_>,
    pins: &mut PinnedSet<'_>,
    local: &mut LocalObjects,
) -> CoreResult<CreatedAllocations> {
    let mut echoed = Vec::with_capacity(granted.len());
    for info in granted {
        echoed.push(read_blob(reader, info.priv_drv_data_size as usize)?);
    }

    let resource = if creates_resource(request, header) {
        let resource = Arc::new(Resource::new(header.resource));
        process.handles().assign(header.resource, HandleObject::Resource(resource))?;
        local.assigned.push((header.resource, HandleKind::Resource));
        header.resource
    } else {
        request.resource
    };

    let mut created = Vec::with_capacity(granted.len());
    for (index, (info, private_data)) in granted.iter().zip(echoed).enumerate() {
        let allocation_flags = AllocationReturnFlags::from_bits_retain(info.allocation_flags);
        let allocation = Arc::new(Allocation::new(
            info.allocation,
            info.allocation_size,
            allocation_flags.contains(AllocationReturnFlags::CACHED),
            pins.take(index),
        ));
        local.allocations.push(Arc::clone(&allocation));
        process
            .handles()
            .assign(info.allocation, HandleObject::Allocation(Arc::clone(&allocation)))?;
        local.assigned.push((info.allocation, HandleKind::Allocation));
        created.push(CreatedAllocation {
            allocation,
            allocation_flags,
            driver_info: info.driver_info,
            private_data,
        });
    }

    debug!(resource = %resource, allocations = created.len(), "allocations registered");
    Ok(CreatedAllocations { resource, global_share: header.global_share, allocations: created })
}

#[allow(clippy::too_many_arguments)]
fn rollback(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &CreateAllocationRequest<'_>,
    header: &CreateAllocationReturn,
    granted: &[AllocInfoReturn],
    local: LocalObjects,
    pins: PinnedSet<'_>,
) {
    for &(handle, kind) in local.assigned.iter().rev() {
        process.handles().free(handle, kind);
    }

    let handles: Vec<D3dkmtHandle> = granted.iter().map(|info| info.allocation).collect();
    let resource = if creates_resource(request, header) { header.resource } else { request.resource };
    warn!(allocations = handles.len(), resource = %resource, "destroying host allocations after a failed create");
    compensate(
        "destroy_allocation",
        send_destroy_allocation(
            session,
            adapter,
            process,
            &DestroyAllocationRequest {
                device: request.device,
                resource,
                flags: DestroyAllocationFlags::ASSUME_NOT_IN_USE,
            },
            &handles,
        ),
    );

    for allocation in local.allocations {
        if let Some(pages) = allocation.take_pinned_pages() {
            process.pinner().unpin_user_pages(pages);
        }
    }
    drop(pins);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyAllocationRequest {
    pub device: D3dkmtHandle,
    pub resource: D3dkmtHandle,
    pub flags: DestroyAllocationFlags,
}

fn send_destroy_allocation(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &DestroyAllocationRequest,
    allocations: &[D3dkmtHandle],
) -> CoreResult<()> {
    let command = DestroyAllocationCommand {
        hdr: process_header(VgpuCommand::DestroyAllocation, process),
        device: request.device,
        resource: request.resource,
        alloc_count: wire_u32("allocation count", allocations.len())?,
        flags: request.flags.bits(),
    };
    let size = command_size::<DestroyAllocationCommand>(&[array_size::<D3dkmtHandle>(allocations.len())?])?;
    let mut msg = Message::new(session, Some(adapter), size)?;
    let mut w = msg.writer();
    w.put(&command)?;
    w.put_slice(allocations)?;
    msg.send_sync_status().map(|_| ())
}

/// Destroy allocations (and the resource, if named) on the host, then drop
/// their table entries, CPU mappings and pinned pages.
pub fn destroy_allocation(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &DestroyAllocationRequest,
    allocations: &[D3dkmtHandle],
) -> CoreResult<()> {
    let result = send_destroy_allocation(session, adapter, process, request, allocations);

    let geometry = session.page_geometry();
    for &handle in allocations {
        let Some(HandleObject::Allocation(allocation)) = process.handles().free(handle, HandleKind::Allocation) else {
            continue;
        };
        if let Some(mapping) = allocation.cpu_slot().lock().take() {
            let size = allocation.num_pages(geometry) << geometry.shift();
            if let Err(e) = process.mapper().unmap(mapping.user_va, size) {
                warn!(allocation = %handle, "unmapping allocation failed: {e}");
            }
        }
        if let Some(pages) = allocation.take_pinned_pages() {
            process.pinner().unpin_user_pages(pages);
        }
    }
    if !request.resource.is_null() {
        process.handles().free(request.resource, HandleKind::Resource);
    }
    traced("destroy_allocation", result)
}

/// Describe an allocation's existing system memory to the host page by
/// page. The pages stay pinned for the allocation's lifetime.
pub fn set_existing_sysmem_pages(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    allocation: &Allocation,
    user_va: u64,
    writable: bool,
) -> CoreResult<()> {
    traced(
        "set_existing_sysmem_pages",
        send_sysmem_pages(session, adapter, process, device, allocation, user_va, writable),
    )
}

fn send_sysmem_pages(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    allocation: &Allocation,
    user_va: u64,
    writable: bool,
) -> CoreResult<()> {
    // Without guest page mapping the host expects a GPADL-backed store,
    // which this path does not establish.
    if !session.config().memory.map_guest_pages {
        return Err(CoreError::InvalidArgument("existing system memory requires map_guest_pages"));
    }
    let geometry = session.page_geometry();
    if allocation.is_sysmem() {
        return Err(CoreError::InvalidArgument("allocation already has system memory pages"));
    }
    let page_count = allocation.num_pages(geometry) as usize;
    let pinned = process.pinner().pin_user_pages(user_va, page_count, writable)?;
    if let Err(pages) = allocation.attach_pinned_pages(pinned) {
        process.pinner().unpin_user_pages(pages);
        return Err(CoreError::InvalidArgument("allocation already has system memory pages"));
    }
    let frames = allocation.pinned_frames();

    let header_len = std::mem::size_of::<SetExistingSysmemPagesCommand>();
    let max_frames = session
        .max_packet_size()
        .saturating_sub(header_len + geometry.page_size() as usize)
        / PAGE_ENTRY_SIZE;
    if max_frames == 0 {
        return Err(CoreError::MessageTooLarge { size: header_len, max: session.max_packet_size() });
    }

    let mut msg = Message::new(session, Some(adapter), header_len + max_frames * PAGE_ENTRY_SIZE)?;
    let mut offset = 0usize;
    for chunk in frames.chunks(max_frames) {
        let command = SetExistingSysmemPagesCommand {
            hdr: process_header(VgpuCommand::SetExistingSysmemPages, process),
            device,
            allocation: allocation.handle(),
            num_pages: wire_u32("page count", chunk.len())?,
            alloc_offset_in_pages: wire_u32("page offset", offset)?,
        };
        let mut w = msg.writer();
        w.put(&command)?;
        w.put_slice(chunk)?;
        msg.send_sync_status()?;
        offset += chunk.len();
    }
    debug!(allocation = %allocation.handle(), pages = offset, "system memory pages sent");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedResource {
    pub resource: D3dkmtHandle,
    pub allocations: Vec<D3dkmtHandle>,
}

/// Open a shared resource through its global share handle.
pub fn open_resource(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    device: D3dkmtHandle,
    global_share: D3dkmtHandle,
    allocation_count: u32,
    total_priv_drv_data_size: u32,
) -> CoreResult<OpenedResource> {
    let run = || -> CoreResult<OpenedResource> {
        let command = OpenResourceCommand {
            hdr: process_header(VgpuCommand::OpenResource, process),
            device,
            nt_security_sharing: 1,
            global_share,
            allocation_count,
            total_priv_drv_data_size,
            reserved: 0,
        };
        let result_size =
            command_size::<OpenResourceReturn>(&[array_size::<D3dkmtHandle>(allocation_count as usize)?])?;
        let mut msg = MessageWithResult::new(session, adapter, std::mem::size_of::<OpenResourceCommand>(), result_size)?;
        msg.writer().put(&command)?;
        msg.send_sync()?;

        let mut reader = PayloadReader::new(msg.result());
        let reply: OpenResourceReturn = reader.read()?;
        CoreError::check_status(reply.status)?;
        Ok(OpenedResource {
            resource: reply.resource,
            allocations: reader.read_vec(allocation_count as usize)?,
        })
    };
    traced("open_resource", run())
}

/// Query for a standard allocation's driver data. With `fetch_data` unset
/// only the sizes are returned; a non-zero expected size must match the host's.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdAllocRequest {
    pub alloc_type: u32,
    pub gdi_surface: GdiSurfaceData,
    pub physical_adapter_index: u32,
    pub alloc_priv_size: u32,
    pub resource_priv_size: u32,
    pub fetch_data: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdAllocData {
    pub alloc_priv_size: u32,
    pub resource_priv_size: u32,
    pub alloc_priv: Vec<u8>,
    pub resource_priv: Vec<u8>,
}

pub fn get_stdalloc_data(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &StdAllocRequest,
) -> CoreResult<StdAllocData> {
    traced("get_stdalloc_data", send_get_stdalloc_data(session, adapter, process, request))
}

fn send_get_stdalloc_data(
    session: &Session,
    adapter: &Adapter,
    process: &Process,
    request: &StdAllocRequest,
) -> CoreResult<StdAllocData> {
    if request.alloc_type != STANDARD_ALLOCATION_GDI_SURFACE {
        return Err(CoreError::InvalidArgument("unsupported standard allocation type"));
    }
    let mut result_size = std::mem::size_of::<GetStandardAllocPrivDataReturn>();
    if request.fetch_data {
        result_size += request.alloc_priv_size as usize + request.resource_priv_size as usize;
    }
    let command = GetStandardAllocPrivDataCommand {
        hdr: process_header(VgpuCommand::GetStandardAllocationDriverData, process),
        alloc_type: request.alloc_type,
        priv_driver_data_size: request.alloc_priv_size,
        priv_driver_resource_size: request.resource_priv_size,
        physical_adapter_index: request.physical_adapter_index,
        gdi_surface: request.gdi_surface,
    };
    let mut msg =
        MessageWithResult::new(session, adapter, std::mem::size_of::<GetStandardAllocPrivDataCommand>(), result_size)?;
    msg.writer().put(&command)?;
    msg.send_sync()?;

    let mut reader = PayloadReader::new(msg.result());
    let reply: GetStandardAllocPrivDataReturn = reader.read()?;
    CoreError::check_status(reply.status)?;
    if request.alloc_priv_size != 0 && reply.priv_driver_data_size != request.alloc_priv_size {
        return Err(CoreError::InvalidArgument("standard allocation private data size mismatch"));
    }
    if request.resource_priv_size != 0 && reply.priv_driver_resource_size != request.resource_priv_size {
        return Err(CoreError::InvalidArgument("standard allocation resource data size mismatch"));
    }

    let mut data = StdAllocData {
        alloc_priv_size: reply.priv_driver_data_size,
        resource_priv_size: reply.priv_driver_resource_size,
        ..Default::default()
    };
    if request.fetch_data {
        data.alloc_priv = read_blob(&mut reader, reply.priv_driver_data_size as usize)?;
        data.resource_priv = read_blob(&mut reader, reply.priv_driver_resource_size as usize)?;
    }
    Ok(data)
}
