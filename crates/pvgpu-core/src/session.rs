use std::sync::{Arc, OnceLock};

use pvgpu_protocol::command::INTERFACE_VERSION;
use pvgpu_protocol::{D3dkmtHandle, PageGeometry, WinLuid};
use pvgpu_transport::{ChannelEndpoint, VmBusChannel};
use tracing::{info, warn};

use crate::config::PvgpuConfig;
use crate::error::CoreResult;
use crate::handle_table::HandleTable;
use crate::memory::{IoSpaceMapper, MapError, PagePinner};

/// How commands that tolerate not observing completion are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Block for the host's status
    Sync,
    /// Fire-and-forget on the global channel, header async bit set
    Async,
}

/// Physical range of device io space shared with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSpaceRegion {
    pub base: u64,
    pub size: u64,
}

impl IoSpaceRegion {
    /// True when `[phys, phys + size)` lies inside the region. A range may
    /// end exactly at the region end, so the last page is mappable.
    pub fn contains(&self, phys: u64, size: u64) -> bool {
        match (phys.checked_sub(self.base), phys.checked_add(size)) {
            (Some(_), Some(end)) => end <= self.base.saturating_add(self.size),
            _ => false,
        }
    }
}

/// VM-wide state shared by every operation.
///
/// The protocol version and global channel are fixed at construction. The
/// async capability is recorded once, by the first adapter-info
/// negotiation, and the io space region once, by `set_iospace_region`.
pub struct Session {
    config: PvgpuConfig,
    geometry: PageGeometry,
    vmbus_version: u32,
    global: ChannelEndpoint,
    async_msg: OnceLock<bool>,
    iospace: OnceLock<IoSpaceRegion>,
}

impl Session {
    pub fn new(config: PvgpuConfig, vmbus_version: u32, global: Arc<dyn VmBusChannel>) -> CoreResult<Self> {
        let geometry = config.page_geometry()?;
        info!(vmbus_version, max_packet = config.max_packet_size(), "session created");
        Ok(Self {
            config,
            geometry,
            vmbus_version,
            global: ChannelEndpoint::new("global", global),
            async_msg: OnceLock::new(),
            iospace: OnceLock::new(),
        })
    }

    /// Session speaking the interface version named in the configuration.
    pub fn from_config(config: PvgpuConfig, global: Arc<dyn VmBusChannel>) -> CoreResult<Self> {
        let version = config.protocol.interface_version;
        Self::new(config, version, global)
    }

    pub fn config(&self) -> &PvgpuConfig {
        &self.config
    }

    pub fn vmbus_version(&self) -> u32 {
        self.vmbus_version
    }

    /// Messages carry an extended header on this interface.
    pub fn uses_ext_header(&self) -> bool {
        self.vmbus_version >= INTERFACE_VERSION
    }

    pub fn max_packet_size(&self) -> usize {
        self.config.max_packet_size()
    }

    pub fn page_geometry(&self) -> PageGeometry {
        self.geometry
    }

    pub fn global_channel(&self) -> &ChannelEndpoint {
        &self.global
    }

    /// False until negotiation has recorded the host's answer.
    pub fn async_msg_enabled(&self) -> bool {
        self.async_msg.get().copied().unwrap_or(false)
    }

    pub fn dispatch(&self) -> Dispatch {
        if self.async_msg_enabled() {
            Dispatch::Async
        } else {
            Dispatch::Sync
        }
    }

    pub(crate) fn record_async_capability(&self, enabled: bool) {
        if self.async_msg.set(enabled).is_err() && self.async_msg_enabled() != enabled {
            warn!(enabled, "adapter disagrees with the negotiated async capability, ignoring");
        }
    }

    pub fn iospace(&self) -> Option<IoSpaceRegion> {
        self.iospace.get().copied()
    }

    pub(crate) fn record_iospace(&self, region: IoSpaceRegion) {
        if self.iospace.set(region).is_err() {
            warn!(base = region.base, size = region.size, "io space region already set");
        }
    }

    /// Validate a host-supplied physical range against the io space region.
    pub(crate) fn check_iospace(&self, phys: u64, size: u64) -> Result<(), MapError> {
        let region = self.iospace().ok_or(MapError::NoRegion)?;
        if region.contains(phys, size) {
            Ok(())
        } else {
            Err(MapError::OutsideRegion { phys, size })
        }
    }
}

/// Host-visible identity of one virtual GPU.
pub struct Adapter {
    channel: ChannelEndpoint,
    host_handle: D3dkmtHandle,
    host_adapter_luid: WinLuid,
    host_vgpu_luid: WinLuid,
    guest_luid: WinLuid,
    device_description: String,
    device_instance_id: String,
}

impl Adapter {
    pub fn new(name: impl Into<String>, guest_luid: WinLuid, channel: Arc<dyn VmBusChannel>) -> Self {
        Self {
            channel: ChannelEndpoint::new(name, channel),
            host_handle: D3dkmtHandle::NULL,
            host_adapter_luid: WinLuid::default(),
            host_vgpu_luid: WinLuid::default(),
            guest_luid,
            device_description: String::new(),
            device_instance_id: String::new(),
        }
    }

    pub fn channel(&self) -> &ChannelEndpoint {
        &self.channel
    }

    pub fn host_handle(&self) -> D3dkmtHandle {
        self.host_handle
    }

    pub fn host_adapter_luid(&self) -> WinLuid {
        self.host_adapter_luid
    }

    pub fn host_vgpu_luid(&self) -> WinLuid {
        self.host_vgpu_luid
    }

    pub fn guest_luid(&self) -> WinLuid {
        self.guest_luid
    }

    pub fn device_description(&self) -> &str {
        &self.device_description
    }

    pub fn device_instance_id(&self) -> &str {
        &self.device_instance_id
    }

    pub(crate) fn set_host_handle(&mut self, handle: D3dkmtHandle) {
        self.host_handle = handle;
    }

    pub(crate) fn set_identity(
        &mut self,
        host_adapter_luid: WinLuid,
        host_vgpu_luid: WinLuid,
        description: String,
        instance_id: String,
    ) {
        self.host_adapter_luid = host_adapter_luid;
        self.host_vgpu_luid = host_vgpu_luid;
        self.device_description = description;
        self.device_instance_id = instance_id;
    }
}

/// A guest process known to the host, with the collaborators acting on its
/// address space and handle table.
pub struct Process {
    pid: u32,
    name: String,
    host_handle: D3dkmtHandle,
    handles: Arc<dyn HandleTable>,
    pinner: Arc<dyn PagePinner>,
    mapper: Arc<dyn IoSpaceMapper>,
}

impl Process {
    pub fn new(
        pid: u32,
        name: impl Into<String>,
        handles: Arc<dyn HandleTable>,
        pinner: Arc<dyn PagePinner>,
        mapper: Arc<dyn IoSpaceMapper>,
    ) -> Self {
        Self {
            pid,
            name: name.into(),
            host_handle: D3dkmtHandle::NULL,
            handles,
            pinner,
            mapper,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_handle(&self) -> D3dkmtHandle {
        self.host_handle
    }

    pub fn handles(&self) -> &dyn HandleTable {
        self.handles.as_ref()
    }

    pub fn pinner(&self) -> &dyn PagePinner {
        self.pinner.as_ref()
    }

    pub fn mapper(&self) -> &dyn IoSpaceMapper {
        self.mapper.as_ref()
    }

    pub(crate) fn set_host_handle(&mut self, handle: D3dkmtHandle) {
        self.host_handle = handle;
    }
}
