//! Shared fixtures: a scripted host channel, fake guest memory and a
//! harness that brings a session up to the point operations can run.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use pvgpu_core::config::PvgpuConfig;
use pvgpu_core::memory::{IoSpaceMapper, MapError, PagePinner, PinError, PinnedPages};
use pvgpu_core::ops::{adapter, global};
use pvgpu_core::{Adapter, DashMapHandleTable, Process, Session};
use pvgpu_protocol::adapter_commands::{GetInternalAdapterInfoReturn, OpenAdapterReturn, ADAPTER_INFO_ASYNC_MSG};
use pvgpu_protocol::command::{decode_tag, split_message, INTERFACE_VERSION, LAST_COMPATIBLE_INTERFACE_VERSION};
use pvgpu_protocol::global_commands::CreateProcessReturn;
use pvgpu_protocol::handle::encode_wide;
use pvgpu_protocol::{CommandTag, D3dkmtHandle, ExtHeader, GlobalCommand, NtStatus, VgpuCommand, WinLuid};
use pvgpu_transport::{ChannelError, VmBusChannel};

pub const HOST_PROCESS: D3dkmtHandle = D3dkmtHandle(0x4000_0100);
pub const HOST_ADAPTER: D3dkmtHandle = D3dkmtHandle(0x4000_0200);
pub const DEVICE: D3dkmtHandle = D3dkmtHandle(0x4000_0300);
pub const GUEST_LUID: WinLuid = WinLuid { low: 0x11, high: 0 };
pub const HOST_ADAPTER_LUID: WinLuid = WinLuid { low: 0x1000, high: 0 };
pub const VGPU_LUID: WinLuid = WinLuid { low: 0x2000, high: 1 };
pub const DESCRIPTION: &str = "fake vgpu";

pub const IOSPACE_BASE: u64 = 0x1_0000_0000;
pub const IOSPACE_SIZE: u64 = 0x1000_0000;
/// User address the fake mapper places physical address 0 at
pub const USER_MAP_BASE: u64 = 0x7f00_0000_0000;

/// Key a scripted reply is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Global(GlobalCommand),
    Vgpu(VgpuCommand),
}

impl From<GlobalCommand> for Command {
    fn from(c: GlobalCommand) -> Self {
        Command::Global(c)
    }
}

impl From<VgpuCommand> for Command {
    fn from(c: VgpuCommand) -> Self {
        Command::Vgpu(c)
    }
}

/// One request as the host saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub command: Command,
    pub is_async: bool,
    pub expects_reply: bool,
    pub ext: Option<ExtHeader>,
    /// Command bytes after the extended header
    pub payload: Vec<u8>,
}

type Handler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Host side of one channel. Requests are recorded and answered by the
/// handler registered for their command, or with a bare success status.
pub struct FakeHost {
    name: &'static str,
    has_ext_header: bool,
    handlers: Mutex<HashMap<Command, Handler>>,
    requests: Mutex<Vec<Recorded>>,
}

impl FakeHost {
    pub fn new(name: &'static str, has_ext_header: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            has_ext_header,
            handlers: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn on(&self, command: impl Into<Command>, handler: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
        self.handlers.lock().insert(command.into(), Box::new(handler));
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    /// Requests carrying `command`, in send order.
    pub fn sent(&self, command: impl Into<Command>) -> Vec<Recorded> {
        let command = command.into();
        self.requests.lock().iter().filter(|r| r.command == command).cloned().collect()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }

    fn record(&self, request: &[u8], expects_reply: bool) -> Result<Recorded, ChannelError> {
        let (ext, payload) =
            split_message(request, self.has_ext_header).map_err(|e| ChannelError::Send(e.to_string()))?;
        let (command, is_async) = match decode_tag(payload).map_err(|e| ChannelError::Send(e.to_string()))? {
            CommandTag::Global(c) => (Command::Global(c), false),
            CommandTag::Vgpu { command, is_async } => (Command::Vgpu(command), is_async),
        };
        let recorded = Recorded {
            command,
            is_async,
            expects_reply,
            ext,
            payload: payload.to_vec(),
        };
        self.requests.lock().push(recorded.clone());
        Ok(recorded)
    }
}

impl VmBusChannel for FakeHost {
    fn send_sync(&self, request: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let recorded = self.record(request, true)?;
        let mut handlers = self.handlers.lock();
        match handlers.get_mut(&recorded.command) {
            Some(handler) => Ok(handler(&recorded.payload)),
            None => Ok(status(NtStatus::SUCCESS)),
        }
    }

    fn send_async(&self, request: &[u8]) -> Result<(), ChannelError> {
        self.record(request, false).map(|_| ())
    }
}

impl std::fmt::Debug for FakeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHost").field("name", &self.name).finish()
    }
}

// ── Reply and payload helpers ───────────────────────────────────────────────

pub fn reply<T: Pod>(value: &T) -> Vec<u8> {
    bytemuck::bytes_of(value).to_vec()
}

pub fn status(status: NtStatus) -> Vec<u8> {
    reply(&status)
}

/// Append the raw bytes of `values` to `out`.
pub fn extend<T: Pod>(out: &mut Vec<u8>, values: &[T]) {
    out.extend_from_slice(bytemuck::cast_slice(values));
}

/// Decode the fixed command struct at the start of a payload.
pub fn read_command<T: Pod>(payload: &[u8]) -> T {
    bytemuck::pod_read_unaligned(&payload[..std::mem::size_of::<T>()])
}

/// Decode `count` entries of `T` starting at byte `offset`.
pub fn trailing<T: Pod>(payload: &[u8], offset: usize, count: usize) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    (0..count)
        .map(|i| bytemuck::pod_read_unaligned(&payload[offset + i * size..offset + (i + 1) * size]))
        .collect()
}

// ── Guest memory ────────────────────────────────────────────────────────────

/// Pinner and mapper over an imaginary address space. Page frames follow
/// the user address, one apart or, when `scattered` is set, two apart.
#[derive(Default)]
pub struct FakeMemory {
    pub scattered: AtomicBool,
    pub fail_pin: AtomicBool,
    pub fail_map: AtomicBool,
    live_pins: AtomicUsize,
    mappings: Mutex<HashMap<u64, u64>>,
}

impl FakeMemory {
    pub fn live_pins(&self) -> usize {
        self.live_pins.load(Ordering::SeqCst)
    }

    /// Live mappings as (user address, size), sorted by address.
    pub fn live_mappings(&self) -> Vec<(u64, u64)> {
        let mut mappings: Vec<_> = self.mappings.lock().iter().map(|(&va, &size)| (va, size)).collect();
        mappings.sort_unstable();
        mappings
    }
}

impl PagePinner for FakeMemory {
    fn pin_user_pages(&self, user_va: u64, page_count: usize, writable: bool) -> Result<PinnedPages, PinError> {
        if self.fail_pin.load(Ordering::SeqCst) {
            return Err(PinError::Partial { user_va, requested: page_count, pinned: 0 });
        }
        let stride = if self.scattered.load(Ordering::SeqCst) { 2 } else { 1 };
        let base = user_va >> 12;
        let frames = (0..page_count as u64).map(|i| base + i * stride).collect();
        self.live_pins.fetch_add(1, Ordering::SeqCst);
        Ok(PinnedPages { user_va, writable, frames })
    }

    fn unpin_user_pages(&self, _pages: PinnedPages) {
        self.live_pins.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IoSpaceMapper for FakeMemory {
    fn map(&self, phys: u64, size: u64, _writable: bool, _cached: bool) -> Result<u64, MapError> {
        if self.fail_map.load(Ordering::SeqCst) {
            return Err(MapError::Failed("injected map failure".to_string()));
        }
        let user_va = USER_MAP_BASE + phys;
        self.mappings.lock().insert(user_va, size);
        Ok(user_va)
    }

    fn unmap(&self, user_va: u64, size: u64) -> Result<(), MapError> {
        match self.mappings.lock().remove(&user_va) {
            Some(mapped) if mapped == size => Ok(()),
            Some(mapped) => Err(MapError::Failed(format!("unmap of {size:#x} bytes, mapped {mapped:#x}"))),
            None => Err(MapError::Failed(format!("{user_va:#x} is not mapped"))),
        }
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

pub struct HarnessBuilder {
    config: PvgpuConfig,
    version: u32,
    async_msg: bool,
    handle_limit: Option<usize>,
}

impl HarnessBuilder {
    pub fn config(mut self, config: PvgpuConfig) -> Self {
        self.config = config;
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Have the adapter advertise asynchronous messages.
    pub fn async_msg(mut self) -> Self {
        self.async_msg = true;
        self
    }

    pub fn handle_limit(mut self, limit: usize) -> Self {
        self.handle_limit = Some(limit);
        self
    }

    pub fn build(self) -> Harness {
        pvgpu_common::try_init_logging();

        let has_ext = self.version >= INTERFACE_VERSION;
        let global = FakeHost::new("global", has_ext);
        let vgpu = FakeHost::new("vgpu", has_ext);
        let memory = Arc::new(FakeMemory::default());
        let handles = Arc::new(match self.handle_limit {
            Some(limit) => DashMapHandleTable::with_limit(limit),
            None => DashMapHandleTable::new(),
        });

        global.on(GlobalCommand::CreateProcess, |_| reply(&CreateProcessReturn { hprocess: HOST_PROCESS }));
        vgpu.on(VgpuCommand::OpenAdapter, |_| {
            reply(&OpenAdapterReturn {
                host_adapter_handle: HOST_ADAPTER,
                status: NtStatus::SUCCESS,
                vmbus_interface_version: INTERFACE_VERSION,
                vmbus_last_compatible_interface_version: LAST_COMPATIBLE_INTERFACE_VERSION,
            })
        });
        let async_msg = self.async_msg;
        vgpu.on(VgpuCommand::GetInternalAdapterInfo, move |_| adapter_info_reply(async_msg, has_ext));

        let session = Session::new(self.config, self.version, global.clone()).expect("session");
        let mut adapter = Adapter::new("vgpu0", GUEST_LUID, vgpu.clone());
        let mut process = Process::new(4242, "harness", handles.clone(), memory.clone(), memory.clone());

        global::set_iospace_region(&session, IOSPACE_BASE, IOSPACE_SIZE, 0).expect("set_iospace_region");
        global::create_process(&session, &mut process).expect("create_process");
        adapter::open_adapter(&session, &mut adapter).expect("open_adapter");
        adapter::get_internal_adapter_info(&session, &mut adapter).expect("get_internal_adapter_info");
        global.clear();
        vgpu.clear();

        Harness { session, adapter, process, global, vgpu, memory, handles }
    }
}

/// Adapter info as the fake host reports it. Pre-extension interfaces get
/// the reply without its trailing vGPU LUID.
pub fn adapter_info_reply(async_msg: bool, has_ext: bool) -> Vec<u8> {
    let mut info = GetInternalAdapterInfoReturn::zeroed();
    if async_msg {
        info.flags = ADAPTER_INFO_ASYNC_MSG;
    }
    info.host_adapter_luid = HOST_ADAPTER_LUID;
    info.host_vgpu_luid = VGPU_LUID;
    info.device_description = encode_wide(DESCRIPTION);
    info.device_instance_id = encode_wide("PCI\\VEN_1414");
    let mut bytes = reply(&info);
    if !has_ext {
        bytes.truncate(bytes.len() - std::mem::size_of::<WinLuid>());
    }
    bytes
}

/// A session with one opened adapter and one registered process.
pub struct Harness {
    pub session: Session,
    pub adapter: Adapter,
    pub process: Process,
    pub global: Arc<FakeHost>,
    pub vgpu: Arc<FakeHost>,
    pub memory: Arc<FakeMemory>,
    pub handles: Arc<DashMapHandleTable>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: PvgpuConfig::default(),
            version: INTERFACE_VERSION,
            async_msg: false,
            handle_limit: None,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Host that receives plain per-adapter messages in this session.
    pub fn adapter_host(&self) -> &FakeHost {
        if self.session.async_msg_enabled() {
            &self.global
        } else {
            &self.vgpu
        }
    }

    /// Script a reply on whichever host receives per-adapter messages.
    pub fn on(&self, command: VgpuCommand, handler: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
        self.adapter_host().on(command, handler);
    }

    /// The only request of `command` on the per-adapter host.
    pub fn only(&self, command: VgpuCommand) -> Recorded {
        let mut sent = self.adapter_host().sent(command);
        assert_eq!(sent.len(), 1, "expected exactly one {command:?}, got {}", sent.len());
        sent.remove(0)
    }
}
