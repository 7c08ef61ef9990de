use bytemuck::{Pod, Zeroable};

use crate::error::ProtocolError;
use crate::handle::{D3dkmtHandle, WinLuid};

/// Interface version at and above which messages carry an [`ExtHeader`].
pub const INTERFACE_VERSION: u32 = 40;

/// Oldest host interface version this guest can talk to.
pub const LAST_COMPATIBLE_INTERFACE_VERSION: u32 = 16;

/// Direction tag carried in every command header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    VgpuToHost = 0,
    VmToHost = 1,
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident = $value:literal,)* }) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl TryFrom<u32> for $name {
            type Error = ProtocolError;

            fn try_from(v: u32) -> Result<Self, Self::Error> {
                match v {
                    $($value => Ok($name::$variant),)*
                    other => Err(ProtocolError::UnknownCommand(other)),
                }
            }
        }
    };
}

wire_enum! {
    /// Commands addressed to the VM-wide host service.
    pub enum GlobalCommand {
        CreateProcess = 1000,
        DestroyProcess = 1001,
        OpenSyncObject = 1002,
        DestroySyncObject = 1003,
        CreateNtSharedObject = 1004,
        DestroyNtSharedObject = 1005,
        SetIoSpaceRegion = 1010,
        ShareObjectWithHost = 1021,
        PresentVirtual = 1022,
    }
}

wire_enum! {
    /// Commands addressed to one virtual GPU.
    pub enum VgpuCommand {
        CreateDevice = 0,
        DestroyDevice = 1,
        QueryAdapterInfo = 2,
        CreateAllocation = 4,
        DestroyAllocation = 5,
        CreateContextVirtual = 6,
        DestroyContext = 7,
        CreateSyncObject = 8,
        CreatePagingQueue = 9,
        DestroyPagingQueue = 10,
        MakeResident = 11,
        Evict = 12,
        Escape = 13,
        OpenAdapter = 14,
        CloseAdapter = 15,
        FreeGpuVirtualAddress = 16,
        MapGpuVirtualAddress = 17,
        ReserveGpuVirtualAddress = 18,
        UpdateGpuVirtualAddress = 19,
        SubmitCommand = 20,
        QueryVideoMemoryInfo = 21,
        WaitForSyncObjectFromCpu = 22,
        Lock2 = 23,
        Unlock2 = 24,
        WaitForSyncObjectFromGpu = 25,
        SignalSyncObject = 26,
        GetDeviceState = 28,
        MarkDeviceAsError = 29,
        OpenResource = 32,
        SetContextSchedulingPriority = 33,
        GetInternalAdapterInfo = 36,
        FlushHeapTransitions = 37,
        GetStandardAllocationDriverData = 39,
        QueryAllocationResidency = 41,
        FlushDevice = 42,
        QueryStatistics = 48,
        ChangeVideoMemoryReservation = 49,
        CreateHwQueue = 50,
        DestroyHwQueue = 51,
        SubmitCommandToHwQueue = 52,
        UpdateAllocationProperty = 56,
        OfferAllocations = 57,
        ReclaimAllocations = 58,
        SetAllocationPriority = 59,
        GetAllocationPriority = 60,
        GetContextSchedulingPriority = 61,
        QueryClockCalibration = 62,
        SetExistingSysmemPages = 66,
        GetAllocationSize = 67,
    }
}

/// Header of every VM-to-host command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct VmToHostHeader {
    pub command_id: u64,
    pub process: D3dkmtHandle,
    /// channel type in bits 0-7, command type in bits 8-31
    pub channel_and_type: u32,
}

impl VmToHostHeader {
    pub fn new(command: GlobalCommand, process: D3dkmtHandle) -> Self {
        Self {
            command_id: 0,
            process,
            channel_and_type: ChannelType::VmToHost as u32 | ((command as u32) << 8),
        }
    }

    pub fn channel_type(&self) -> u8 {
        (self.channel_and_type & 0xff) as u8
    }

    pub fn command_type(&self) -> u32 {
        self.channel_and_type >> 8
    }
}

const ASYNC_MSG_BIT: u32 = 1 << 8;

/// Header of every per-adapter command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct VgpuToHostHeader {
    pub command_id: u64,
    pub process: D3dkmtHandle,
    /// channel type in bits 0-7, async flag in bit 8
    pub channel_flags: u32,
    pub command_type: u32,
    pub reserved: u32,
}

impl VgpuToHostHeader {
    pub fn new(command: VgpuCommand, process: D3dkmtHandle) -> Self {
        Self {
            command_id: 0,
            process,
            channel_flags: ChannelType::VgpuToHost as u32,
            command_type: command as u32,
            reserved: 0,
        }
    }

    /// Header for adapter-level commands that have no process context.
    pub fn without_process(command: VgpuCommand) -> Self {
        Self::new(command, D3dkmtHandle::NULL)
    }

    pub fn set_async(&mut self) {
        self.channel_flags |= ASYNC_MSG_BIT;
    }

    pub fn is_async(&self) -> bool {
        self.channel_flags & ASYNC_MSG_BIT != 0
    }

    pub fn channel_type(&self) -> u8 {
        (self.channel_flags & 0xff) as u8
    }
}

/// Routing prefix present when the negotiated version is at least [`INTERFACE_VERSION`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ExtHeader {
    /// Offset from the start of the message to the command header
    pub command_offset: u32,
    pub reserved: u32,
    pub vgpu_luid: WinLuid,
}

pub const EXT_HEADER_SIZE: usize = std::mem::size_of::<ExtHeader>();

/// Command identity decoded from the first bytes of a command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTag {
    Global(GlobalCommand),
    Vgpu { command: VgpuCommand, is_async: bool },
}

/// Decode the command tag at the start of `payload` (extended header already stripped).
pub fn decode_tag(payload: &[u8]) -> Result<CommandTag, ProtocolError> {
    const CHANNEL_OFFSET: usize = 12;
    let channel = *payload
        .get(CHANNEL_OFFSET)
        .ok_or(ProtocolError::Truncated { needed: CHANNEL_OFFSET + 1, got: payload.len() })?;

    if channel == ChannelType::VmToHost as u8 {
        let hdr: VmToHostHeader = read_header(payload)?;
        Ok(CommandTag::Global(GlobalCommand::try_from(hdr.command_type())?))
    } else if channel == ChannelType::VgpuToHost as u8 {
        let hdr: VgpuToHostHeader = read_header(payload)?;
        Ok(CommandTag::Vgpu {
            command: VgpuCommand::try_from(hdr.command_type)?,
            is_async: hdr.is_async(),
        })
    } else {
        Err(ProtocolError::UnknownChannel(channel))
    }
}

fn read_header<T: Pod>(payload: &[u8]) -> Result<T, ProtocolError> {
    let size = std::mem::size_of::<T>();
    let bytes = payload
        .get(..size)
        .ok_or(ProtocolError::Truncated { needed: size, got: payload.len() })?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

/// Split a framed message into its extended header (if `has_ext_header`) and command payload.
pub fn split_message(message: &[u8], has_ext_header: bool) -> Result<(Option<ExtHeader>, &[u8]), ProtocolError> {
    if !has_ext_header {
        return Ok((None, message));
    }
    let ext: ExtHeader = read_header(message)?;
    let offset = ext.command_offset as usize;
    if offset < EXT_HEADER_SIZE || offset > message.len() {
        return Err(ProtocolError::BadCommandOffset(ext.command_offset));
    }
    Ok((Some(ext), &message[offset..]))
}
