pub mod handle;
pub mod status;
pub mod command;
pub mod global_commands;
pub mod adapter_commands;
pub mod allocation_commands;
pub mod sync_commands;
pub mod pages;
pub mod wire;
pub mod error;

pub use command::{CommandTag, ExtHeader, GlobalCommand, VgpuCommand, VgpuToHostHeader, VmToHostHeader};
pub use error::ProtocolError;
pub use handle::{D3dkmtHandle, WinLuid};
pub use pages::{PageGeometry, PageRun};
pub use status::{ntstatus_to_errno, Errno, NtStatus};
pub use wire::{PayloadReader, PayloadWriter, WireError, MAX_PACKET_SIZE};
