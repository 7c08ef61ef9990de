use std::fmt;

use bytemuck::{Pod, Zeroable};

/// 32-bit status code in the host's native domain.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct NtStatus(pub i32);

const fn failure(code: u32) -> NtStatus {
    NtStatus(code as i32)
}

impl NtStatus {
    pub const SUCCESS: Self = Self(0);
    pub const TIMEOUT: Self = Self(0x0000_0102);
    pub const PENDING: Self = Self(0x0000_0103);
    pub const UNSUCCESSFUL: Self = failure(0xC000_0001);
    pub const NOT_IMPLEMENTED: Self = failure(0xC000_0002);
    pub const INVALID_HANDLE: Self = failure(0xC000_0008);
    pub const INVALID_PARAMETER: Self = failure(0xC000_000D);
    pub const NO_MEMORY: Self = failure(0xC000_0017);
    pub const ILLEGAL_INSTRUCTION: Self = failure(0xC000_001D);
    pub const ACCESS_DENIED: Self = failure(0xC000_0022);
    pub const BUFFER_TOO_SMALL: Self = failure(0xC000_0023);
    pub const OBJECT_TYPE_MISMATCH: Self = failure(0xC000_0024);
    pub const OBJECT_NAME_INVALID: Self = failure(0xC000_0033);
    pub const OBJECT_NAME_NOT_FOUND: Self = failure(0xC000_0034);
    pub const OBJECT_NAME_COLLISION: Self = failure(0xC000_0035);
    pub const NOT_SUPPORTED: Self = failure(0xC000_00BB);
    pub const DEVICE_REMOVED: Self = failure(0xC000_02B6);
    pub const GRAPHICS_ALLOCATION_BUSY: Self = failure(0xC01E_0102);

    /// Success iff the severity bit is clear.
    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn is_pending(self) -> bool {
        self == Self::PENDING
    }

    /// Translate into the local error domain. See [`ntstatus_to_errno`].
    pub fn into_result(self) -> Result<i32, Errno> {
        ntstatus_to_errno(self)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

/// POSIX-style local error kinds returned to callers of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Errno {
    #[error("operation not permitted (EPERM)")]
    NotPermitted,
    #[error("no such entry (ENOENT)")]
    NotFound,
    #[error("I/O error (EIO)")]
    Io,
    #[error("bad descriptor (EBADF)")]
    BadDescriptor,
    #[error("try again (EAGAIN)")]
    TryAgain,
    #[error("out of memory (ENOMEM)")]
    OutOfMemory,
    #[error("permission denied (EACCES)")]
    PermissionDenied,
    #[error("already exists (EEXIST)")]
    AlreadyExists,
    #[error("no such device (ENODEV)")]
    NoSuchDevice,
    #[error("invalid argument (EINVAL)")]
    InvalidArgument,
    #[error("value too large (EOVERFLOW)")]
    ValueTooLarge,
    #[error("wrong protocol type (EPROTOTYPE)")]
    WrongProtocolType,
    #[error("operation not supported (EOPNOTSUPP)")]
    NotSupported,
    #[error("operation in progress (EINPROGRESS)")]
    InProgress,
    #[error("state not recoverable (ENOTRECOVERABLE)")]
    NotRecoverable,
}

impl Errno {
    /// Positive errno value as defined by Linux.
    pub const fn code(self) -> i32 {
        match self {
            Errno::NotPermitted => 1,
            Errno::NotFound => 2,
            Errno::Io => 5,
            Errno::BadDescriptor => 9,
            Errno::TryAgain => 11,
            Errno::OutOfMemory => 12,
            Errno::PermissionDenied => 13,
            Errno::AlreadyExists => 17,
            Errno::NoSuchDevice => 19,
            Errno::InvalidArgument => 22,
            Errno::ValueTooLarge => 75,
            Errno::WrongProtocolType => 91,
            Errno::NotSupported => 95,
            Errno::InProgress => 115,
            Errno::NotRecoverable => 131,
        }
    }

    /// Negative return value in kernel convention.
    pub const fn to_negative(self) -> i32 {
        -self.code()
    }
}

/// Foreign status to local error mapping. Codes absent from the table fall
/// back to success pass-through or [`Errno::InvalidArgument`].
pub const STATUS_ERRNO_TABLE: &[(NtStatus, Errno)] = &[
    (NtStatus::OBJECT_NAME_COLLISION, Errno::AlreadyExists),
    (NtStatus::NO_MEMORY, Errno::OutOfMemory),
    (NtStatus::INVALID_PARAMETER, Errno::InvalidArgument),
    (NtStatus::OBJECT_NAME_INVALID, Errno::NotFound),
    (NtStatus::OBJECT_NAME_NOT_FOUND, Errno::NotFound),
    // Success-class, so shadowed by the pass-through in `ntstatus_to_errno`.
    (NtStatus::TIMEOUT, Errno::TryAgain),
    (NtStatus::BUFFER_TOO_SMALL, Errno::ValueTooLarge),
    (NtStatus::DEVICE_REMOVED, Errno::NoSuchDevice),
    (NtStatus::ACCESS_DENIED, Errno::PermissionDenied),
    (NtStatus::NOT_SUPPORTED, Errno::NotPermitted),
    (NtStatus::NOT_IMPLEMENTED, Errno::NotPermitted),
    (NtStatus::ILLEGAL_INSTRUCTION, Errno::NotSupported),
    (NtStatus::INVALID_HANDLE, Errno::BadDescriptor),
    (NtStatus::GRAPHICS_ALLOCATION_BUSY, Errno::InProgress),
    (NtStatus::OBJECT_TYPE_MISMATCH, Errno::WrongProtocolType),
];

/// Translate a foreign status into a local result.
///
/// Success codes (`STATUS_PENDING` and `STATUS_TIMEOUT` included) pass
/// through as their non-negative value. Failures take their table entry,
/// or `InvalidArgument` when unmapped.
pub fn ntstatus_to_errno(status: NtStatus) -> Result<i32, Errno> {
    if status.is_success() {
        return Ok(status.0);
    }
    Err(STATUS_ERRNO_TABLE
        .iter()
        .find(|(s, _)| *s == status)
        .map_or(Errno::InvalidArgument, |&(_, errno)| errno))
}
