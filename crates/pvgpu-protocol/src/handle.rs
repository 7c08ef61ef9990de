use std::fmt;

use bytemuck::{Pod, Zeroable};

/// Opaque 32-bit handle naming a host-side or table-registered object
/// (process, adapter, device, context, allocation, resource, sync object,
/// paging queue, hardware queue).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct D3dkmtHandle(pub u32);

impl D3dkmtHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for D3dkmtHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for D3dkmtHandle {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Locally unique identifier used by the host to name adapters and vGPUs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct WinLuid {
    pub low: u32,
    pub high: i32,
}

impl WinLuid {
    pub fn is_zero(&self) -> bool {
        self.low == 0 && self.high == 0
    }
}

impl fmt::Display for WinLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.high as u32, self.low)
    }
}

/// Encode a string into a fixed UTF-16 field, truncating and keeping a NUL terminator.
pub fn encode_wide<const N: usize>(s: &str) -> [u16; N] {
    let mut out = [0u16; N];
    for (slot, unit) in out.iter_mut().take(N.saturating_sub(1)).zip(s.encode_utf16()) {
        *slot = unit;
    }
    out
}

/// Decode a NUL-terminated UTF-16 field.
pub fn decode_wide(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}
