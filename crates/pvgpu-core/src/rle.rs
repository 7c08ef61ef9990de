//! Run-length page lists for allocations backed by existing system memory.

use pvgpu_protocol::pages::{page_runs, PAGE_ENTRY_SIZE};
use pvgpu_protocol::PageGeometry;

use crate::error::{CoreError, CoreResult};

/// Worst-case entry count for allocations of the given host sizes: one entry per page.
pub fn rle_capacity(sizes: &[u64], geometry: PageGeometry) -> usize {
    sizes.iter().map(|&size| geometry.pages_for(size) as usize).sum()
}

/// Writes page-list entries into a fixed region of a command payload.
///
/// The region is sized up front from [`rle_capacity`]. An encode that would
/// need more entries than remain fails and leaves everything past the
/// region untouched.
pub struct RleEncoder<'a> {
    region: &'a mut [u8],
    geometry: PageGeometry,
    used: usize,
}

impl<'a> RleEncoder<'a> {
    pub fn new(region: &'a mut [u8], geometry: PageGeometry) -> Self {
        Self { region, geometry, used: 0 }
    }

    /// Entries the region can hold.
    pub fn capacity(&self) -> usize {
        self.region.len() / PAGE_ENTRY_SIZE
    }

    /// Entries written so far, across every encoded allocation.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Encode one allocation's frames and return how many entries it took.
    pub fn encode(&mut self, frames: &[u64]) -> CoreResult<u32> {
        let capacity = self.capacity();
        let mut written = 0u32;
        for run in page_runs(frames, self.geometry) {
            if self.used >= capacity {
                return Err(CoreError::RleOverflow { capacity });
            }
            let entry = self.geometry.encode(run);
            let start = self.used * PAGE_ENTRY_SIZE;
            self.region[start..start + PAGE_ENTRY_SIZE].copy_from_slice(&entry.to_ne_bytes());
            self.used += 1;
            written += 1;
        }
        Ok(written)
    }

    /// Bytes of the region actually filled.
    pub fn encoded_len(&self) -> usize {
        self.used * PAGE_ENTRY_SIZE
    }
}
