//! Memory collaborators: user page pinning and io space mapping.

use pvgpu_protocol::Errno;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PinError {
    #[error("pinned {pinned} of {requested} pages at {user_va:#x}")]
    Partial { user_va: u64, requested: usize, pinned: usize },

    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("physical range {phys:#x}+{size:#x} is outside the io space region")]
    OutsideRegion { phys: u64, size: u64 },

    #[error("no io space region has been configured")]
    NoRegion,

    #[error("mapping failed: {0}")]
    Failed(String),
}

impl MapError {
    pub fn errno(&self) -> Errno {
        match self {
            MapError::OutsideRegion { .. } | MapError::NoRegion => Errno::InvalidArgument,
            MapError::Failed(_) => Errno::OutOfMemory,
        }
    }
}

/// User pages held resident for the lifetime of an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinnedPages {
    pub user_va: u64,
    pub writable: bool,
    /// Physical frame number of every page, in virtual address order
    pub frames: Vec<u64>,
}

impl PinnedPages {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Resolves user virtual memory to pinned physical pages.
pub trait PagePinner: Send + Sync {
    /// Pin `page_count` pages starting at `user_va`. Either every page is
    /// pinned or none is.
    fn pin_user_pages(&self, user_va: u64, page_count: usize, writable: bool) -> Result<PinnedPages, PinError>;

    fn unpin_user_pages(&self, pages: PinnedPages);
}

/// Creates user virtual mappings of device io space.
pub trait IoSpaceMapper: Send + Sync {
    /// Map the page-aligned physical range and return the user address of its first byte.
    fn map(&self, phys: u64, size: u64, writable: bool, cached: bool) -> Result<u64, MapError>;

    fn unmap(&self, user_va: u64, size: u64) -> Result<(), MapError>;
}
