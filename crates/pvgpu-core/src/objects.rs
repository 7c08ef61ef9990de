use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pvgpu_protocol::{D3dkmtHandle, PageGeometry};

use crate::memory::PinnedPages;

/// A user-space CPU mapping of an allocation, shared by nested lock calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMapping {
    pub user_va: u64,
    pub refcount: u32,
}

/// Guest-side state of one host allocation.
#[derive(Debug)]
pub struct Allocation {
    handle: D3dkmtHandle,
    size: u64,
    cached: bool,
    pinned: Mutex<Option<PinnedPages>>,
    cpu: Mutex<Option<CpuMapping>>,
}

impl Allocation {
    pub fn new(handle: D3dkmtHandle, size: u64, cached: bool, pinned: Option<PinnedPages>) -> Self {
        Self {
            handle,
            size,
            cached,
            pinned: Mutex::new(pinned),
            cpu: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> D3dkmtHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// True when the allocation is backed by pinned user memory.
    pub fn is_sysmem(&self) -> bool {
        self.pinned.lock().is_some()
    }

    /// Whole pages covered by the host allocation size.
    pub fn num_pages(&self, geometry: PageGeometry) -> u64 {
        self.size >> geometry.shift()
    }

    /// User address of the system memory backing the allocation.
    pub fn sysmem_user_va(&self) -> Option<u64> {
        self.pinned.lock().as_ref().map(|pages| pages.user_va)
    }

    pub(crate) fn pinned_frames(&self) -> Vec<u64> {
        self.pinned.lock().as_ref().map(|pages| pages.frames.clone()).unwrap_or_default()
    }

    /// Attach pinned backing pages. Hands them back if the allocation already has some.
    pub(crate) fn attach_pinned_pages(&self, pages: PinnedPages) -> Result<(), PinnedPages> {
        let mut slot = self.pinned.lock();
        if slot.is_some() {
            return Err(pages);
        }
        *slot = Some(pages);
        Ok(())
    }

    pub fn take_pinned_pages(&self) -> Option<PinnedPages> {
        self.pinned.lock().take()
    }

    pub fn cpu_mapping(&self) -> Option<CpuMapping> {
        *self.cpu.lock()
    }

    pub(crate) fn cpu_slot(&self) -> &Mutex<Option<CpuMapping>> {
        &self.cpu
    }
}

#[derive(Debug)]
pub struct Resource {
    handle: D3dkmtHandle,
}

impl Resource {
    pub fn new(handle: D3dkmtHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> D3dkmtHandle {
        self.handle
    }
}

/// A hardware queue and its progress fence.
#[derive(Debug)]
pub struct HwQueue {
    handle: D3dkmtHandle,
    progress_fence: D3dkmtHandle,
    progress_fence_gpu_va: u64,
    /// User address the host's fence storage is mapped at, 0 until mapped
    progress_fence_cpu_va: AtomicU64,
}

impl HwQueue {
    pub fn new(handle: D3dkmtHandle, progress_fence: D3dkmtHandle, progress_fence_gpu_va: u64) -> Self {
        Self {
            handle,
            progress_fence,
            progress_fence_gpu_va,
            progress_fence_cpu_va: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> D3dkmtHandle {
        self.handle
    }

    pub fn progress_fence(&self) -> D3dkmtHandle {
        self.progress_fence
    }

    pub fn progress_fence_gpu_va(&self) -> u64 {
        self.progress_fence_gpu_va
    }

    pub fn progress_fence_cpu_va(&self) -> Option<u64> {
        match self.progress_fence_cpu_va.load(Ordering::Acquire) {
            0 => None,
            va => Some(va),
        }
    }

    pub(crate) fn set_progress_fence_cpu_va(&self, va: u64) {
        self.progress_fence_cpu_va.store(va, Ordering::Release);
    }

    pub(crate) fn take_progress_fence_cpu_va(&self) -> Option<u64> {
        match self.progress_fence_cpu_va.swap(0, Ordering::AcqRel) {
            0 => None,
            va => Some(va),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Allocation,
    Resource,
    HwQueue,
    MonitoredFence,
}

/// An object registered in a process handle table.
#[derive(Debug, Clone)]
pub enum HandleObject {
    Allocation(Arc<Allocation>),
    Resource(Arc<Resource>),
    HwQueue(Arc<HwQueue>),
    /// A hardware queue's progress fence, resolved to its queue
    MonitoredFence(Arc<HwQueue>),
}

impl HandleObject {
    pub fn kind(&self) -> HandleKind {
        match self {
            HandleObject::Allocation(_) => HandleKind::Allocation,
            HandleObject::Resource(_) => HandleKind::Resource,
            HandleObject::HwQueue(_) => HandleKind::HwQueue,
            HandleObject::MonitoredFence(_) => HandleKind::MonitoredFence,
        }
    }

    pub fn as_allocation(&self) -> Option<&Arc<Allocation>> {
        match self {
            HandleObject::Allocation(a) => Some(a),
            _ => None,
        }
    }
}

/// Where a host fence page is visible to the guest process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceMapping {
    pub cpu_va: u64,
    pub gpu_va: u64,
}
