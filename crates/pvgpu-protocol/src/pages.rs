/// Size of one encoded page-list entry on the wire.
pub const PAGE_ENTRY_SIZE: usize = std::mem::size_of::<u64>();

/// A run of physically contiguous pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRun {
    pub base_pfn: u64,
    pub count: u64,
}

/// Page size parameters for the sysmem page-list encoding.
///
/// An entry holds the page-aligned base address in its high bits and
/// `count - 1` in the low `shift` bits, so a single run covers at most one
/// page's worth of pages (4096 with 4 KiB pages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    shift: u32,
}

impl PageGeometry {
    pub const X86_4K: Self = Self { shift: 12 };

    /// Returns `None` for shifts outside 12..=21.
    pub const fn new(shift: u32) -> Option<Self> {
        if shift >= 12 && shift <= 21 {
            Some(Self { shift })
        } else {
            None
        }
    }

    pub const fn shift(self) -> u32 {
        self.shift
    }

    pub const fn page_size(self) -> u64 {
        1 << self.shift
    }

    pub const fn max_run_pages(self) -> u64 {
        self.page_size()
    }

    /// Pages needed to back `bytes`, rounded up.
    pub const fn pages_for(self, bytes: u64) -> u64 {
        (bytes + self.page_size() - 1) >> self.shift
    }

    pub fn encode(self, run: PageRun) -> u64 {
        debug_assert!(run.count >= 1 && run.count <= self.max_run_pages());
        (run.base_pfn << self.shift) | (run.count - 1)
    }

    pub fn decode(self, entry: u64) -> PageRun {
        let mask = self.page_size() - 1;
        PageRun { base_pfn: entry >> self.shift, count: (entry & mask) + 1 }
    }
}

impl Default for PageGeometry {
    fn default() -> Self {
        Self::X86_4K
    }
}

/// Split a frame list into maximal contiguous runs bounded by `max_run_pages`.
pub fn page_runs(frames: &[u64], geometry: PageGeometry) -> Vec<PageRun> {
    let mut runs = Vec::new();
    let Some((&first, rest)) = frames.split_first() else {
        return runs;
    };
    let mut current = PageRun { base_pfn: first, count: 1 };
    for &pfn in rest {
        let contiguous = current.base_pfn.checked_add(current.count) == Some(pfn);
        if contiguous && current.count < geometry.max_run_pages() {
            current.count += 1;
        } else {
            runs.push(current);
            current = PageRun { base_pfn: pfn, count: 1 };
        }
    }
    runs.push(current);
    runs
}

/// Expand encoded entries back into the frame list they describe.
pub fn decode_entries(entries: &[u64], geometry: PageGeometry) -> Vec<u64> {
    entries
        .iter()
        .map(|&e| geometry.decode(e))
        .flat_map(|run| run.base_pfn..run.base_pfn + run.count)
        .collect()
}
