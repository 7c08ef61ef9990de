use bytemuck::Pod;

/// Maximum size of a single bus packet, request or reply: 128 KiB
pub const MAX_PACKET_SIZE: usize = 128 * 1024;

/// Result buffers are allocated in multiples of this many bytes.
pub const RESULT_ALIGNMENT: usize = 8;

/// Round a result size up to [`RESULT_ALIGNMENT`].
pub const fn align_result_size(size: usize) -> usize {
    (size + RESULT_ALIGNMENT - 1) & !(RESULT_ALIGNMENT - 1)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("section of {needed} bytes overruns the message ({remaining} bytes left)")]
    Overrun { needed: usize, remaining: usize },

    #[error("truncated reply: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("section size overflows usize")]
    SizeOverflow,
}

/// Appends the ordered sections of a command payload into a pre-sized buffer.
///
/// Sections are written at the current position and never reordered. A
/// section that does not fit fails without touching the buffer.
pub struct PayloadWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PayloadWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Write one fixed-size struct.
    pub fn put<T: Pod>(&mut self, value: &T) -> Result<(), WireError> {
        self.put_bytes(bytemuck::bytes_of(value))
    }

    /// Write an array of fixed-size entries.
    pub fn put_slice<T: Pod>(&mut self, values: &[T]) -> Result<(), WireError> {
        self.put_bytes(bytemuck::cast_slice(values))
    }

    /// Write an opaque blob verbatim.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Claim the next `len` bytes for the caller to fill in place.
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8], WireError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(WireError::Overrun { needed: len, remaining });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&mut self.buf[start..start + len])
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Reads reply sections in the order the request fixed them.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read<T: Pod>(&mut self) -> Result<T, WireError> {
        let bytes = self.read_bytes(std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn read_vec<T: Pod>(&mut self, count: usize) -> Result<Vec<T>, WireError> {
        let entry = std::mem::size_of::<T>();
        let len = entry.checked_mul(count).ok_or(WireError::SizeOverflow)?;
        let bytes = self.read_bytes(len)?;
        Ok(bytes.chunks_exact(entry).map(bytemuck::pod_read_unaligned).collect())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(WireError::Truncated { needed: len, remaining });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..start + len])
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
