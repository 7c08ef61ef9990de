//! Sizing and layout helpers for variable-length command payloads.

use bytemuck::Pod;
use pvgpu_protocol::allocation_commands::AllocInfo;
use pvgpu_protocol::{PayloadReader, WireError};

use crate::error::{CoreError, CoreResult};

/// Reject one private data blob that could never fit a packet.
pub fn check_private_size(what: &'static str, size: usize, max: usize) -> CoreResult<()> {
    if size >= max {
        return Err(CoreError::ValueTooLarge { what, size });
    }
    Ok(())
}

/// Sum per-allocation private data sizes, failing as soon as any entry or
/// the running total reaches the packet limit.
pub fn total_private_size<'a>(blobs: impl IntoIterator<Item = &'a [u8]>, max: usize) -> CoreResult<usize> {
    let mut total = 0usize;
    for blob in blobs {
        check_private_size("allocation private data", blob.len(), max)?;
        total += blob.len();
        check_private_size("total allocation private data", total, max)?;
    }
    Ok(total)
}

/// Byte size of a fixed command followed by variable sections.
pub fn command_size<C: Pod>(sections: &[usize]) -> CoreResult<usize> {
    sections
        .iter()
        .try_fold(std::mem::size_of::<C>(), |acc, &len| acc.checked_add(len))
        .ok_or(CoreError::from(WireError::SizeOverflow))
}

/// Byte size of `count` wire entries of `T`.
pub fn array_size<T: Pod>(count: usize) -> CoreResult<usize> {
    std::mem::size_of::<T>()
        .checked_mul(count)
        .ok_or(CoreError::from(WireError::SizeOverflow))
}

/// Narrow a host-visible count or size to its 32-bit wire field.
pub fn wire_u32(what: &'static str, value: usize) -> CoreResult<u32> {
    u32::try_from(value).map_err(|_| CoreError::ValueTooLarge { what, size: value })
}

/// Descriptor for one allocation in a create request.
pub fn alloc_info(flags: u32, vidpn_source_id: u32, priv_drv_data: &[u8], rle_entries: u32) -> AllocInfo {
    AllocInfo {
        flags,
        priv_drv_data_size: priv_drv_data.len() as u32,
        vidpn_source_id,
        sysmem_pages_rle_size: rle_entries,
    }
}

/// Copy `len` bytes of echoed private data out of a reply section.
pub fn read_blob(reader: &mut PayloadReader<'_>, len: usize) -> CoreResult<Vec<u8>> {
    Ok(reader.read_bytes(len)?.to_vec())
}
