//! Block math.
//!
//! Pure, allocation-free mapping from byte positions and lengths to block
//! indices and cursors. Zero-length operations resolve to zero blocks; the
//! callers reject anything out of range before arriving here.

/// Index of the block containing byte `position`.
pub fn block_index_start(blksize: usize, position: u64) -> u64 {
    position / blksize as u64
}

/// Cursor of byte `position` within its block.
pub fn block_offset(blksize: usize, position: u64) -> usize {
    (position % blksize as u64) as usize
}

/// Number of blocks touched by `length` bytes starting `offset` bytes into
/// the first block. Zero-length operations touch zero blocks regardless of
/// the offset.
pub fn block_length(blksize: usize, offset: usize, length: u64) -> u64 {
    if length == 0 {
        return 0;
    }
    let span = offset as u64 + length;
    (span + blksize as u64 - 1) / blksize as u64
}

/// Last touched index for a run of `length` blocks starting at `start`.
/// `length` is at least one.
pub fn block_index_end(start: u64, length: u64) -> u64 {
    start + length - 1
}

/// First byte position of block `index`.
pub fn block_position_start(blksize: usize, index: u64) -> u64 {
    index * blksize as u64
}

/// Lazy segmentation of `buf` into `blksize` slices, the last possibly
/// shorter. An empty buffer yields nothing.
pub fn segment_buffer(blksize: usize, buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.chunks(blksize)
}
