//! File block records.
//!
//! A file's content lives under `data.<ino>` as one sealed record per
//! block, keyed by the order-preserving packed block index, so a range
//! scan walks the file front to back. A block that was never written —
//! a hole left by a sparse write or an upward truncate — simply has no
//! record; readers see zeros for it.
//!
//! Writes are read-modify-write per block: the existing record (or an
//! empty buffer for a hole) is merged with the incoming bytes at the
//! block-local offset, zero-extended where the offset lies past the end,
//! then sealed and rewritten. Whole-block writes skip the read. All of it
//! happens through the caller's transaction, so a multi-block update
//! commits as one batch.
//!
//! Scans (`file_get_blocks`, `file_get_last_block`) read the committed
//! store directly and are not transactional; callers needing stability
//! hold the inode lock across the scan.

use super::InodeManager;
use crate::blocks::segment_buffer;
use crate::error::{Error, Result};
use crate::store::{pack_index, unpack_index, Domain, Transaction};

impl InodeManager {
    /// Delete every block record. Used by destruction and truncate-to-zero.
    pub fn file_clear_data(&self, tran: &mut Transaction<'_>, ino: u64) -> Result<()> {
        let data = self.domains.data.sub_index(ino);
        let (start, end) = data.range();
        for key in tran.scan_keys(&start, &end)? {
            tran.del(key);
        }
        Ok(())
    }

    /// Stream block plaintexts for indices `[start_idx, end_idx)`, or to
    /// the last stored block when `end_idx` is absent. Missing indices
    /// yield a `blksize` zero buffer each, so positions stay correct.
    pub fn file_get_blocks(
        &self,
        ino: u64,
        blksize: usize,
        start_idx: u64,
        end_idx: Option<u64>,
    ) -> Result<FileBlocks<'_>> {
        self.check_running()?;
        let data = self.domains.data.sub_index(ino);
        let start_key = data.key(&pack_index(start_idx));
        let end_key = match end_idx {
            Some(end) => data.key(&pack_index(end)),
            None => data.range().1,
        };
        let stored = self
            .store
            .scan_committed(&start_key, &end_key, false, None)?;
        Ok(FileBlocks {
            mgr: self,
            domain: data,
            stored: stored.into_iter(),
            pending: None,
            next_idx: start_idx,
            end_idx,
            blksize,
        })
    }

    /// Index and plaintext of the last stored block; `(0, empty)` when the
    /// file has no blocks at all.
    pub fn file_get_last_block(&self, ino: u64) -> Result<(u64, Vec<u8>)> {
        self.check_running()?;
        let data = self.domains.data.sub_index(ino);
        let (start, end) = data.range();
        let mut last = self.store.scan_committed(&start, &end, true, Some(1))?;
        match last.pop() {
            None => Ok((0, Vec::new())),
            Some((key, sealed)) => {
                let idx = data
                    .strip(&key)
                    .and_then(unpack_index)
                    .ok_or_else(|| Error::Transport("malformed block key".into()))?;
                Ok((idx, self.store.unseal_value(sealed)?))
            }
        }
    }

    /// Merge `data` into the block at `idx`, starting `offset` bytes in.
    /// A missing block behaves as an empty buffer: the merge zero-extends
    /// up to `offset` and the common `offset == 0` case writes `data`
    /// verbatim. Returns the number of bytes consumed from `data`.
    pub fn file_write_block(
        &self,
        tran: &mut Transaction<'_>,
        ino: u64,
        data: &[u8],
        idx: u64,
        offset: usize,
    ) -> Result<usize> {
        let key = self.domains.data.sub_index(ino).key(&pack_index(idx));
        let block = match tran.get_raw(&key)? {
            None if offset == 0 => data.to_vec(),
            None => {
                let mut block = vec![0u8; offset];
                block.extend_from_slice(data);
                block
            }
            Some(mut block) => {
                if offset >= block.len() {
                    block.resize(offset, 0);
                    block.extend_from_slice(data);
                } else {
                    let end = offset + data.len();
                    if end > block.len() {
                        block.resize(end, 0);
                    }
                    block[offset..end].copy_from_slice(data);
                }
                block
            }
        };
        tran.put_raw(key, block);
        Ok(data.len())
    }

    /// Segment `data` into `blksize` chunks and write them as consecutive
    /// whole blocks from `start_idx`. Used on initial population and on
    /// append spill.
    pub fn file_set_blocks(
        &self,
        tran: &mut Transaction<'_>,
        ino: u64,
        data: &[u8],
        blksize: usize,
        start_idx: u64,
    ) -> Result<()> {
        for (i, segment) in segment_buffer(blksize, data).enumerate() {
            let _ = self.file_write_block(tran, ino, segment, start_idx + i as u64, 0)?;
        }
        Ok(())
    }

    /// Cut a file to `size` bytes: drop every block past the new end, trim
    /// the tail block in place, and refresh size/blocks/mtime/ctime.
    /// Growing `size` past the end leaves a hole, no blocks are written.
    pub fn file_truncate(&self, tran: &mut Transaction<'_>, ino: u64, size: u64) -> Result<()> {
        use crate::blocks::{block_length, block_position_start};
        use crate::stat::StatProp;

        self.require_type(tran, ino, super::InodeType::File, "file")?;
        let blksize = self.stat_get_prop(tran, ino, StatProp::Blksize)? as usize;
        if size == 0 {
            self.file_clear_data(tran, ino)?;
        } else {
            let keep = block_length(blksize, 0, size);
            let data = self.domains.data.sub_index(ino);
            let (start, end) = data.range();
            for key in tran.scan_keys(&start, &end)? {
                let idx = data
                    .strip(&key)
                    .and_then(unpack_index)
                    .ok_or_else(|| Error::Transport("malformed block key".into()))?;
                if idx >= keep {
                    tran.del(key);
                }
            }
            let tail_idx = keep - 1;
            let tail_key = data.key(&pack_index(tail_idx));
            let tail_len = (size - block_position_start(blksize, tail_idx)) as usize;
            if let Some(mut tail) = tran.get_raw(&tail_key)? {
                if tail.len() > tail_len {
                    tail.truncate(tail_len);
                    tran.put_raw(tail_key, tail);
                }
            }
        }
        let now = super::now_ms();
        let blksize = blksize as u64;
        self.stat_set_prop(tran, ino, StatProp::Size, size)?;
        self.stat_set_prop(tran, ino, StatProp::Blocks, (size + blksize - 1) / blksize)?;
        self.stat_set_prop(tran, ino, StatProp::Mtime, now)?;
        self.stat_set_prop(tran, ino, StatProp::Ctime, now)
    }
}

/// Lazy block stream over the committed store. Decryption happens per
/// item; holes materialize as zero buffers without touching the engine.
pub struct FileBlocks<'m> {
    mgr: &'m InodeManager,
    domain: Domain,
    stored: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    pending: Option<(u64, Vec<u8>)>,
    next_idx: u64,
    end_idx: Option<u64>,
    blksize: usize,
}

impl Iterator for FileBlocks<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(end) = self.end_idx {
            if self.next_idx >= end {
                return None;
            }
        }
        if self.pending.is_none() {
            if let Some((key, sealed)) = self.stored.next() {
                let idx = match self.domain.strip(&key).and_then(unpack_index) {
                    Some(idx) => idx,
                    None => return Some(Err(Error::Transport("malformed block key".into()))),
                };
                self.pending = Some((idx, sealed));
            }
        }
        match self.pending.take() {
            Some((idx, sealed)) => {
                if self.next_idx < idx {
                    // Hole before the next stored block.
                    self.pending = Some((idx, sealed));
                    self.next_idx += 1;
                    Some(Ok(vec![0u8; self.blksize]))
                } else {
                    self.next_idx = idx + 1;
                    Some(self.mgr.store.unseal_value(sealed))
                }
            }
            // Past the last stored block: zeros up to the explicit bound.
            None => match self.end_idx {
                Some(_) => {
                    self.next_idx += 1;
                    Some(Ok(vec![0u8; self.blksize]))
                }
                None => None,
            },
        }
    }
}
