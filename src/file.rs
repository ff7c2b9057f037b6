//! File descriptors.
//!
//! A descriptor is an in-memory handle: the owning manager, an inode
//! index, an open-flag bitset, and a position. It is never persisted.
//! While a descriptor is open it holds one reference on its inode, which
//! keeps the inode's records alive even after the last directory entry
//! naming it is gone; the reference drops on close (or on drop), and that
//! is the moment a gc-parked inode finally dies.
//!
//! One `read` or `write` runs inside one transaction holding the inode's
//! advisory lock, so a multi-block update is atomic against every other
//! operation on that inode. Reads advance atime; writes advance
//! mtime/ctime and recompute size and block counts. With `O_APPEND` set
//! the supplied position is ignored outright and the write lands at the
//! end of the last stored block.
//!
//! Character-device inodes dispatch reads and writes to the hooks
//! registered for their `(major, minor)` pair instead of the block engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::blocks::{
    block_index_end, block_index_start, block_length, block_offset, block_position_start,
};
use crate::error::{Error, Result};
use crate::fcntl::{OpenFlags, Whence};
use crate::fs::{now_ms, InodeManager, InodeType};
use crate::stat::{mkdev, StatProp};
use crate::store::tx::lock;

/// Read/write hooks for one registered character device.
#[derive(Clone, Copy)]
pub struct DeviceOps {
    pub read: fn(rdev: u64, buf: &mut [u8], pos: u64) -> Result<usize>,
    pub write: fn(rdev: u64, buf: &[u8], pos: u64) -> Result<usize>,
}

/// Maps device numbers to their hooks.
pub struct DeviceRegistry {
    map: Mutex<HashMap<u64, DeviceOps>>,
}

impl DeviceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, major: u32, minor: u32, ops: DeviceOps) {
        let _ = lock(&self.map).insert(mkdev(major, minor), ops);
    }

    pub fn get(&self, rdev: u64) -> Option<DeviceOps> {
        lock(&self.map).get(&rdev).copied()
    }
}

pub struct FileDescriptor {
    mgr: Arc<InodeManager>,
    ino: u64,
    flags: OpenFlags,
    pos: u64,
    closed: bool,
}

impl FileDescriptor {
    /// Open a descriptor on an existing inode, taking one reference on it.
    /// `O_TRUNC` on a writable descriptor cuts a regular file to zero
    /// bytes, blocks included.
    pub fn open(mgr: Arc<InodeManager>, ino: u64, flags: OpenFlags) -> Result<Self> {
        let typ = mgr.transact(&[ino], |tran| Ok(mgr.require(tran, ino)?.typ))?;
        mgr.ref_inc(ino);
        let fd = Self {
            mgr,
            ino,
            flags,
            pos: 0,
            closed: false,
        };
        if flags.contains(OpenFlags::TRUNC) && flags.writable() && typ == InodeType::File {
            let mgr = Arc::clone(&fd.mgr);
            mgr.transact(&[ino], |tran| mgr.file_truncate(tran, ino, 0))?;
        }
        Ok(fd)
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: OpenFlags) {
        self.flags = flags;
    }

    /// Move the position. `Set`/`Cur`/`End` mirror lseek; a negative
    /// result is an error. Seeking past the end is allowed — files are
    /// sparse upward.
    pub fn set_pos(&mut self, delta: i64, whence: Whence) -> Result<u64> {
        self.check_open()?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.pos as i128,
            Whence::End => {
                let mgr = Arc::clone(&self.mgr);
                let ino = self.ino;
                mgr.transact(&[ino], |tran| mgr.stat_get_prop(tran, ino, StatProp::Size))?
                    as i128
            }
        };
        let target = base + delta as i128;
        if target < 0 {
            return Err(Error::InvalidArgument("negative file position"));
        }
        if target > u64::MAX as i128 {
            return Err(Error::InvalidArgument("file position overflow"));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    /// Read into `buf` from `position`, or from the descriptor position
    /// when absent (advancing it by the bytes copied). Returns the bytes
    /// copied; at end of file that is short, possibly zero.
    pub fn read(&mut self, buf: &mut [u8], position: Option<u64>) -> Result<usize> {
        self.check_open()?;
        if !self.flags.readable() {
            return Err(Error::InvalidArgument("descriptor not open for reading"));
        }
        let mgr = Arc::clone(&self.mgr);
        let ino = self.ino;
        let pos = self.pos;
        let (copied, advance) = mgr.transact(&[ino], |tran| {
            let info = mgr.require(tran, ino)?;
            match info.typ {
                InodeType::File => {}
                InodeType::CharacterDev => {
                    let rdev = mgr.stat_get_prop(tran, ino, StatProp::Rdev)?;
                    let ops = mgr.devices().get(rdev).ok_or(Error::TypeMismatch {
                        ino,
                        expected: "registered device",
                    })?;
                    let n = (ops.read)(rdev, buf, position.unwrap_or(pos))?;
                    mgr.stat_set_prop(tran, ino, StatProp::Atime, now_ms())?;
                    return Ok((n, None));
                }
                _ => {
                    return Err(Error::TypeMismatch {
                        ino,
                        expected: "file",
                    })
                }
            }

            let blksize = mgr.stat_get_prop(tran, ino, StatProp::Blksize)? as usize;
            let size = mgr.stat_get_prop(tran, ino, StatProp::Size)?;
            let p = position.unwrap_or(pos);
            let mut copied = 0usize;
            if !buf.is_empty() && p < size {
                let need = core::cmp::min(buf.len() as u64, size - p) as usize;
                let start = block_index_start(blksize, p);
                let cursor = block_offset(blksize, p);
                let length = block_length(blksize, cursor, need as u64);
                let end = block_index_end(start, length);
                let stream = mgr.file_get_blocks(ino, blksize, start, Some(end + 1))?;
                for (i, block) in stream.enumerate() {
                    let block = block?;
                    let within = if i == 0 { cursor } else { 0 };
                    let take = core::cmp::min(blksize - within, need - copied);
                    let dst = &mut buf[copied..copied + take];
                    // A stored block can run short of the cursor window
                    // when the size record outruns its bytes; the gap
                    // reads as zeros like any other hole.
                    let avail = block.len().saturating_sub(within);
                    let n = core::cmp::min(take, avail);
                    dst[..n].copy_from_slice(&block[within..within + n]);
                    for byte in &mut dst[n..] {
                        *byte = 0;
                    }
                    copied += take;
                    if copied == need {
                        break;
                    }
                }
            }
            mgr.stat_set_prop(tran, ino, StatProp::Atime, now_ms())?;
            Ok((copied, Some(p + copied as u64)))
        })?;
        if position.is_none() {
            if let Some(next) = advance {
                self.pos = next;
            }
        }
        Ok(copied)
    }

    /// Write `buf` at `position`, or at the descriptor position when
    /// absent (advancing it past the written bytes). With `O_APPEND` in
    /// the descriptor's flags or in `extra`, `position` is ignored
    /// entirely and the write starts at the end of the last stored block.
    pub fn write(&mut self, buf: &[u8], position: Option<u64>, extra: OpenFlags) -> Result<usize> {
        self.check_open()?;
        if !self.flags.writable() {
            return Err(Error::InvalidArgument("descriptor not open for writing"));
        }
        let flags = self.flags | extra;
        let mgr = Arc::clone(&self.mgr);
        let ino = self.ino;
        let pos = self.pos;
        let (written, advance) = mgr.transact(&[ino], |tran| {
            let info = mgr.require(tran, ino)?;
            match info.typ {
                InodeType::File => {}
                InodeType::CharacterDev => {
                    let rdev = mgr.stat_get_prop(tran, ino, StatProp::Rdev)?;
                    let ops = mgr.devices().get(rdev).ok_or(Error::TypeMismatch {
                        ino,
                        expected: "registered device",
                    })?;
                    let n = (ops.write)(rdev, buf, position.unwrap_or(pos))?;
                    return Ok((n, None));
                }
                _ => {
                    return Err(Error::TypeMismatch {
                        ino,
                        expected: "file",
                    })
                }
            }

            let blksize = mgr.stat_get_prop(tran, ino, StatProp::Blksize)? as usize;
            let old_size = mgr.stat_get_prop(tran, ino, StatProp::Size)?;
            if buf.is_empty() {
                return Ok((0, None));
            }

            let start_pos = if flags.contains(OpenFlags::APPEND) {
                let (last_idx, last) = mgr.file_get_last_block(ino)?;
                let start_pos = block_position_start(blksize, last_idx)
                    .checked_add(last.len() as u64)
                    .ok_or(Error::InvalidArgument("file position overflow"))?;
                if last.len() == blksize {
                    // Last block exactly full: never rewrite it, begin a
                    // fresh run.
                    mgr.file_set_blocks(tran, ino, buf, blksize, last_idx + 1)?;
                } else if last.len() + buf.len() > blksize {
                    let head = blksize - last.len();
                    let _ = mgr.file_write_block(tran, ino, &buf[..head], last_idx, last.len())?;
                    mgr.file_set_blocks(tran, ino, &buf[head..], blksize, last_idx + 1)?;
                } else {
                    let _ = mgr.file_write_block(tran, ino, buf, last_idx, last.len())?;
                }
                start_pos
            } else {
                let p = position.unwrap_or(pos);
                let _ = p
                    .checked_add(buf.len() as u64)
                    .ok_or(Error::InvalidArgument("file position overflow"))?;
                let start = block_index_start(blksize, p);
                let cursor = block_offset(blksize, p);
                let end = block_index_end(start, block_length(blksize, cursor, buf.len() as u64));
                let mut written = 0usize;
                for idx in start..=end {
                    let within = if idx == start { cursor } else { 0 };
                    let take = core::cmp::min(blksize - within, buf.len() - written);
                    let _ =
                        mgr.file_write_block(tran, ino, &buf[written..written + take], idx, within)?;
                    written += take;
                }
                p
            };

            let end_pos = start_pos
                .checked_add(buf.len() as u64)
                .ok_or(Error::InvalidArgument("file position overflow"))?;
            let size = core::cmp::max(old_size, end_pos);
            let now = now_ms();
            mgr.stat_set_prop(tran, ino, StatProp::Size, size)?;
            mgr.stat_set_prop(
                tran,
                ino,
                StatProp::Blocks,
                block_length(blksize, 0, size),
            )?;
            mgr.stat_set_prop(tran, ino, StatProp::Mtime, now)?;
            mgr.stat_set_prop(tran, ino, StatProp::Ctime, now)?;
            Ok((buf.len(), Some(end_pos)))
        })?;
        if position.is_none() {
            if let Some(next) = advance {
                self.pos = next;
            }
        }
        Ok(written)
    }

    /// Drop this descriptor's reference. Closing the last descriptor of a
    /// gc-parked inode destroys it. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mgr = Arc::clone(&self.mgr);
        let ino = self.ino;
        mgr.transact(&[ino], |tran| mgr.ref_dec(tran, ino))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidArgument("file descriptor is closed"));
        }
        Ok(())
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("descriptor on inode {} leaked its reference: {e}", self.ino);
            }
        }
    }
}
