//! Inodes.
//!
//! An inode is a typed record in the store: its tag in the `inodes` domain
//! is the authoritative existence flag, its stat lives as one record per
//! field, and its type-specific payload (blocks, entries, target, device
//! numbers) hangs off per-inode sub-domains.
//!
//! An inode goes through a fixed sequence of states:
//!
//! * Creation: the caller allocates an index, then one typed `*_create`
//!   writes the tag, the stat bootstrap, and the payload atomically inside
//!   the caller's transaction.
//! * Liveness: `nlink` counts directory edges — every entry naming the
//!   inode, plus one for a directory's own ".", plus one on the parent for
//!   each child's "..". The root starts at 2 and is its own parent.
//!   Separately, `refs` counts live file descriptors; it is in-memory only.
//! * Destruction: a file dies when `nlink` reaches 0, a directory when it
//!   reaches 1 (only its "." remains) — but only once `refs` is 0 as well.
//!   While descriptors are open the index is parked in the persistent `gc`
//!   set instead, the records stay readable, and the next manager start
//!   (or the last descriptor closing) finishes the destruction. Startup
//!   destruction is idempotent because the type tag doubles as the
//!   presence flag.
//!
//! Every mutation takes the enclosing [`Transaction`] explicitly; nothing
//! here touches the store outside one. Destruction queues its irreversible
//! side effects (freeing the index, dropping the lock and ref entries) on
//! the success queue, so a rollback leaves the counter untouched.

use log::debug;
use serde::{Deserialize, Serialize};

use super::{now_ms, ms_to_time, InodeManager};
use crate::error::{Error, Result};
use crate::stat::{
    mkdev, Stat, StatProp, DEFAULT_CHARDEV_PERM, DEFAULT_DIR_PERM, DEFAULT_FILE_PERM,
    DEFAULT_SYMLINK_PERM, S_IFCHR, S_IFDIR, S_IFLNK, S_IFREG,
};
use crate::store::tx::lock;
use crate::store::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeType {
    File,
    Directory,
    Symlink,
    CharacterDev,
}

/// Existence record returned by [`InodeManager::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    pub ino: u64,
    pub typ: InodeType,
    /// Whether destruction has been deferred to the gc set.
    pub gc: bool,
}

/// Caller-supplied creation attributes. `mode` carries permission bits
/// only; the type bits and the umask are applied by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeParams {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl InodeParams {
    pub fn new(mode: u32) -> Self {
        Self {
            mode,
            uid: 0,
            gid: 0,
        }
    }

    pub fn file() -> Self {
        Self::new(DEFAULT_FILE_PERM)
    }

    pub fn dir() -> Self {
        Self::new(DEFAULT_DIR_PERM)
    }

    pub fn symlink() -> Self {
        Self::new(DEFAULT_SYMLINK_PERM)
    }

    pub fn chardev() -> Self {
        Self::new(DEFAULT_CHARDEV_PERM)
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(&b'/') {
        return Err(Error::InvalidName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    if name == b"." || name == b".." {
        return Err(Error::InvalidArgument("reserved directory name"));
    }
    Ok(())
}

impl InodeManager {
    /// Authoritative existence check.
    pub fn get(&self, tran: &Transaction<'_>, ino: u64) -> Result<Option<InodeInfo>> {
        match tran.get::<InodeType>(&self.type_key(ino))? {
            None => Ok(None),
            Some(typ) => {
                let gc = tran.get_raw(&self.gc_key(ino))?.is_some();
                Ok(Some(InodeInfo { ino, typ, gc }))
            }
        }
    }

    pub(crate) fn require(&self, tran: &Transaction<'_>, ino: u64) -> Result<InodeInfo> {
        self.get(tran, ino)?.ok_or(Error::IndexMissing(ino))
    }

    pub(crate) fn require_type(
        &self,
        tran: &Transaction<'_>,
        ino: u64,
        typ: InodeType,
        expected: &'static str,
    ) -> Result<InodeInfo> {
        let info = self.require(tran, ino)?;
        if info.typ != typ {
            return Err(Error::TypeMismatch { ino, expected });
        }
        Ok(info)
    }

    /// Write the full stat fan-out for a fresh inode.
    fn stat_bootstrap(
        &self,
        tran: &mut Transaction<'_>,
        ino: u64,
        mode: u32,
        nlink: u32,
        params: InodeParams,
        rdev: u64,
        size: u64,
    ) -> Result<()> {
        let now = now_ms();
        let blksize = self.blksize() as u64;
        let blocks = (size + blksize - 1) / blksize;
        self.stat_set_prop(tran, ino, StatProp::Dev, 0)?;
        self.stat_set_prop(tran, ino, StatProp::Ino, ino)?;
        self.stat_set_prop(tran, ino, StatProp::Mode, mode as u64)?;
        self.stat_set_prop(tran, ino, StatProp::Nlink, nlink as u64)?;
        self.stat_set_prop(tran, ino, StatProp::Uid, params.uid as u64)?;
        self.stat_set_prop(tran, ino, StatProp::Gid, params.gid as u64)?;
        self.stat_set_prop(tran, ino, StatProp::Rdev, rdev)?;
        self.stat_set_prop(tran, ino, StatProp::Size, size)?;
        self.stat_set_prop(tran, ino, StatProp::Blksize, blksize)?;
        self.stat_set_prop(tran, ino, StatProp::Blocks, blocks)?;
        self.stat_set_prop(tran, ino, StatProp::Atime, now)?;
        self.stat_set_prop(tran, ino, StatProp::Mtime, now)?;
        self.stat_set_prop(tran, ino, StatProp::Ctime, now)?;
        self.stat_set_prop(tran, ino, StatProp::Birthtime, now)?;
        Ok(())
    }

    fn creation_mode(&self, typ_bits: u32, params: InodeParams) -> u32 {
        typ_bits | (params.mode & !self.umask() & 0o7777)
    }

    /// Create a regular file, optionally populated with `data`.
    pub fn file_create(
        &self,
        tran: &mut Transaction<'_>,
        ino: u64,
        params: InodeParams,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let size = data.map_or(0, |d| d.len() as u64);
        tran.put(self.type_key(ino), &InodeType::File)?;
        let mode = self.creation_mode(S_IFREG, params);
        self.stat_bootstrap(tran, ino, mode, 0, params, 0, size)?;
        if let Some(data) = data {
            if !data.is_empty() {
                self.file_set_blocks(tran, ino, data, self.blksize(), 0)?;
            }
        }
        Ok(())
    }

    /// Create a directory. With no parent this establishes the filesystem
    /// root (its ".." is itself and its nlink starts at 2); with a parent
    /// it wires ".." and bumps the parent's nlink for the back-edge. The
    /// caller still names the new directory in the parent via
    /// [`dir_set_entry`](Self::dir_set_entry).
    pub fn dir_create<'s>(
        &'s self,
        tran: &mut Transaction<'s>,
        ino: u64,
        params: InodeParams,
        parent: Option<u64>,
    ) -> Result<()> {
        let (parent_ino, nlink) = match parent {
            None => {
                if self.root(tran)?.is_some() {
                    return Err(Error::DuplicateRoot);
                }
                tran.put(self.root_key(), &ino)?;
                (ino, 2)
            }
            Some(parent_ino) => {
                let info = self
                    .get(tran, parent_ino)?
                    .ok_or(Error::ParentMissing(parent_ino))?;
                if info.typ != InodeType::Directory {
                    return Err(Error::TypeMismatch {
                        ino: parent_ino,
                        expected: "directory",
                    });
                }
                (parent_ino, 1)
            }
        };
        tran.put(self.type_key(ino), &InodeType::Directory)?;
        let mode = self.creation_mode(S_IFDIR, params);
        self.stat_bootstrap(tran, ino, mode, nlink, params, 0, 0)?;
        let dir = self.domains.dir.sub_index(ino);
        tran.put(dir.key(b"."), &ino)?;
        tran.put(dir.key(b".."), &parent_ino)?;
        if parent_ino != ino {
            self.link(tran, parent_ino)?;
        }
        Ok(())
    }

    /// Create a symbolic link holding `target` verbatim.
    pub fn symlink_create(
        &self,
        tran: &mut Transaction<'_>,
        ino: u64,
        params: InodeParams,
        target: &str,
    ) -> Result<()> {
        tran.put(self.type_key(ino), &InodeType::Symlink)?;
        let mode = self.creation_mode(S_IFLNK, params);
        self.stat_bootstrap(tran, ino, mode, 0, params, 0, target.len() as u64)?;
        tran.put(self.link_key(ino), &target)?;
        Ok(())
    }

    /// Create a character device addressed by `(major, minor)`.
    pub fn chardev_create(
        &self,
        tran: &mut Transaction<'_>,
        ino: u64,
        params: InodeParams,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        tran.put(self.type_key(ino), &InodeType::CharacterDev)?;
        let mode = self.creation_mode(S_IFCHR, params);
        self.stat_bootstrap(tran, ino, mode, 0, params, mkdev(major, minor), 0)?;
        Ok(())
    }

    /// Tear an inode down completely. Directory destruction refuses while
    /// entries besides "." and ".." remain, releases the parent back-edge,
    /// and clears the root pointer when the root itself dies. The index
    /// returns to the counter only after commit.
    pub fn destroy<'s>(&'s self, tran: &mut Transaction<'s>, ino: u64) -> Result<()> {
        let info = self.require(tran, ino)?;
        match info.typ {
            InodeType::File => {
                self.file_clear_data(tran, ino)?;
            }
            InodeType::Directory => {
                let dir = self.domains.dir.sub_index(ino);
                let (start, end) = dir.range();
                for key in tran.scan_keys(&start, &end)? {
                    let name = dir.strip(&key);
                    if name != Some(b"." as &[u8]) && name != Some(b".." as &[u8]) {
                        return Err(Error::NotEmpty(ino));
                    }
                }
                let parent: u64 = tran
                    .get(&dir.key(b".."))?
                    .ok_or(Error::ParentMissing(ino))?;
                if parent == ino {
                    // The root holds its own back-edge.
                    tran.del(self.root_key());
                } else {
                    self.unlink(tran, parent)?;
                }
                tran.del(dir.key(b"."));
                tran.del(dir.key(b".."));
            }
            InodeType::Symlink => {
                tran.del(self.link_key(ino));
            }
            InodeType::CharacterDev => {}
        }
        for prop in StatProp::ALL {
            tran.del(self.stat_key(ino, prop));
        }
        tran.del(self.type_key(ino));
        tran.del(self.gc_key(ino));
        debug!("destroying inode {ino} ({:?})", info.typ);
        tran.queue_success(move || {
            self.ino_deallocate(ino);
            self.store.release_lock(ino);
            let _ = lock(&self.refs).remove(&ino);
        });
        Ok(())
    }

    /// Add one directory edge: nlink + 1, ctime refreshed.
    pub fn link(&self, tran: &mut Transaction<'_>, ino: u64) -> Result<()> {
        let nlink = self.stat_get_prop(tran, ino, StatProp::Nlink)?;
        self.stat_set_prop(tran, ino, StatProp::Nlink, nlink + 1)?;
        self.stat_set_prop(tran, ino, StatProp::Ctime, now_ms())
    }

    /// Remove one directory edge, then consult the collector.
    pub fn unlink<'s>(&'s self, tran: &mut Transaction<'s>, ino: u64) -> Result<()> {
        let nlink = self.stat_get_prop(tran, ino, StatProp::Nlink)?;
        self.stat_set_prop(tran, ino, StatProp::Nlink, nlink.saturating_sub(1))?;
        self.stat_set_prop(tran, ino, StatProp::Ctime, now_ms())?;
        self.gc_check(tran, ino)
    }

    /// Register a live file descriptor.
    pub fn ref_inc(&self, ino: u64) {
        *lock(&self.refs).entry(ino).or_insert(0) += 1;
    }

    /// Drop a descriptor reference, then consult the collector: this is
    /// where a gc-parked inode finally dies.
    pub fn ref_dec<'s>(&'s self, tran: &mut Transaction<'s>, ino: u64) -> Result<()> {
        {
            let mut refs = lock(&self.refs);
            if let Some(count) = refs.get_mut(&ino) {
                *count = count.saturating_sub(1);
            }
        }
        self.gc_check(tran, ino)
    }

    /// Live descriptor count.
    pub fn refs(&self, ino: u64) -> usize {
        lock(&self.refs).get(&ino).copied().unwrap_or(0)
    }

    /// Destroy `ino` if nothing keeps it alive; otherwise park it in the
    /// gc set for the last descriptor close (or the next start) to finish.
    pub fn gc_check<'s>(&'s self, tran: &mut Transaction<'s>, ino: u64) -> Result<()> {
        let info = self.require(tran, ino)?;
        let nlink = self.stat_get_prop(tran, ino, StatProp::Nlink)?;
        let floor = match info.typ {
            // A directory's own "." never goes away before destruction.
            InodeType::Directory => 1,
            _ => 0,
        };
        if nlink > floor {
            return Ok(());
        }
        if self.refs(ino) == 0 {
            self.destroy(tran, ino)
        } else {
            debug!(
                "deferring inode {ino} to gc ({} live descriptors)",
                self.refs(ino)
            );
            tran.put(self.gc_key(ino), &())
        }
    }

    /// Assemble the full stat record.
    pub fn stat_get(&self, tran: &Transaction<'_>, ino: u64) -> Result<Stat> {
        self.require(tran, ino)?;
        let prop = |p: StatProp| self.stat_get_prop(tran, ino, p);
        Ok(Stat {
            dev: prop(StatProp::Dev)?,
            ino: prop(StatProp::Ino)?,
            mode: prop(StatProp::Mode)? as u32,
            nlink: prop(StatProp::Nlink)? as u32,
            uid: prop(StatProp::Uid)? as u32,
            gid: prop(StatProp::Gid)? as u32,
            rdev: prop(StatProp::Rdev)?,
            size: prop(StatProp::Size)?,
            blksize: prop(StatProp::Blksize)?,
            blocks: prop(StatProp::Blocks)?,
            atime: ms_to_time(prop(StatProp::Atime)?),
            mtime: ms_to_time(prop(StatProp::Mtime)?),
            ctime: ms_to_time(prop(StatProp::Ctime)?),
            birthtime: ms_to_time(prop(StatProp::Birthtime)?),
        })
    }

    pub fn stat_get_prop(&self, tran: &Transaction<'_>, ino: u64, prop: StatProp) -> Result<u64> {
        tran.get(&self.stat_key(ino, prop))?.ok_or(Error::NotFound)
    }

    pub fn stat_set_prop(
        &self,
        tran: &mut Transaction<'_>,
        ino: u64,
        prop: StatProp,
        value: u64,
    ) -> Result<()> {
        tran.put(self.stat_key(ino, prop), &value)
    }

    pub fn stat_unset_prop(&self, tran: &mut Transaction<'_>, ino: u64, prop: StatProp) {
        tran.del(self.stat_key(ino, prop));
    }

    /// Look a name up in a directory. "." and ".." resolve like any entry.
    pub fn dir_get_entry(
        &self,
        tran: &Transaction<'_>,
        ino: u64,
        name: &[u8],
    ) -> Result<Option<u64>> {
        self.require_type(tran, ino, InodeType::Directory, "directory")?;
        tran.get(&self.domains.dir.sub_index(ino).key(name))
    }

    /// Bind `name` to `child`, atomically keeping the reference graph
    /// consistent: the child gains an edge, a displaced previous occupant
    /// loses one (which may destroy or park it), and the directory's
    /// mtime/ctime advance. Binding a slot to the child it already holds
    /// short-circuits to success.
    pub fn dir_set_entry<'s>(
        &'s self,
        tran: &mut Transaction<'s>,
        ino: u64,
        name: &[u8],
        child: u64,
    ) -> Result<()> {
        self.require_type(tran, ino, InodeType::Directory, "directory")?;
        validate_name(name)?;
        self.require(tran, child)?;
        let key = self.domains.dir.sub_index(ino).key(name);
        let previous: Option<u64> = tran.get(&key)?;
        if previous == Some(child) {
            return Ok(());
        }
        tran.put(key, &child)?;
        let now = now_ms();
        self.stat_set_prop(tran, ino, StatProp::Mtime, now)?;
        self.stat_set_prop(tran, ino, StatProp::Ctime, now)?;
        self.link(tran, child)?;
        if let Some(previous) = previous {
            self.unlink(tran, previous)?;
        }
        Ok(())
    }

    /// Remove `name`, dropping the child's edge (which may destroy or park
    /// it). The reserved names cannot be unset.
    pub fn dir_unset_entry<'s>(
        &'s self,
        tran: &mut Transaction<'s>,
        ino: u64,
        name: &[u8],
    ) -> Result<()> {
        self.require_type(tran, ino, InodeType::Directory, "directory")?;
        validate_name(name)?;
        let key = self.domains.dir.sub_index(ino).key(name);
        let child: u64 = tran.get(&key)?.ok_or(Error::NotFound)?;
        tran.del(key);
        let now = now_ms();
        self.stat_set_prop(tran, ino, StatProp::Mtime, now)?;
        self.stat_set_prop(tran, ino, StatProp::Ctime, now)?;
        self.unlink(tran, child)
    }

    /// Rename within one directory. The new name is bound before the old
    /// one is removed, so the child's nlink never touches zero mid-rename.
    pub fn dir_reset_entry<'s>(
        &'s self,
        tran: &mut Transaction<'s>,
        ino: u64,
        old_name: &[u8],
        new_name: &[u8],
    ) -> Result<()> {
        self.require_type(tran, ino, InodeType::Directory, "directory")?;
        validate_name(old_name)?;
        validate_name(new_name)?;
        let child = self
            .dir_get_entry(tran, ino, old_name)?
            .ok_or(Error::NotFound)?;
        if old_name == new_name {
            return Ok(());
        }
        self.dir_set_entry(tran, ino, new_name, child)?;
        self.dir_unset_entry(tran, ino, old_name)
    }

    /// Every entry of a directory, "." and ".." included, in name order.
    pub fn dir_entries(&self, tran: &Transaction<'_>, ino: u64) -> Result<Vec<(Vec<u8>, u64)>> {
        self.require_type(tran, ino, InodeType::Directory, "directory")?;
        let dir = self.domains.dir.sub_index(ino);
        let (start, end) = dir.range();
        let mut entries = Vec::new();
        for (key, value) in tran.scan(&start, &end)? {
            let name = dir
                .strip(&key)
                .ok_or_else(|| Error::Transport("malformed dir key".into()))?;
            entries.push((name.to_vec(), serde_json::from_slice(&value)?));
        }
        Ok(entries)
    }

    /// A symlink's stored target.
    pub fn symlink_get_target(&self, tran: &Transaction<'_>, ino: u64) -> Result<String> {
        self.require_type(tran, ino, InodeType::Symlink, "symlink")?;
        tran.get(&self.link_key(ino))?.ok_or(Error::NotFound)
    }
}
