//! Inode store.
//!
//! One `InodeManager` owns the sealed store and every filesystem record in
//! it, sharded into prefix domains:
//!   + `inodes`: packed index → type tag. The tag is the authoritative
//!     existence flag; destruction deletes it last of all.
//!   + `stat.<ino>`: one record per stat field.
//!   + `data.<ino>`: packed block index → sealed block payload (files).
//!   + `dir.<ino>`: entry name → child index (directories).
//!   + `link`: packed index → symlink target.
//!   + `gc`: presence set of inodes whose destruction waits for the last
//!     descriptor to close.
//!   + `mgr`: the `root` pointer.
//!
//! The manager also owns the process-wide mutable state tied to those
//! records: the index counter, the descriptor reference counts, and (via
//! the store) the advisory lock table. `start` rebuilds all of it from the
//! `inodes` domain and destroys every member of the `gc` domain before any
//! traffic is served; `stop` tears it down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};

use crate::crypto::{DbKey, Envelope};
use crate::error::{Error, Result};
use crate::file::DeviceRegistry;
use crate::param::{BLKSIZE, ROOT_KEY, UMASK};
use crate::store::tx::lock;
use crate::store::{pack_index, unpack_index, BatchOp, Domain, KvEngine, Store, Transaction};
use crate::workers::WorkerPool;

mod alloc;
pub mod data;
pub mod inode;

pub use alloc::IndexAllocator;
pub use data::FileBlocks;
pub use inode::{InodeInfo, InodeParams, InodeType};

/// Current time as Unix milliseconds, the at-rest timestamp format.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn ms_to_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Manager configuration.
pub struct Options {
    /// 16/24/32-byte AES-GCM key used for every envelope operation.
    pub db_key: DbKey,
    /// Location handed to the embedded engine's factory. The manager only
    /// carries it; the bundled in-memory engine ignores it.
    pub db_path: Option<PathBuf>,
    /// Plaintext block size in bytes. Must be positive.
    pub blksize: usize,
    /// Default permission mask applied on inode creation.
    pub umask: u32,
    /// Size of the crypto worker pool; `None` keeps envelope work inline.
    pub workers: Option<usize>,
}

impl Options {
    pub fn new(db_key: DbKey) -> Self {
        Self {
            db_key,
            db_path: None,
            blksize: BLKSIZE,
            umask: UMASK,
            workers: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Stopped,
    Running,
    Destroyed,
}

/// The key spaces the manager writes into.
pub(crate) struct Domains {
    pub inodes: Domain,
    pub stat: Domain,
    pub data: Domain,
    pub dir: Domain,
    pub link: Domain,
    pub gc: Domain,
    pub mgr: Domain,
}

impl Domains {
    fn new() -> Self {
        let base = Domain::root("fs");
        Self {
            inodes: base.sub("inodes"),
            stat: base.sub("stat"),
            data: base.sub("data"),
            dir: base.sub("dir"),
            link: base.sub("link"),
            gc: base.sub("gc"),
            mgr: base.sub("mgr"),
        }
    }

    /// Bounds covering every record of every domain.
    fn range(&self) -> (Vec<u8>, Vec<u8>) {
        Domain::root("fs").range()
    }
}

pub struct InodeManager {
    pub(crate) store: Store,
    pub(crate) domains: Domains,
    blksize: usize,
    umask: u32,
    db_path: Option<PathBuf>,
    pub(crate) counter: Mutex<IndexAllocator>,
    pub(crate) refs: Mutex<HashMap<u64, usize>>,
    state: Mutex<ManagerState>,
    devices: DeviceRegistry,
}

impl InodeManager {
    /// Build a stopped manager over `engine`. Nothing is read until
    /// [`start`](Self::start).
    pub fn create(options: Options, engine: Arc<dyn KvEngine>) -> Result<Self> {
        if options.blksize == 0 {
            return Err(Error::InvalidArgument("blksize must be positive"));
        }
        let envelope = match options.workers {
            Some(count) => Envelope::with_workers(options.db_key, WorkerPool::new(count)),
            None => Envelope::new(options.db_key),
        };
        Ok(Self {
            store: Store::new(engine, envelope),
            domains: Domains::new(),
            blksize: options.blksize,
            umask: options.umask,
            db_path: options.db_path,
            counter: Mutex::new(IndexAllocator::new()),
            refs: Mutex::new(HashMap::new()),
            state: Mutex::new(ManagerState::Stopped),
            devices: DeviceRegistry::new(),
        })
    }

    /// Rebuild the in-memory state from the `inodes` domain, then destroy
    /// every inode the `gc` domain still names. Serving traffic before the
    /// sweep would let a descriptor reopen an inode that is already dead.
    pub fn start(&self) -> Result<()> {
        match *lock(&self.state) {
            ManagerState::Running => return Err(Error::Running),
            ManagerState::Destroyed => return Err(Error::Destroyed),
            ManagerState::Stopped => {}
        }

        let (start, end) = self.domains.inodes.range();
        let mut used = Vec::new();
        for (key, _) in self.store.scan_committed(&start, &end, false, None)? {
            let ino = self
                .domains
                .inodes
                .strip(&key)
                .and_then(unpack_index)
                .ok_or_else(|| Error::Transport("malformed inode key".into()))?;
            used.push(ino);
        }
        let live = used.len();
        *lock(&self.counter) = IndexAllocator::from_used(used);

        let (start, end) = self.domains.gc.range();
        let mut pending = Vec::new();
        for (key, _) in self.store.scan_committed(&start, &end, false, None)? {
            let ino = self
                .domains
                .gc
                .strip(&key)
                .and_then(unpack_index)
                .ok_or_else(|| Error::Transport("malformed gc key".into()))?;
            pending.push(ino);
        }
        for ino in pending {
            debug!("destroying gc-scheduled inode {ino}");
            self.store.transact(&[ino], |tran| self.destroy(tran, ino))?;
        }

        *lock(&self.state) = ManagerState::Running;
        info!("inode manager started, {live} live inodes");
        Ok(())
    }

    /// Tear down the in-memory state. Records stay in the store.
    pub fn stop(&self) -> Result<()> {
        match *lock(&self.state) {
            ManagerState::Stopped => return Err(Error::NotRunning),
            ManagerState::Destroyed => return Err(Error::Destroyed),
            ManagerState::Running => {}
        }
        *lock(&self.state) = ManagerState::Stopped;
        *lock(&self.counter) = IndexAllocator::new();
        lock(&self.refs).clear();
        self.store.clear_locks();
        info!("inode manager stopped");
        Ok(())
    }

    /// Wipe every record of every domain. Only legal while stopped; the
    /// manager cannot be started again afterwards.
    pub fn destroy_all(&self) -> Result<()> {
        match *lock(&self.state) {
            ManagerState::Running => return Err(Error::Running),
            ManagerState::Destroyed => return Err(Error::Destroyed),
            ManagerState::Stopped => {}
        }
        let (start, end) = self.domains.range();
        let batch = self
            .store
            .scan_committed(&start, &end, false, None)?
            .into_iter()
            .map(|(key, _)| BatchOp::Del { key })
            .collect();
        self.store.write_committed(batch)?;
        *lock(&self.state) = ManagerState::Destroyed;
        info!("inode manager destroyed");
        Ok(())
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        match *lock(&self.state) {
            ManagerState::Running => Ok(()),
            ManagerState::Stopped => Err(Error::NotRunning),
            ManagerState::Destroyed => Err(Error::Destroyed),
        }
    }

    /// Run `f` inside a transaction holding the advisory locks of `inos`.
    /// See [`Store::transact`] for ordering and rollback behaviour.
    pub fn transact<'s, T, F>(&'s self, inos: &[u64], f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'s>) -> Result<T>,
    {
        self.check_running()?;
        self.store.transact(inos, f)
    }

    pub fn blksize(&self) -> usize {
        self.blksize
    }

    pub fn umask(&self) -> u32 {
        self.umask
    }

    pub fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Allocate an inode index. The caller registers compensation on its
    /// transaction's failure queue so a rollback returns the index.
    pub fn ino_allocate(&self) -> u64 {
        lock(&self.counter).allocate()
    }

    pub fn ino_deallocate(&self, ino: u64) {
        lock(&self.counter).deallocate(ino)
    }

    /// The filesystem root, if one has been established.
    pub fn root(&self, tran: &Transaction<'_>) -> Result<Option<u64>> {
        tran.get(&self.domains.mgr.key(ROOT_KEY))
    }

    pub(crate) fn root_key(&self) -> Vec<u8> {
        self.domains.mgr.key(ROOT_KEY)
    }

    pub(crate) fn type_key(&self, ino: u64) -> Vec<u8> {
        self.domains.inodes.key(&pack_index(ino))
    }

    pub(crate) fn gc_key(&self, ino: u64) -> Vec<u8> {
        self.domains.gc.key(&pack_index(ino))
    }

    pub(crate) fn link_key(&self, ino: u64) -> Vec<u8> {
        self.domains.link.key(&pack_index(ino))
    }

    pub(crate) fn stat_key(&self, ino: u64, prop: crate::stat::StatProp) -> Vec<u8> {
        self.domains.stat.sub_index(ino).key(prop.key())
    }
}
