//! Transactions over the sealed store.
//!
//! Every filesystem mutation happens inside a transaction: operations are
//! appended to an op log and mirrored in a write snapshot, the committed
//! store is untouched until `commit` writes the whole log as one atomic
//! engine batch. Reads consult the snapshot first, so a transaction sees
//! its own writes; otherwise they see the last committed state.
//!
//! Concurrency control is advisory and in-memory: `transact` acquires one
//! mutex per named inode, in the order supplied, and holds them until the
//! transaction resolves. Operations on disjoint inodes run fully in
//! parallel; the store-wide lock is held only for the short section that
//! hands the sealed batch to the engine. Readers of untouched inodes are
//! read-committed, nothing more.
//!
//! Side effects that must not happen on a rolled-back transaction (freeing
//! an inode index, dropping an advisory lock entry) go on the success
//! queue; compensation for in-memory state taken optimistically (returning
//! a freshly allocated index) goes on the failure queue. The queues fire
//! exactly once, after the batch is durable or after rollback.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use scopeguard::ScopeGuard;
use serde::{de::DeserializeOwned, Serialize};

use super::{BatchOp, KvEngine};
use crate::crypto::Envelope;
use crate::error::{Error, Result};

/// Lock a mutex, recovering the data from a poisoned lock: a panicked
/// holder has already rolled its transaction back via the unwind guard.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The sealed store: one engine handle, the crypto envelope, and the
/// in-memory advisory lock table keyed by inode index.
pub struct Store {
    engine: Arc<dyn KvEngine>,
    envelope: Envelope,
    commit_lock: Mutex<()>,
    locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl Store {
    pub fn new(engine: Arc<dyn KvEngine>, envelope: Envelope) -> Self {
        Self {
            engine,
            envelope,
            commit_lock: Mutex::new(()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` inside a transaction holding the advisory locks of `inos`
    /// in the supplied order. Commits when `f` returns `Ok`, rolls back on
    /// `Err` and on unwind. Callers touching several inodes supply them in
    /// a globally consistent order (lowest index first) to stay
    /// deadlock-free.
    pub fn transact<'s, T, F>(&'s self, inos: &[u64], f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'s>) -> Result<T>,
    {
        let mut order: Vec<u64> = Vec::with_capacity(inos.len());
        for &ino in inos {
            if !order.contains(&ino) {
                order.push(ino);
            }
        }
        let cells: Vec<Arc<Mutex<()>>> = order.iter().map(|&ino| self.lock_cell(ino)).collect();
        let _held: Vec<MutexGuard<'_, ()>> = cells.iter().map(|cell| lock(cell)).collect();

        let tran = Transaction::new(self);
        let mut tran = scopeguard::guard(tran, |mut tran| {
            // Error or unwind: discard the log, fire the failure queue.
            let _ = tran.rollback();
        });
        match f(&mut tran) {
            Ok(value) => {
                let mut tran = ScopeGuard::into_inner(tran);
                match tran.commit() {
                    Ok(()) => {
                        tran.finalize()?;
                        Ok(value)
                    }
                    Err(e) => {
                        let _ = tran.rollback();
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// The advisory lock cell for an inode, created on first use.
    fn lock_cell(&self, ino: u64) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.locks);
        Arc::clone(locks.entry(ino).or_default())
    }

    /// Drop an inode's lock entry. Called from destruction success queues;
    /// a handle still held by a running transaction keeps the cell alive.
    pub(crate) fn release_lock(&self, ino: u64) {
        let _ = lock(&self.locks).remove(&ino);
    }

    pub(crate) fn clear_locks(&self) {
        lock(&self.locks).clear();
    }

    /// Committed read through the envelope. A stored value that fails
    /// authentication is an error here, never a silent miss.
    pub(crate) fn get_committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.engine.get(key)? {
            None => Ok(None),
            Some(sealed) => self
                .envelope
                .unseal(sealed)?
                .ok_or(Error::AeadFailed)
                .map(Some),
        }
    }

    /// Committed-state range scan, values still sealed. Not transactional:
    /// callers needing a stable view hold the relevant inode lock.
    pub(crate) fn scan_committed(
        &self,
        start: &[u8],
        end: &[u8],
        reverse: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.engine.iter_range(start, end, reverse, limit)
    }

    pub(crate) fn unseal_value(&self, sealed: Vec<u8>) -> Result<Vec<u8>> {
        self.envelope.unseal(sealed)?.ok_or(Error::AeadFailed)
    }

    /// Write a pre-built batch outside any transaction. Values must already
    /// be sealed (or the batch must be deletes only).
    pub(crate) fn write_committed(&self, batch: Vec<BatchOp>) -> Result<()> {
        let _commit = lock(&self.commit_lock);
        self.engine.write_batch(batch)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TxState {
    Pending,
    Committed,
    RolledBack,
}

type Callback<'s> = Box<dyn FnOnce() + 's>;

/// One read-committed transaction. Obtained through [`Store::transact`];
/// every store operation of the filesystem layer takes one explicitly.
pub struct Transaction<'s> {
    store: &'s Store,
    ops: Vec<BatchOp>,
    snapshot: HashMap<Vec<u8>, Option<Vec<u8>>>,
    success: Vec<Callback<'s>>,
    failure: Vec<Callback<'s>>,
    state: TxState,
}

impl<'s> Transaction<'s> {
    fn new(store: &'s Store) -> Self {
        Self {
            store,
            ops: Vec::new(),
            snapshot: HashMap::new(),
            success: Vec::new(),
            failure: Vec::new(),
            state: TxState::Pending,
        }
    }

    /// Raw read: write snapshot first, then the committed store.
    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.snapshot.get(key) {
            Some(Some(value)) => Ok(Some(value.clone())),
            Some(None) => Ok(None),
            None => self.store.get_committed(key),
        }
    }

    /// Structured read: raw read plus strict JSON decoding.
    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    pub fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.snapshot.insert(key.clone(), Some(value.clone()));
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn put<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put_raw(key, bytes);
        Ok(())
    }

    pub fn del(&mut self, key: Vec<u8>) {
        self.snapshot.insert(key.clone(), None);
        self.ops.push(BatchOp::Del { key });
    }

    /// Range scan merging the committed store with this transaction's own
    /// writes, values unsealed. Concurrent committed transactions may still
    /// interleave; the per-inode lock is what keeps a scan stable.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, sealed) in self.store.scan_committed(start, end, false, None)? {
            if self.snapshot.contains_key(&key) {
                continue;
            }
            merged.insert(key, self.store.unseal_value(sealed)?);
        }
        for (key, entry) in &self.snapshot {
            if key.as_slice() < start || key.as_slice() >= end {
                continue;
            }
            match entry {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    let _ = merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Like [`scan`](Self::scan), but keys only; values stay sealed and
    /// undecrypted.
    pub fn scan_keys(&self, start: &[u8], end: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut merged: BTreeMap<Vec<u8>, ()> = BTreeMap::new();
        for (key, _) in self.store.scan_committed(start, end, false, None)? {
            merged.insert(key, ());
        }
        for (key, entry) in &self.snapshot {
            if key.as_slice() < start || key.as_slice() >= end {
                continue;
            }
            match entry {
                Some(_) => {
                    merged.insert(key.clone(), ());
                }
                None => {
                    let _ = merged.remove(key);
                }
            }
        }
        Ok(merged.into_keys().collect())
    }

    /// Queue a side effect to run once the batch is durable.
    pub fn queue_success(&mut self, f: impl FnOnce() + 's) {
        self.success.push(Box::new(f));
    }

    /// Queue a side effect to run if this transaction rolls back.
    pub fn queue_failure(&mut self, f: impl FnOnce() + 's) {
        self.failure.push(Box::new(f));
    }

    /// Seal the op log and write it as one atomic batch. The store-wide
    /// lock is held only here.
    fn commit(&mut self) -> Result<()> {
        match self.state {
            TxState::Pending => {}
            TxState::Committed => return Err(Error::TxCommitted),
            TxState::RolledBack => return Err(Error::TxRolledBack),
        }
        let mut batch = Vec::with_capacity(self.ops.len());
        for op in self.ops.drain(..) {
            batch.push(match op {
                BatchOp::Put { key, value } => BatchOp::Put {
                    key,
                    value: self.store.envelope.seal(value)?,
                },
                BatchOp::Del { key } => BatchOp::Del { key },
            });
        }
        trace!("committing transaction of {} ops", batch.len());
        {
            let _commit = lock(&self.store.commit_lock);
            self.store.engine.write_batch(batch)?;
        }
        self.state = TxState::Committed;
        Ok(())
    }

    /// Discard the log and fire the failure queue.
    fn rollback(&mut self) -> Result<()> {
        match self.state {
            TxState::Pending => {}
            TxState::Committed => return Err(Error::TxCommitted),
            TxState::RolledBack => return Err(Error::TxRolledBack),
        }
        self.state = TxState::RolledBack;
        self.ops.clear();
        self.snapshot.clear();
        debug!("transaction rolled back, {} failure callbacks", self.failure.len());
        self.success.clear();
        for f in self.failure.drain(..) {
            f();
        }
        Ok(())
    }

    /// Fire the success queue. Only legal once the batch is durable.
    fn finalize(&mut self) -> Result<()> {
        if self.state != TxState::Committed {
            return Err(Error::TxNotCommitted);
        }
        self.failure.clear();
        for f in self.success.drain(..) {
            f();
        }
        Ok(())
    }
}
