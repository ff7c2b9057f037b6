//! Reference in-memory engine.
//!
//! A `BTreeMap` behind one `RwLock`: batches apply under the write guard,
//! which makes them atomic against every reader, and range scans walk the
//! ordered map directly. The test suite runs on it; production deployments
//! plug a durable engine into [`KvEngine`](super::KvEngine) instead.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use super::{BatchOp, KvEngine};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemEngine {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records, for tests that assert on teardown.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        match self.map.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl KvEngine for MemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read().get(key).cloned())
    }

    fn write_batch(&self, batch: Vec<BatchOp>) -> Result<()> {
        let mut map = match self.map.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Del { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iter_range(
        &self,
        start: &[u8],
        end: &[u8],
        reverse: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if start > end {
            return Err(Error::Transport("inverted range bounds".into()));
        }
        let map = self.read();
        let range = map.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)));
        let limit = limit.unwrap_or(usize::MAX);
        let pairs = if reverse {
            range
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            range
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Ok(pairs)
    }
}
