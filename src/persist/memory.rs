//! Shareable in-memory journal.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{engine::replay::Snapshot, op::Operation, types::OpIndex};

use super::{OpJournal, PersistError, PersistResult};

#[derive(Debug)]
struct Inner<S> {
    ops: BTreeMap<OpIndex, Operation>,
    snapshots: Vec<Snapshot<S>>,
    flushes: usize,
}

/// Journal kept in process memory.
///
/// Clones share storage, so a test can hand one clone to a manager, tear the
/// manager down, and start a new one from the same contents.
#[derive(Debug)]
pub struct MemoryJournal<S> {
    inner: Arc<Mutex<Inner<S>>>,
}

impl<S> Clone for MemoryJournal<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Default for MemoryJournal<S> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ops: BTreeMap::new(),
                snapshots: Vec::new(),
                flushes: 0,
            })),
        }
    }
}

impl<S: Clone> MemoryJournal<S> {
    /// Empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every journaled op in index order.
    pub fn ops(&self) -> Vec<Operation> {
        self.lock()
            .map(|inner| inner.ops.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent snapshot written, if any.
    pub fn latest_snapshot(&self) -> Option<Snapshot<S>> {
        self.lock().ok().and_then(|inner| inner.snapshots.last().cloned())
    }

    /// Number of snapshots written.
    pub fn snapshot_count(&self) -> usize {
        self.lock().map(|inner| inner.snapshots.len()).unwrap_or(0)
    }

    /// How many times `flush` was called.
    pub fn flush_count(&self) -> usize {
        self.lock().map(|inner| inner.flushes).unwrap_or(0)
    }

    fn lock(&self) -> PersistResult<MutexGuard<'_, Inner<S>>> {
        self.inner
            .lock()
            .map_err(|_| PersistError::Message("memory journal poisoned".to_string()))
    }
}

impl<S: Clone + Send> OpJournal<S> for MemoryJournal<S> {
    fn append_ops(&mut self, ops: &[Operation]) -> PersistResult<Option<OpIndex>> {
        let mut inner = self.lock()?;
        for op in ops {
            let index = op
                .op_index
                .ok_or_else(|| PersistError::Message(format!("operation {} has no op index", op.id)))?;
            inner.ops.entry(index).or_insert_with(|| op.clone());
        }
        Ok(inner.ops.keys().next_back().copied())
    }

    fn load_snapshot(&mut self) -> PersistResult<Option<Snapshot<S>>> {
        Ok(self.lock()?.snapshots.last().cloned())
    }

    fn load_ops_after(&mut self, watermark: Option<OpIndex>) -> PersistResult<Vec<Operation>> {
        let inner = self.lock()?;
        let ops = match watermark {
            Some(w) => inner
                .ops
                .range(w.saturating_add(1)..)
                .filter(|(i, _)| **i > w)
                .map(|(_, op)| op.clone())
                .collect(),
            None => inner.ops.values().cloned().collect(),
        };
        Ok(ops)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.lock()?.flushes += 1;
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &Snapshot<S>) -> PersistResult<()> {
        self.lock()?.snapshots.push(snapshot.clone());
        Ok(())
    }
}
