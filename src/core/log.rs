use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    op::{OpKind, Operation, now_ms},
    types::{OpId, OpIndex, RequestId},
};

/// Per-entry lifecycle: `Pending -> {Confirmed | Rejected}`, both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Applied optimistically, awaiting the authority.
    Pending,
    /// Accepted at a fixed `op_index`.
    Confirmed,
    /// Refused; its effect is rolled back by replay.
    Rejected,
}

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Appended by this session.
    Local,
    /// Pulled from the authority, authored elsewhere.
    Remote,
    /// Restored from the journal at startup.
    Journal,
}

/// Transitions the log refuses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    /// No entry carries this id.
    #[error("operation {0} is not in the log")]
    UnknownOp(OpId),
    /// The entry already left `Pending`.
    #[error("operation {id} is already {lifecycle:?}")]
    NotPending {
        /// The operation's id.
        id: OpId,
        /// Its current lifecycle state.
        lifecycle: Lifecycle,
    },
    /// Another entry already confirmed at this index.
    #[error("op index {index} already belongs to {holder}")]
    IndexTaken {
        /// The contested index.
        index: OpIndex,
        /// The operation already holding it.
        holder: OpId,
    },
    /// A confirmed insert arrived without an `op_index`.
    #[error("operation {0} has no op index")]
    MissingIndex(OpId),
}

/// One operation plus its lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// The operation as applied.
    pub op: Operation,
    /// Where the entry is in `Pending -> Confirmed | Rejected`.
    pub lifecycle: Lifecycle,
    /// Milliseconds since the epoch when the authority confirmed it.
    pub confirmed_at: Option<u64>,
    /// Authority's reason, set only when `Rejected`.
    pub rejection: Option<String>,
    /// Who produced the entry.
    pub source: Source,
    pub(crate) inverse: Option<OpKind>,
}

impl LogEntry {
    /// Id of the wrapped operation.
    pub fn id(&self) -> OpId {
        self.op.id
    }

    /// True while the authority has not decided.
    pub fn is_pending(&self) -> bool {
        self.lifecycle == Lifecycle::Pending
    }
}

/// Append-only operation log.
///
/// Payloads never change once appended; only `lifecycle`, `op_index`,
/// `confirmed_at`, and the cached inverse are updated in place.
#[derive(Debug, Default)]
pub struct OperationLog {
    entries: Vec<LogEntry>,
    pos: HashMap<OpId, usize>,
    by_request: HashMap<RequestId, usize>,
    by_index: BTreeMap<OpIndex, OpId>,
}

impl OperationLog {
    /// Empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `op` at the tail as `Pending`.
    pub fn append(&mut self, mut op: Operation, source: Source, inverse: Option<OpKind>) -> &LogEntry {
        op.op_index = None;
        self.push(LogEntry {
            op,
            lifecycle: Lifecycle::Pending,
            confirmed_at: None,
            rejection: None,
            source,
            inverse,
        })
    }

    /// Inserts an operation the authority already accepted.
    pub fn append_confirmed(&mut self, op: Operation, source: Source) -> Result<&LogEntry, LogError> {
        let index = op.op_index.ok_or(LogError::MissingIndex(op.id))?;
        if let Some(holder) = self.by_index.get(&index) {
            return Err(LogError::IndexTaken {
                index,
                holder: *holder,
            });
        }
        self.by_index.insert(index, op.id);
        Ok(self.push(LogEntry {
            op,
            lifecycle: Lifecycle::Confirmed,
            confirmed_at: Some(now_ms()),
            rejection: None,
            source,
            inverse: None,
        }))
    }

    /// `Pending -> Confirmed`, claiming `op_index`.
    pub fn confirm(&mut self, id: OpId, op_index: OpIndex) -> Result<&LogEntry, LogError> {
        let at = self.pending_position(id)?;
        if let Some(holder) = self.by_index.get(&op_index) {
            return Err(LogError::IndexTaken {
                index: op_index,
                holder: *holder,
            });
        }
        self.by_index.insert(op_index, id);

        let entry = &mut self.entries[at];
        entry.op.op_index = Some(op_index);
        entry.lifecycle = Lifecycle::Confirmed;
        entry.confirmed_at = Some(now_ms());
        Ok(entry)
    }

    /// `Pending -> Rejected`; the entry stays in the log.
    pub fn reject(&mut self, id: OpId, reason: impl Into<String>) -> Result<&LogEntry, LogError> {
        let at = self.pending_position(id)?;
        let entry = &mut self.entries[at];
        entry.lifecycle = Lifecycle::Rejected;
        entry.rejection = Some(reason.into());
        Ok(entry)
    }

    /// Entry by op id.
    pub fn get(&self, id: OpId) -> Option<&LogEntry> {
        self.pos.get(&id).map(|at| &self.entries[*at])
    }

    /// Entry that carried the effect for `request_id`.
    pub fn get_by_request(&self, request_id: &RequestId) -> Option<&LogEntry> {
        self.by_request.get(request_id).map(|at| &self.entries[*at])
    }

    /// Insertion position of `id`.
    pub fn position(&self, id: OpId) -> Option<usize> {
        self.pos.get(&id).copied()
    }

    /// Every entry in insertion order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending entries in insertion order.
    pub fn pending(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| e.is_pending())
    }

    /// Confirmed entries with `op_index >= from`, in index order.
    pub fn entries_from(&self, from: OpIndex) -> Vec<&LogEntry> {
        self.by_index
            .range(from..)
            .filter_map(|(_, id)| self.get(*id))
            .collect()
    }

    /// Operations to replay on top of a snapshot taken at `watermark`.
    ///
    /// Confirmed entries above the watermark come first in index order,
    /// followed by pending entries in insertion order. Rejected entries and
    /// everything in `skip_from..` (by insertion position) are left out.
    pub fn replay_plan(&self, watermark: Option<OpIndex>, skip_from: usize) -> Vec<Operation> {
        let lower = watermark.map_or(0, |w| w.saturating_add(1));
        let include_lower = watermark.is_none_or(|w| w < OpIndex::MAX);

        let mut plan: Vec<Operation> = Vec::new();
        if include_lower {
            for id in self.by_index.range(lower..).map(|(_, id)| *id) {
                let Some(at) = self.position(id) else {
                    continue;
                };
                if at < skip_from {
                    plan.push(self.entries[at].op.clone());
                }
            }
        }
        plan.extend(
            self.entries[..skip_from.min(self.entries.len())]
                .iter()
                .filter(|e| e.is_pending())
                .map(|e| e.op.clone()),
        );
        plan
    }

    /// Highest index `w` such that every index in `(from, w]` is confirmed locally.
    pub fn contiguous_watermark(&self, from: Option<OpIndex>) -> Option<OpIndex> {
        let mut mark = from;
        let start = from.map_or(0, |w| w.saturating_add(1));
        for index in self.by_index.range(start..).map(|(i, _)| *i) {
            let expected = mark.map_or(0, |m| m + 1);
            if index != expected {
                break;
            }
            mark = Some(index);
        }
        mark
    }

    /// Highest confirmed index in the log.
    pub fn max_index(&self) -> Option<OpIndex> {
        self.by_index.keys().next_back().copied()
    }

    pub(crate) fn set_inverse(&mut self, id: OpId, inverse: Option<OpKind>) {
        if let Some(at) = self.pos.get(&id) {
            self.entries[*at].inverse = inverse;
        }
    }

    fn push(&mut self, entry: LogEntry) -> &LogEntry {
        let at = self.entries.len();
        self.pos.insert(entry.op.id, at);
        self.by_request.entry(entry.op.request_id.clone()).or_insert(at);
        self.entries.push(entry);
        &self.entries[at]
    }

    fn pending_position(&self, id: OpId) -> Result<usize, LogError> {
        let at = *self.pos.get(&id).ok_or(LogError::UnknownOp(id))?;
        let lifecycle = self.entries[at].lifecycle;
        if lifecycle != Lifecycle::Pending {
            return Err(LogError::NotPending { id, lifecycle });
        }
        Ok(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        op::{OpKind, Origin},
        types::ActorId,
    };

    fn op(request: &str) -> Operation {
        Operation {
            id: OpId::new(),
            op_index: None,
            kind: OpKind::DeleteElement {
                id: format!("el-{request}"),
            },
            actor_id: ActorId::from("tester"),
            request_id: RequestId::from(request),
            client_ts: 1,
            origin: Origin::User,
        }
    }

    #[test]
    fn transitions_are_terminal() {
        let mut log = OperationLog::new();
        let id = log.append(op("r1"), Source::Local, None).id();

        log.confirm(id, 0).expect("confirm");
        assert_eq!(log.get(id).map(|e| e.op.op_index), Some(Some(0)));
        assert!(log.get(id).and_then(|e| e.confirmed_at).is_some());

        assert_eq!(
            log.reject(id, "late").unwrap_err(),
            LogError::NotPending {
                id,
                lifecycle: Lifecycle::Confirmed
            }
        );
        assert!(matches!(log.confirm(id, 1), Err(LogError::NotPending { .. })));
    }

    #[test]
    fn confirm_refuses_a_taken_index() {
        let mut log = OperationLog::new();
        let a = log.append(op("a"), Source::Local, None).id();
        let b = log.append(op("b"), Source::Local, None).id();
        log.confirm(a, 4).expect("confirm a");
        assert_eq!(
            log.confirm(b, 4).unwrap_err(),
            LogError::IndexTaken { index: 4, holder: a }
        );
        assert!(log.get(b).is_some_and(LogEntry::is_pending));
    }

    #[test]
    fn replay_plan_orders_confirmed_by_index_then_pending_by_insertion() {
        let mut log = OperationLog::new();
        let a = log.append(op("a"), Source::Local, None).id();
        let b = log.append(op("b"), Source::Local, None).id();
        let c = log.append(op("c"), Source::Local, None).id();
        let d = log.append(op("d"), Source::Local, None).id();

        log.confirm(c, 0).expect("c");
        log.confirm(a, 1).expect("a");
        log.reject(b, "conflict").expect("b");

        let plan: Vec<OpId> = log.replay_plan(None, log.len()).iter().map(|o| o.id).collect();
        assert_eq!(plan, vec![c, a, d]);

        let above: Vec<OpId> = log.replay_plan(Some(0), log.len()).iter().map(|o| o.id).collect();
        assert_eq!(above, vec![a, d]);

        let prefix: Vec<OpId> = log.replay_plan(None, 3).iter().map(|o| o.id).collect();
        assert_eq!(prefix, vec![c, a]);
    }

    #[test]
    fn contiguous_watermark_stops_at_gaps() {
        let mut log = OperationLog::new();
        for (request, index) in [("a", 0), ("b", 1), ("c", 3)] {
            let mut o = op(request);
            o.op_index = Some(index);
            log.append_confirmed(o, Source::Remote).expect("append");
        }
        assert_eq!(log.contiguous_watermark(None), Some(1));
        assert_eq!(log.contiguous_watermark(Some(1)), Some(1));
        assert_eq!(log.contiguous_watermark(Some(2)), Some(3));
        assert_eq!(log.max_index(), Some(3));
        assert_eq!(log.entries_from(1).len(), 2);
    }
}
