use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    engine::{
        replay::{ReplayEngine, ReplayJob, ReplayOutcome, Snapshot},
        traits::Reducer,
    },
    op::{Inversion, OpDraft, OpKind, Operation, Origin, ValidationError, now_ms},
    runtime::events::OpEvent,
    sync::remote::{ConflictError, PushOutcome, SyncError},
    types::{ActorId, OpId, OpIndex, RequestId},
};

use super::{
    guard::{Admission, IdempotencyGuard},
    history::{UndoRedoState, UndoRedoStack},
    log::{Lifecycle, LogEntry, LogError, OperationLog, Source},
    phase::{Phase, PhaseGate},
};

/// Why `initialize` failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitializationError {
    /// The journal could not be read.
    #[error("snapshot load failed: {0}")]
    Load(String),
    /// A journaled operation failed validation.
    #[error("journaled operation {id} is invalid: {error}")]
    InvalidOp {
        /// Offending operation.
        id: OpId,
        /// What validation reported.
        #[source]
        error: ValidationError,
    },
    /// The journaled ops conflict with each other.
    #[error("journal is inconsistent: {0}")]
    Log(#[from] LogError),
    /// Another replay or sync holds the phase gate.
    #[error("cannot initialize while {0:?}")]
    Busy(Phase),
}

/// Why a foreground call was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    /// The draft failed validation.
    #[error("invalid operation: {0}")]
    Validation(#[from] ValidationError),
    /// `initialize` has not completed.
    #[error("manager is not initialized")]
    NotReady,
}

/// Whether appends wait for a remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Appends stay `Pending` until a sync cycle resolves them.
    Remote,
    /// Every append is confirmed on the spot.
    LocalOnly,
}

/// Result of `append`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    /// Id assigned to the new entry.
    pub id: OpId,
    /// Request key the entry was admitted under.
    pub request_id: RequestId,
    /// Lifecycle right after the append.
    pub lifecycle: Lifecycle,
    /// True when the request key was already known and nothing was applied.
    pub duplicate: bool,
}

/// Why a reconciliation cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `initialize` has not completed.
    NotReady,
    /// There is no authority to reconcile with.
    LocalOnly,
    /// Another replay or sync holds the phase gate.
    Busy(Phase),
    /// The manager is being destroyed.
    ShuttingDown,
}

/// Everything a sync cycle needs from the log, taken under the `Syncing` phase.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    /// Pending ops to push, in insertion order.
    pub ops: Vec<Operation>,
    /// Contiguous confirmed watermark to pull from.
    pub after: Option<OpIndex>,
}

/// What the authority said about a [`SyncBatch`].
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Verdicts on the pushed ops.
    pub pushed: Result<Vec<PushOutcome>, SyncError>,
    /// Remote ops newer than the batch watermark.
    pub pulled: Result<Vec<Operation>, SyncError>,
}

/// Counts from one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Pending entries the authority confirmed.
    pub confirmed: usize,
    /// Pending entries the authority rejected.
    pub rejected: usize,
    /// Remote ops merged into the log.
    pub pulled: usize,
    /// Pending entries the authority left undecided.
    pub still_pending: usize,
    /// Transport failures; the cycle still counts.
    pub errors: Vec<SyncError>,
}

/// Single-owner operation log manager.
///
/// Owns the log, idempotency guard, undo/redo history, and the optimistic
/// local state. Nothing here blocks or awaits: the runtime actor drives sync
/// and replay jobs and feeds their results back in.
pub struct OpManager<R: Reducer> {
    reducer: Arc<R>,
    replay: ReplayEngine<R>,
    mode: SyncMode,
    actor_id: ActorId,
    initial: Snapshot<R::State>,
    base: Snapshot<R::State>,
    state: R::State,
    log: OperationLog,
    guard: IdempotencyGuard,
    history: UndoRedoStack,
    phase: PhaseGate,
    ready: bool,
    next_local_index: OpIndex,
    rejections: u64,
    replay_pending: bool,
    events: Vec<OpEvent>,
    durable: Vec<Operation>,
    confirmed_since_checkpoint: usize,
}

impl<R: Reducer> OpManager<R> {
    /// A manager over `empty` that refuses work until `initialize`.
    pub fn new(reducer: Arc<R>, mode: SyncMode, actor_id: ActorId, empty: R::State) -> Self {
        let initial = Snapshot::empty(empty);
        Self {
            replay: ReplayEngine::new(Arc::clone(&reducer)),
            reducer,
            mode,
            actor_id,
            state: initial.state.clone(),
            base: initial.clone(),
            initial,
            log: OperationLog::new(),
            guard: IdempotencyGuard::new(),
            history: UndoRedoStack::new(),
            phase: PhaseGate::new(),
            ready: false,
            next_local_index: 0,
            rejections: 0,
            replay_pending: false,
            events: Vec::new(),
            durable: Vec::new(),
            confirmed_since_checkpoint: 0,
        }
    }

    /// Caps the undo stack; the oldest entries fall off first.
    pub fn with_history_depth(mut self, depth: usize) -> Self {
        self.history = UndoRedoStack::with_max_depth(depth);
        self
    }

    /// Loads `snapshot`, replays journaled ops above its watermark, and becomes ready.
    ///
    /// On error nothing changes and the manager stays unready.
    pub fn initialize(
        &mut self,
        snapshot: Snapshot<R::State>,
        journaled: Vec<Operation>,
    ) -> Result<(), InitializationError> {
        if self.ready {
            return Ok(());
        }
        self.phase
            .try_enter(Phase::Replaying)
            .map_err(InitializationError::Busy)?;
        let result = self.load(snapshot, journaled);
        self.phase.leave(Phase::Replaying);
        result
    }

    fn load(
        &mut self,
        snapshot: Snapshot<R::State>,
        mut journaled: Vec<Operation>,
    ) -> Result<(), InitializationError> {
        journaled.sort_by_key(|op| op.op_index);

        let mut log = OperationLog::new();
        let mut guard = IdempotencyGuard::new();
        for op in journaled {
            if let Err(error) = op.kind.validate() {
                return Err(InitializationError::InvalidOp { id: op.id, error });
            }
            if op.op_index.is_some() && op.op_index <= snapshot.watermark {
                continue;
            }
            let id = op.id;
            let request_id = op.request_id.clone();
            log.append_confirmed(op, Source::Journal)?;
            guard.admit(&request_id, id);
        }

        let plan = log.replay_plan(snapshot.watermark, log.len());
        let state = self.replay.replay(&snapshot, &plan);

        self.next_local_index = log
            .max_index()
            .max(snapshot.watermark)
            .map_or(0, |i| i.saturating_add(1));
        info!(
            replayed = plan.len(),
            watermark = ?snapshot.watermark,
            "operation log initialized"
        );

        self.state = state;
        self.initial = snapshot.clone();
        self.base = snapshot;
        self.log = log;
        self.guard = guard;
        self.history.clear();
        self.events.clear();
        self.durable.clear();
        self.replay_pending = false;
        self.confirmed_since_checkpoint = 0;
        self.ready = true;
        Ok(())
    }

    /// Validates, deduplicates, and optimistically applies `draft`.
    pub fn append(&mut self, draft: OpDraft) -> Result<AppendReceipt, ManagerError> {
        self.ensure_ready()?;
        draft.kind.validate()?;

        let request_id = draft.request_id.unwrap_or_else(RequestId::generate);
        let candidate = OpId::new();
        if let Admission::Duplicate(original) = self.guard.admit(&request_id, candidate) {
            debug!(%request_id, op_id = %original, "duplicate request resolved to original entry");
            let lifecycle = self
                .log
                .get(original)
                .map_or(Lifecycle::Rejected, |e| e.lifecycle);
            return Ok(AppendReceipt {
                id: original,
                request_id,
                lifecycle,
                duplicate: true,
            });
        }

        let op = Operation {
            id: candidate,
            op_index: None,
            kind: draft.kind,
            actor_id: draft.actor_id.unwrap_or_else(|| self.actor_id.clone()),
            request_id: request_id.clone(),
            client_ts: now_ms(),
            origin: Origin::User,
        };
        let lifecycle = self.commit(op);
        self.history.record_edit(candidate);

        Ok(AppendReceipt {
            id: candidate,
            request_id,
            lifecycle,
            duplicate: false,
        })
    }

    /// Appends the inverse of the most recent undoable entry.
    ///
    /// Returns `false` when there is nothing to undo or the inverse cannot be
    /// derived; state is untouched in both cases.
    pub fn undo(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        let Some(target) = self.history.peek_undo() else {
            return false;
        };
        let Some(entry) = self.log.get(target) else {
            self.history.forget(target);
            return false;
        };

        let inverse = match entry.op.kind.inversion() {
            Inversion::Stored => entry.inverse.clone(),
            Inversion::Replay => self
                .state_before(target)
                .and_then(|before| self.reducer.invert(&before, &entry.op.kind)),
        };
        let Some(kind) = inverse else {
            warn!(op_id = %target, kind = entry.op.kind.name(), "cannot undo: inverse unavailable");
            return false;
        };

        self.history.commit_undo();
        let op = self.local_op(kind, Origin::Undo { of: target });
        self.guard.admit(&op.request_id, op.id);
        self.commit(op);
        true
    }

    /// Re-applies the most recently undone entry as a new append.
    pub fn redo(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        let Some(target) = self.history.peek_redo() else {
            return false;
        };
        let Some(kind) = self.log.get(target).map(|e| e.op.kind.clone()) else {
            self.history.forget(target);
            return false;
        };
        self.history.take_redo();

        let op = self.local_op(kind, Origin::Redo { of: target });
        let id = op.id;
        self.guard.admit(&op.request_id, id);
        self.commit(op);
        self.history.record_redo(id);
        true
    }

    /// Resolves a pending entry as accepted at `op_index`.
    pub fn confirm(&mut self, id: OpId, op_index: OpIndex) -> Result<(), LogError> {
        let op = self.log.confirm(id, op_index)?.op.clone();
        debug!(op_id = %id, op_index, "operation confirmed");
        self.confirmed_since_checkpoint += 1;
        self.durable.push(op.clone());
        self.events.push(OpEvent::Confirmed { op, op_index });
        Ok(())
    }

    /// Resolves a pending entry as refused and schedules a rollback replay.
    pub fn reject(&mut self, id: OpId, error: ConflictError) -> Result<(), LogError> {
        let op = self.log.reject(id, error.reason.clone())?.op.clone();
        warn!(op_id = %id, request_id = %op.request_id, %error, "operation rejected");

        match op.origin {
            Origin::User => self.history.forget(id),
            Origin::Undo { of } => self.history.reinstate_undo(of),
            Origin::Redo { of } => self.history.reinstate_redo(id, of),
        }
        self.rejections += 1;
        self.replay_pending = true;
        self.events.push(OpEvent::Rejected { op, error });
        Ok(())
    }

    /// Enters `Syncing` and snapshots what to push and where to pull from.
    pub fn begin_sync(&mut self) -> Result<SyncBatch, SkipReason> {
        if !self.ready {
            return Err(SkipReason::NotReady);
        }
        if self.mode == SyncMode::LocalOnly {
            return Err(SkipReason::LocalOnly);
        }
        self.phase.try_enter(Phase::Syncing).map_err(SkipReason::Busy)?;

        Ok(SyncBatch {
            ops: self.log.pending().map(|e| e.op.clone()).collect(),
            after: self.log.contiguous_watermark(self.base.watermark),
        })
    }

    /// Applies a sync cycle's outcome and leaves `Syncing`.
    ///
    /// Transport failures leave entries pending for the next cycle.
    pub fn finish_sync(&mut self, report: SyncReport) -> SyncSummary {
        self.phase.leave(Phase::Syncing);
        let mut summary = SyncSummary::default();

        match report.pushed {
            Ok(outcomes) => {
                for outcome in outcomes {
                    let request_id = match &outcome {
                        PushOutcome::Accepted { request_id, .. }
                        | PushOutcome::Refused { request_id, .. } => request_id,
                    };
                    let Some(id) = self.pending_id_for(request_id) else {
                        debug!(%request_id, "ignoring verdict for an already resolved request");
                        continue;
                    };
                    match outcome {
                        PushOutcome::Accepted { op_index, .. } => match self.confirm(id, op_index) {
                            Ok(()) => summary.confirmed += 1,
                            Err(err) => warn!(op_id = %id, %err, "could not confirm"),
                        },
                        PushOutcome::Refused { error, .. } => match self.reject(id, error) {
                            Ok(()) => summary.rejected += 1,
                            Err(err) => warn!(op_id = %id, %err, "could not reject"),
                        },
                    }
                }
            }
            Err(err) => {
                warn!(%err, "push failed; pending operations kept for retry");
                summary.errors.push(err);
            }
        }

        match report.pulled {
            Ok(mut remote) => {
                remote.sort_by_key(|op| op.op_index);
                for op in remote {
                    match self.absorb_remote(op) {
                        Absorbed::Applied => summary.pulled += 1,
                        Absorbed::ConfirmedLocal => summary.confirmed += 1,
                        Absorbed::Ignored => {}
                    }
                }
            }
            Err(err) => {
                warn!(%err, "pull failed");
                summary.errors.push(err);
            }
        }

        summary.still_pending = self.log.pending().count();
        summary
    }

    /// Takes a rollback job if a rejection is waiting and no sync or replay runs.
    pub fn begin_replay(&mut self) -> Option<ReplayJob<R::State>> {
        if !self.replay_pending {
            return None;
        }
        if let Err(current) = self.phase.try_enter(Phase::Replaying) {
            debug!(?current, "rollback replay deferred");
            return None;
        }
        self.replay_pending = false;

        let covered = self.log.len();
        let plan = self.log.replay_plan(self.base.watermark, covered);
        info!(ops = plan.len(), generation = self.rejections, "rollback replay started");
        Some(ReplayJob {
            base: self.base.clone(),
            plan,
            covered,
            generation: self.rejections,
        })
    }

    /// Adopts a finished rollback, re-applying entries appended while it ran.
    pub fn finish_replay(&mut self, outcome: ReplayOutcome<R::State>) {
        self.phase.leave(Phase::Replaying);
        if outcome.generation != self.rejections {
            debug!(
                stale = outcome.generation,
                current = self.rejections,
                "discarding stale rollback"
            );
            self.replay_pending = true;
            return;
        }

        let mut state = outcome.state;
        for entry in self.log.entries().iter().skip(outcome.covered) {
            if entry.lifecycle != Lifecycle::Rejected {
                self.reducer.apply(&mut state, &entry.op);
            }
        }
        self.state = state;
        self.refresh_inverses();
        info!(generation = outcome.generation, "rollback replay finished");
    }

    /// Recaptures every stored inverse against state without rejected effects.
    ///
    /// Inverses captured at append saw optimistic state, which may have
    /// included an op that was rejected since.
    fn refresh_inverses(&mut self) {
        let plan = self.log.replay_plan(self.initial.watermark, self.log.len());
        let mut state = self.initial.state.clone();
        let mut refreshed = Vec::new();
        for op in &plan {
            let local = self
                .log
                .get(op.id)
                .is_some_and(|e| e.source == Source::Local);
            if local && op.kind.inversion() == Inversion::Stored {
                refreshed.push((op.id, self.reducer.invert(&state, &op.kind)));
            }
            self.reducer.apply(&mut state, op);
        }
        for (id, inverse) in refreshed {
            self.log.set_inverse(id, inverse);
        }
    }

    /// Runs any waiting rollback inline.
    pub fn rollback_now(&mut self) -> bool {
        let Some(job) = self.begin_replay() else {
            return false;
        };
        let outcome = self.replay.run(job);
        self.finish_replay(outcome);
        true
    }

    /// Folds the contiguous confirmed prefix into a new base snapshot.
    ///
    /// Returns `None` when nothing new is confirmed past the current base.
    pub fn checkpoint(&mut self) -> Option<Snapshot<R::State>> {
        let mark = self.log.contiguous_watermark(self.base.watermark);
        let watermark = mark.filter(|m| Some(*m) != self.base.watermark)?;

        let from = self.base.watermark.map_or(0, |w| w.saturating_add(1));
        let entries = self.log.entries_from(from);
        let folded = entries
            .iter()
            .take_while(|e| e.op.op_index.is_some_and(|i| i <= watermark))
            .map(|e| &e.op);
        let state = self.replay.replay(&self.base, folded);

        self.base = Snapshot {
            state,
            watermark: Some(watermark),
        };
        self.confirmed_since_checkpoint = 0;
        debug!(watermark, "checkpoint taken");
        Some(self.base.clone())
    }

    /// Drops all per-document state; the manager must be initialized again.
    pub fn teardown(&mut self) {
        self.ready = false;
        self.log = OperationLog::new();
        self.guard = IdempotencyGuard::new();
        self.history.clear();
        self.events.clear();
        self.durable.clear();
        self.replay_pending = false;
        self.state = self.initial.state.clone();
        self.phase.reset();
    }

    /// Gives up on a rollback whose job died; the next tick retries it.
    pub fn abandon_replay(&mut self) {
        self.phase.leave(Phase::Replaying);
        self.replay_pending = true;
    }

    /// True once `initialize` has completed.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether appends wait for the authority.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Optimistic state: confirmed plus pending effects.
    pub fn state(&self) -> &R::State {
        &self.state
    }

    /// Snapshot that replays start from; moves on checkpoint.
    pub fn base_snapshot(&self) -> &Snapshot<R::State> {
        &self.base
    }

    /// Read access to the operation log.
    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    /// Clones of every log entry.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.entries().to_vec()
    }

    /// Entries still waiting for the authority.
    pub fn pending_ops(&self) -> Vec<LogEntry> {
        self.log.pending().cloned().collect()
    }

    /// Current undo/redo availability.
    pub fn undo_redo_state(&self) -> UndoRedoState {
        self.history.state()
    }

    /// Phase currently in effect.
    pub fn phase(&self) -> Phase {
        self.phase.current()
    }

    /// Shares the gate with tasks that outlive a borrow of the manager.
    pub fn phase_gate(&self) -> PhaseGate {
        self.phase.clone()
    }

    /// True when a rejection is waiting for a rollback replay.
    pub fn needs_replay(&self) -> bool {
        self.replay_pending
    }

    /// Confirmations since the last checkpoint.
    pub fn confirmed_since_checkpoint(&self) -> usize {
        self.confirmed_since_checkpoint
    }

    /// Events produced since the last drain, oldest first.
    pub fn drain_events(&mut self) -> Vec<OpEvent> {
        std::mem::take(&mut self.events)
    }

    /// Confirmed operations not yet handed to the journal.
    pub fn drain_durable(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.durable)
    }

    fn ensure_ready(&self) -> Result<(), ManagerError> {
        if self.ready {
            Ok(())
        } else {
            Err(ManagerError::NotReady)
        }
    }

    fn local_op(&self, kind: OpKind, origin: Origin) -> Operation {
        Operation {
            id: OpId::new(),
            op_index: None,
            kind,
            actor_id: self.actor_id.clone(),
            request_id: RequestId::generate(),
            client_ts: now_ms(),
            origin,
        }
    }

    /// Applies a locally authored op and logs it; the guard already holds its key.
    fn commit(&mut self, op: Operation) -> Lifecycle {
        let id = op.id;
        let inverse = match op.kind.inversion() {
            Inversion::Stored => self.reducer.invert(&self.state, &op.kind),
            Inversion::Replay => None,
        };
        self.reducer.apply(&mut self.state, &op);
        let op = self.log.append(op, Source::Local, inverse).op.clone();

        match self.mode {
            SyncMode::Remote => {
                self.events.push(OpEvent::Applied {
                    op,
                    optimistic: true,
                });
                Lifecycle::Pending
            }
            SyncMode::LocalOnly => {
                let index = self.next_local_index;
                self.next_local_index += 1;
                match self.log.confirm(id, index) {
                    Ok(entry) => {
                        let op = entry.op.clone();
                        self.events.push(OpEvent::Applied {
                            op: op.clone(),
                            optimistic: false,
                        });
                        self.confirmed_since_checkpoint += 1;
                        self.durable.push(op.clone());
                        self.events.push(OpEvent::Confirmed { op, op_index: index });
                        Lifecycle::Confirmed
                    }
                    Err(err) => {
                        error!(op_id = %id, %err, "local confirmation failed");
                        self.events.push(OpEvent::Applied {
                            op,
                            optimistic: true,
                        });
                        Lifecycle::Pending
                    }
                }
            }
        }
    }

    fn absorb_remote(&mut self, op: Operation) -> Absorbed {
        let Some(op_index) = op.op_index else {
            warn!(op_id = %op.id, "pulled operation has no op index");
            return Absorbed::Ignored;
        };

        if let Some(local) = self.guard.resolve(&op.request_id) {
            let pending = self.log.get(local).is_some_and(LogEntry::is_pending);
            if pending && self.confirm(local, op_index).is_ok() {
                return Absorbed::ConfirmedLocal;
            }
            return Absorbed::Ignored;
        }

        if let Err(err) = op.kind.validate() {
            warn!(op_id = %op.id, %err, "skipping invalid remote operation");
            return Absorbed::Ignored;
        }

        let id = op.id;
        let request_id = op.request_id.clone();
        let op = match self.log.append_confirmed(op, Source::Remote) {
            Ok(entry) => entry.op.clone(),
            Err(err) => {
                warn!(op_id = %id, %err, "skipping remote operation");
                return Absorbed::Ignored;
            }
        };
        self.guard.admit(&request_id, id);
        self.reducer.apply(&mut self.state, &op);

        self.confirmed_since_checkpoint += 1;
        self.durable.push(op.clone());
        self.events.push(OpEvent::Applied {
            op: op.clone(),
            optimistic: false,
        });
        self.events.push(OpEvent::Confirmed { op, op_index });
        Absorbed::Applied
    }

    fn pending_id_for(&self, request_id: &RequestId) -> Option<OpId> {
        let id = self.guard.resolve(request_id)?;
        self.log.get(id).filter(|e| e.is_pending()).map(LogEntry::id)
    }

    fn state_before(&self, target: OpId) -> Option<R::State> {
        let at = self.log.position(target)?;
        let plan = self.log.replay_plan(self.initial.watermark, at);
        Some(self.replay.replay(&self.initial, &plan))
    }
}

enum Absorbed {
    Applied,
    ConfirmedLocal,
    Ignored,
}
