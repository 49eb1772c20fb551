use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    core::{
        history::UndoRedoState,
        log::LogEntry,
        manager::{
            AppendReceipt, InitializationError, ManagerError, OpManager, SkipReason, SyncMode,
            SyncReport, SyncSummary,
        },
        phase::{Phase, PhaseGate},
    },
    engine::{
        replay::{ReplayEngine, ReplayOutcome, Snapshot},
        traits::Reducer,
    },
    op::{OpDraft, Operation},
    persist::{OpJournal, PersistError, PersistResult},
    sync::{remote::RemoteAuthority, scheduler::SyncScheduler},
    types::{ActorId, OpIndex},
};

use super::events::OpEvent;

/// Errors surfaced by [`OpManagerHandle`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The manager refused the call.
    #[error(transparent)]
    Manager(#[from] ManagerError),
    /// Loading the journal failed.
    #[error(transparent)]
    Initialization(#[from] InitializationError),
    /// The journal failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The manager task is gone.
    #[error("operation manager is shut down")]
    ChannelClosed,
}

/// Runtime settings; missing fields in a serialized config take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// `false` selects local-only mode: appends confirm immediately.
    pub server_sync: bool,
    /// Author stamped on local drafts that name none.
    pub actor_id: ActorId,
    /// Period of the background reconciliation cycle.
    pub sync_interval_ms: u64,
    /// Undo depth cap; zero keeps everything.
    pub history_depth: usize,
    /// Confirmed ops buffered before the worker writes a batch.
    pub batch_max_ops: usize,
    /// Longest a buffered op waits for a write.
    pub batch_max_latency_ms: u64,
    /// Capacity of the persistence queue.
    pub persist_queue_bound: usize,
    /// Automatic checkpoint after this many confirmations; zero disables.
    pub snapshot_every_ops: usize,
    /// Capacity of the event broadcast.
    pub event_capacity: usize,
    /// Capacity of the command channel.
    pub command_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server_sync: true,
            actor_id: ActorId::from("local"),
            sync_interval_ms: 30_000,
            history_depth: 0,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_ops: 2000,
            event_capacity: 1024,
            command_capacity: 256,
        }
    }
}

impl ManagerConfig {
    /// Defaults with server sync off.
    pub fn local_only() -> Self {
        Self {
            server_sync: false,
            ..Self::default()
        }
    }

    fn mode(&self) -> SyncMode {
        if self.server_sync {
            SyncMode::Remote
        } else {
            SyncMode::LocalOnly
        }
    }
}

/// How a `sync()` request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The cycle did not run.
    Skipped(SkipReason),
    /// The cycle ran to the end.
    Completed(SyncSummary),
}

/// Cloneable handle to one document's operation manager task.
pub struct OpManagerHandle<S> {
    cmd_tx: mpsc::Sender<Command<S>>,
    events_tx: broadcast::Sender<OpEvent>,
    phase: PhaseGate,
}

impl<S> Clone for OpManagerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
            phase: self.phase.clone(),
        }
    }
}

enum Command<S> {
    Initialize {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Append {
        draft: OpDraft,
        resp: oneshot::Sender<Result<AppendReceipt, RuntimeError>>,
    },
    Undo {
        resp: oneshot::Sender<bool>,
    },
    Redo {
        resp: oneshot::Sender<bool>,
    },
    Sync {
        resp: oneshot::Sender<SyncOutcome>,
    },
    UndoRedo {
        resp: oneshot::Sender<UndoRedoState>,
    },
    Pending {
        resp: oneshot::Sender<Vec<LogEntry>>,
    },
    Entries {
        resp: oneshot::Sender<Vec<LogEntry>>,
    },
    State {
        resp: oneshot::Sender<S>,
    },
    Flush {
        resp: oneshot::Sender<Result<Option<OpIndex>, RuntimeError>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<bool, RuntimeError>>,
    },
    Destroy {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum Internal<S> {
    SyncDone(SyncReport),
    ReplayDone(ReplayOutcome<S>),
    ReplayFailed(String),
}

enum PersistMsg<S> {
    Ops(Vec<Operation>),
    Load {
        resp: oneshot::Sender<PersistResult<(Option<Snapshot<S>>, Vec<Operation>)>>,
    },
    Flush {
        resp: oneshot::Sender<PersistResult<Option<OpIndex>>>,
    },
    Checkpoint {
        snapshot: Snapshot<S>,
        resp: oneshot::Sender<PersistResult<()>>,
    },
    Shutdown {
        resp: oneshot::Sender<PersistResult<()>>,
    },
}

/// Starts the manager task for one document.
///
/// The manager is unusable until [`OpManagerHandle::initialize`] succeeds.
pub fn spawn_manager<R, A>(
    reducer: R,
    remote: A,
    journal: Option<Box<dyn OpJournal<R::State>>>,
    config: ManagerConfig,
) -> OpManagerHandle<R::State>
where
    R: Reducer,
    R::State: Default,
    A: RemoteAuthority,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command<R::State>>(config.command_capacity.max(1));
    let (events_tx, _) = broadcast::channel::<OpEvent>(config.event_capacity.max(1));
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<Internal<R::State>>();

    let persist_tx = journal.map(|journal| {
        let (persist_tx, persist_rx) =
            mpsc::channel::<PersistMsg<R::State>>(config.persist_queue_bound.max(1));
        spawn_persistence_worker(journal, persist_rx, config.clone());
        persist_tx
    });

    let reducer = Arc::new(reducer);
    let mut core = OpManager::new(
        Arc::clone(&reducer),
        config.mode(),
        config.actor_id.clone(),
        R::State::default(),
    );
    if config.history_depth > 0 {
        core = core.with_history_depth(config.history_depth);
    }
    let phase = core.phase_gate();

    let mut actor = Actor {
        core,
        replay: ReplayEngine::new(reducer),
        remote: Arc::new(remote),
        scheduler: SyncScheduler::new(Duration::from_millis(config.sync_interval_ms)),
        events_tx: events_tx.clone(),
        persist_tx,
        internal_tx,
        sync_waiters: Vec::new(),
        replay_waiters: Vec::new(),
        replay_task: None,
        config,
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = actor.shutdown().await;
                        break;
                    };
                    if actor.handle_command(cmd).await {
                        break;
                    }
                }
                Some(msg) = internal_rx.recv() => {
                    actor.handle_internal(msg).await;
                }
                _ = actor.scheduler.tick() => {
                    actor.on_tick().await;
                }
            }
        }
    });

    OpManagerHandle {
        cmd_tx,
        events_tx,
        phase,
    }
}

impl<S> OpManagerHandle<S> {
    /// New receiver for every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<OpEvent> {
        self.events_tx.subscribe()
    }

    /// Phase currently in effect.
    pub fn phase(&self) -> Phase {
        self.phase.current()
    }

    /// Loads the snapshot and journal, replays, and starts the sync timer.
    pub async fn initialize(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Initialize { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Returns once the optimistic effect is committed; watch
    /// [`OpEvent::Confirmed`] / [`OpEvent::Rejected`] for the final verdict.
    pub async fn append_op(&self, draft: impl Into<OpDraft>) -> Result<AppendReceipt, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Append {
                draft: draft.into(),
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Neutralizes the latest undoable entry; false when there is none.
    pub async fn undo(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Undo { resp: tx }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Re-applies the latest undone entry; false when there is none.
    pub async fn redo(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Redo { resp: tx }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Runs one reconciliation cycle now, including any rollback it causes.
    pub async fn sync(&self) -> Result<SyncOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Sync { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Current undo/redo availability.
    pub async fn undo_redo_state(&self) -> Result<UndoRedoState, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::UndoRedo { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Entries still waiting for the authority.
    pub async fn pending_ops(&self) -> Result<Vec<LogEntry>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Pending { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Every log entry in insertion order.
    pub async fn entries(&self) -> Result<Vec<LogEntry>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Entries { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Clone of the current optimistic state.
    pub async fn state(&self) -> Result<S, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::State { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Waits until every confirmed op so far is in the journal.
    pub async fn flush(&self) -> Result<Option<OpIndex>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Returns `true` when a new snapshot was taken.
    pub async fn checkpoint(&self) -> Result<bool, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Checkpoint { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Stops the scheduler, cancels in-flight work, and flushes the journal.
    /// Calling it again is a no-op.
    pub async fn destroy(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Destroy { resp: tx }).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

struct Actor<R: Reducer, A: RemoteAuthority> {
    core: OpManager<R>,
    replay: ReplayEngine<R>,
    remote: Arc<A>,
    scheduler: SyncScheduler,
    events_tx: broadcast::Sender<OpEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg<R::State>>>,
    internal_tx: mpsc::UnboundedSender<Internal<R::State>>,
    sync_waiters: Vec<oneshot::Sender<SyncOutcome>>,
    replay_waiters: Vec<(oneshot::Sender<SyncOutcome>, SyncSummary)>,
    replay_task: Option<JoinHandle<()>>,
    config: ManagerConfig,
}

impl<R, A> Actor<R, A>
where
    R: Reducer,
    R::State: Default,
    A: RemoteAuthority,
{
    async fn handle_command(&mut self, cmd: Command<R::State>) -> bool {
        match cmd {
            Command::Initialize { resp } => {
                let res = self.initialize().await;
                let _ = resp.send(res);
            }
            Command::Append { draft, resp } => {
                let res = self.core.append(draft).map_err(RuntimeError::from);
                self.after_mutation().await;
                let _ = resp.send(res);
            }
            Command::Undo { resp } => {
                let done = self.core.undo();
                self.after_mutation().await;
                let _ = resp.send(done);
            }
            Command::Redo { resp } => {
                let done = self.core.redo();
                self.after_mutation().await;
                let _ = resp.send(done);
            }
            Command::Sync { resp } => {
                self.start_sync(Some(resp));
            }
            Command::UndoRedo { resp } => {
                let _ = resp.send(self.core.undo_redo_state());
            }
            Command::Pending { resp } => {
                let _ = resp.send(self.core.pending_ops());
            }
            Command::Entries { resp } => {
                let _ = resp.send(self.core.entries());
            }
            Command::State { resp } => {
                let _ = resp.send(self.core.state().clone());
            }
            Command::Flush { resp } => {
                self.publish().await;
                let out = match self.persist_tx.as_ref() {
                    Some(tx) => {
                        let (flush_tx, flush_rx) = oneshot::channel();
                        if tx.send(PersistMsg::Flush { resp: flush_tx }).await.is_err() {
                            Err(RuntimeError::ChannelClosed)
                        } else {
                            flush_rx
                                .await
                                .map_err(|_| RuntimeError::ChannelClosed)
                                .and_then(|r| r.map_err(RuntimeError::from))
                        }
                    }
                    None => Ok(self.core.log().max_index()),
                };
                let _ = resp.send(out);
            }
            Command::Checkpoint { resp } => {
                let out = self.checkpoint().await;
                let _ = resp.send(out);
            }
            Command::Destroy { resp } => {
                let out = self.shutdown().await;
                let _ = resp.send(out);
                return true;
            }
        }

        false
    }

    async fn initialize(&mut self) -> Result<(), RuntimeError> {
        if self.core.is_ready() {
            return Ok(());
        }

        let (snapshot, ops) = match self.persist_tx.as_ref() {
            Some(tx) => {
                let (load_tx, load_rx) = oneshot::channel();
                tx.send(PersistMsg::Load { resp: load_tx })
                    .await
                    .map_err(|_| RuntimeError::ChannelClosed)?;
                let (snapshot, ops) = load_rx
                    .await
                    .map_err(|_| RuntimeError::ChannelClosed)?
                    .map_err(|e| InitializationError::Load(e.to_string()))?;
                (snapshot.unwrap_or_default(), ops)
            }
            None => (Snapshot::default(), Vec::new()),
        };

        if let Err(err) = self.core.initialize(snapshot, ops) {
            error!(%err, "initialization failed");
            return Err(err.into());
        }
        self.scheduler.start();
        info!(mode = ?self.core.mode(), "operation manager ready");
        Ok(())
    }

    async fn handle_internal(&mut self, msg: Internal<R::State>) {
        match msg {
            Internal::SyncDone(report) => {
                self.scheduler.complete();
                let summary = self.core.finish_sync(report);
                debug!(
                    confirmed = summary.confirmed,
                    rejected = summary.rejected,
                    pulled = summary.pulled,
                    still_pending = summary.still_pending,
                    "sync cycle finished"
                );
                self.after_mutation().await;

                let waiters = std::mem::take(&mut self.sync_waiters);
                if self.start_replay() {
                    self.replay_waiters
                        .extend(waiters.into_iter().map(|w| (w, summary.clone())));
                } else {
                    for waiter in waiters {
                        let _ = waiter.send(SyncOutcome::Completed(summary.clone()));
                    }
                }
            }
            Internal::ReplayDone(outcome) => {
                self.replay_task = None;
                self.core.finish_replay(outcome);
                if !self.start_replay() {
                    for (waiter, summary) in self.replay_waiters.drain(..) {
                        let _ = waiter.send(SyncOutcome::Completed(summary));
                    }
                }
            }
            Internal::ReplayFailed(reason) => {
                error!(%reason, "rollback replay failed");
                self.replay_task = None;
                self.core.abandon_replay();
                for (waiter, summary) in self.replay_waiters.drain(..) {
                    let _ = waiter.send(SyncOutcome::Completed(summary));
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        match self.core.mode() {
            SyncMode::LocalOnly => {
                if self.core.confirmed_since_checkpoint() > 0 {
                    if let Err(err) = self.checkpoint().await {
                        warn!(%err, "scheduled checkpoint failed");
                    }
                }
            }
            SyncMode::Remote => {
                self.start_replay();
                self.start_sync(None);
            }
        }
    }

    fn start_sync(&mut self, waiter: Option<oneshot::Sender<SyncOutcome>>) {
        if self.scheduler.is_in_flight() {
            self.skip_sync(SkipReason::Busy(Phase::Syncing), waiter);
            return;
        }
        let batch = match self.core.begin_sync() {
            Ok(batch) => batch,
            Err(reason) => {
                self.skip_sync(reason, waiter);
                return;
            }
        };

        let remote = Arc::clone(&self.remote);
        let internal_tx = self.internal_tx.clone();
        let started = Instant::now();
        let cycle = tokio::spawn(async move {
            let pushed = if batch.ops.is_empty() {
                Ok(Vec::new())
            } else {
                remote.push(batch.ops).await
            };
            let pulled = remote.pull(batch.after).await;
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "sync round trip done");
            let _ = internal_tx.send(Internal::SyncDone(SyncReport { pushed, pulled }));
        });
        self.scheduler.track(cycle);
        if let Some(waiter) = waiter {
            self.sync_waiters.push(waiter);
        }
    }

    fn skip_sync(&self, reason: SkipReason, waiter: Option<oneshot::Sender<SyncOutcome>>) {
        debug!(?reason, "sync cycle skipped");
        if let Some(waiter) = waiter {
            let _ = waiter.send(SyncOutcome::Skipped(reason));
        }
    }

    /// Launches a rollback on a blocking thread if one is due.
    fn start_replay(&mut self) -> bool {
        if self.replay_task.is_some() {
            return true;
        }
        let Some(job) = self.core.begin_replay() else {
            return false;
        };

        let engine = self.replay.clone();
        let internal_tx = self.internal_tx.clone();
        self.replay_task = Some(tokio::spawn(async move {
            let msg = match tokio::task::spawn_blocking(move || engine.run(job)).await {
                Ok(outcome) => Internal::ReplayDone(outcome),
                Err(e) => Internal::ReplayFailed(format!("join error: {e}")),
            };
            let _ = internal_tx.send(msg);
        }));
        true
    }

    async fn after_mutation(&mut self) {
        self.publish().await;
        let due = self.config.snapshot_every_ops > 0
            && self.persist_tx.is_some()
            && self.core.confirmed_since_checkpoint() >= self.config.snapshot_every_ops;
        if due {
            if let Err(err) = self.checkpoint().await {
                warn!(%err, "automatic checkpoint failed");
            }
        }
    }

    /// Emits queued events and hands confirmed ops to the journal.
    async fn publish(&mut self) {
        for event in self.core.drain_events() {
            let _ = self.events_tx.send(event);
        }
        let durable = self.core.drain_durable();
        if durable.is_empty() {
            return;
        }
        let Some(tx) = self.persist_tx.as_ref() else {
            return;
        };
        if tx.send(PersistMsg::Ops(durable)).await.is_err() {
            error!("persistence worker is gone; confirmed operations not journaled");
        }
    }

    async fn checkpoint(&mut self) -> Result<bool, RuntimeError> {
        self.publish().await;
        let Some(snapshot) = self.core.checkpoint() else {
            return Ok(false);
        };
        let Some(tx) = self.persist_tx.as_ref() else {
            return Ok(true);
        };

        let (cp_tx, cp_rx) = oneshot::channel();
        tx.send(PersistMsg::Checkpoint {
            snapshot,
            resp: cp_tx,
        })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
        cp_rx.await.map_err(|_| RuntimeError::ChannelClosed)??;
        Ok(true)
    }

    async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        self.scheduler.stop();
        if let Some(task) = self.replay_task.take() {
            task.abort();
        }
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.send(SyncOutcome::Skipped(SkipReason::ShuttingDown));
        }
        for (waiter, _) in self.replay_waiters.drain(..) {
            let _ = waiter.send(SyncOutcome::Skipped(SkipReason::ShuttingDown));
        }

        self.publish().await;
        let out = match self.persist_tx.take() {
            Some(tx) => {
                let (done_tx, done_rx) = oneshot::channel();
                if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    done_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            }
            None => Ok(()),
        };
        self.core.teardown();
        info!("operation manager destroyed");
        out
    }
}

fn spawn_persistence_worker<S>(
    journal: Box<dyn OpJournal<S>>,
    mut rx: mpsc::Receiver<PersistMsg<S>>,
    config: ManagerConfig,
) where
    S: Send + 'static,
{
    let journal = Arc::new(Mutex::new(journal));
    let latency = Duration::from_millis(config.batch_max_latency_ms);
    tokio::spawn(async move {
        let mut buf = Vec::<Operation>::new();
        let mut deadline = Instant::now() + latency;
        let mut last_durable: Option<OpIndex> = None;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = flush_buf(&journal, &mut buf, &mut last_durable, true).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Ops(ops) => {
                            buf.extend(ops);
                            if buf.len() >= config.batch_max_ops {
                                // Errors are logged; the batch stays buffered for the next flush.
                                let _ = flush_buf(&journal, &mut buf, &mut last_durable, false).await;
                                deadline = Instant::now() + latency;
                            }
                        }
                        PersistMsg::Load { resp } => {
                            let journal_ref = Arc::clone(&journal);
                            let result = tokio::task::spawn_blocking(move || {
                                let mut journal = journal_ref.blocking_lock();
                                let snapshot = journal.load_snapshot()?;
                                let watermark = snapshot.as_ref().and_then(|s| s.watermark);
                                let ops = journal.load_ops_after(watermark)?;
                                PersistResult::Ok((snapshot, ops))
                            })
                            .await
                            .map_err(|e| PersistError::Message(format!("join error: {e}")))
                            .and_then(|r| r);
                            let _ = resp.send(result);
                        }
                        PersistMsg::Flush { resp } => {
                            let result = flush_buf(&journal, &mut buf, &mut last_durable, true).await;
                            let _ = resp.send(result.map(|_| last_durable));
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Checkpoint { snapshot, resp } => {
                            let flush_result = flush_buf(&journal, &mut buf, &mut last_durable, true).await;
                            let result = if let Err(err) = flush_result {
                                Err(err)
                            } else {
                                let journal_ref = Arc::clone(&journal);
                                match tokio::task::spawn_blocking(move || {
                                    let mut journal = journal_ref.blocking_lock();
                                    journal.write_snapshot(&snapshot)
                                }).await {
                                    Ok(inner) => inner,
                                    Err(e) => Err(PersistError::Message(format!("join error: {e}"))),
                                }
                            };
                            let _ = resp.send(result);
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Shutdown { resp } => {
                            let result = flush_buf(&journal, &mut buf, &mut last_durable, true).await;
                            if result.is_err() {
                                error!(lost = buf.len(), "confirmed operations not journaled at shutdown");
                            }
                            let _ = resp.send(result);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !buf.is_empty() => {
                    let _ = flush_buf(&journal, &mut buf, &mut last_durable, false).await;
                    deadline = Instant::now() + latency;
                }
            }
        }
    });
}

async fn flush_buf<S>(
    journal: &Arc<Mutex<Box<dyn OpJournal<S>>>>,
    buf: &mut Vec<Operation>,
    last_durable: &mut Option<OpIndex>,
    call_flush: bool,
) -> PersistResult<()>
where
    S: Send + 'static,
{
    if buf.is_empty() {
        if call_flush {
            let journal_ref = Arc::clone(journal);
            tokio::task::spawn_blocking(move || {
                let mut journal = journal_ref.blocking_lock();
                journal.flush()
            })
            .await
            .map_err(|e| PersistError::Message(format!("join error: {e}")))??;
        }
        return Ok(());
    }

    // The batch leaves `buf` only once it is durable; failures are retried.
    let ops = buf.clone();
    let journal_ref = Arc::clone(journal);
    let append_res: PersistResult<Option<OpIndex>> = tokio::task::spawn_blocking(move || {
        let mut journal = journal_ref.blocking_lock();
        let index = journal.append_ops(&ops)?;
        if call_flush {
            journal.flush()?;
        }
        Ok(index)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

    match append_res {
        Ok(index) => {
            buf.clear();
            *last_durable = (*last_durable).max(index);
            Ok(())
        }
        Err(err) => {
            error!(%err, pending = buf.len(), "journal append failed; batch kept for retry");
            Err(err)
        }
    }
}
