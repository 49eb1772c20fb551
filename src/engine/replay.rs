//! Snapshot-plus-log state reconstruction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{op::Operation, types::OpIndex};

use super::traits::Reducer;

/// Baseline state covering every confirmed op up to and including `watermark`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    /// Materialized state.
    pub state: S,
    /// Highest op index folded into `state`; `None` when nothing is.
    pub watermark: Option<OpIndex>,
}

impl<S> Snapshot<S> {
    /// Snapshot of `state` with no ops folded in.
    pub fn empty(state: S) -> Self {
        Self {
            state,
            watermark: None,
        }
    }
}

impl<S: Default> Default for Snapshot<S> {
    fn default() -> Self {
        Self::empty(S::default())
    }
}

/// Rebuilds state by folding ordered operations over a snapshot.
pub struct ReplayEngine<R: Reducer> {
    reducer: Arc<R>,
}

impl<R: Reducer> Clone for ReplayEngine<R> {
    fn clone(&self) -> Self {
        Self {
            reducer: Arc::clone(&self.reducer),
        }
    }
}

impl<R: Reducer> ReplayEngine<R> {
    /// Wraps a shared reducer.
    pub fn new(reducer: Arc<R>) -> Self {
        Self { reducer }
    }

    /// Applies `ops` in order on top of a copy of `base`.
    pub fn replay<'a>(
        &self,
        base: &Snapshot<R::State>,
        ops: impl IntoIterator<Item = &'a Operation>,
    ) -> R::State {
        let mut state = base.state.clone();
        for op in ops {
            self.reducer.apply(&mut state, op);
        }
        state
    }

    /// Runs a detached job, typically on a blocking thread.
    pub fn run(&self, job: ReplayJob<R::State>) -> ReplayOutcome<R::State> {
        let state = self.replay(&job.base, &job.plan);
        ReplayOutcome {
            state,
            covered: job.covered,
            generation: job.generation,
        }
    }
}

/// Self-contained rollback replay, detached from the live log.
#[derive(Debug, Clone)]
pub struct ReplayJob<S> {
    /// Snapshot to start from.
    pub base: Snapshot<S>,
    /// Ordered ops to fold, rejected entries already excluded.
    pub plan: Vec<Operation>,
    /// Log length when the plan was taken; later entries are re-applied on finish.
    pub covered: usize,
    /// Rejection generation the plan reflects.
    pub generation: u64,
}

/// Output of a [`ReplayJob`].
#[derive(Debug, Clone)]
pub struct ReplayOutcome<S> {
    /// Rebuilt state.
    pub state: S,
    /// Copied from the job.
    pub covered: usize,
    /// Copied from the job.
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        canvas::{CanvasState, Element, ElementShape},
        engine::canvas::CanvasReducer,
        op::{OpKind, Origin},
        types::{ActorId, OpId, Point, RequestId, Size},
    };

    fn create(id: &str, x: f64) -> Operation {
        Operation {
            id: OpId::new(),
            op_index: None,
            kind: OpKind::CreateElement {
                element: Element {
                    id: id.to_string(),
                    shape: ElementShape::Rectangle,
                    position: Point::new(x, 0.0),
                    size: Size::new(1.0, 1.0),
                    z_index: 0,
                    text: None,
                    fill: None,
                    stroke: None,
                    locked: false,
                },
            },
            actor_id: ActorId::from("t"),
            request_id: RequestId::generate(),
            client_ts: 0,
            origin: Origin::User,
        }
    }

    #[test]
    fn job_replay_matches_direct_replay() {
        let engine = ReplayEngine::new(Arc::new(CanvasReducer));
        let base = Snapshot::<CanvasState>::default();
        let ops = vec![create("a", 1.0), create("b", 2.0)];

        let direct = engine.replay(&base, &ops);
        let outcome = engine.run(ReplayJob {
            base: base.clone(),
            plan: ops,
            covered: 2,
            generation: 7,
        });

        assert_eq!(outcome.state, direct);
        assert_eq!(outcome.generation, 7);
        assert_eq!(direct.elements.len(), 2);
        assert!(base.state.elements.is_empty());
    }
}
