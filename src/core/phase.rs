use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

/// What the manager is doing with its log right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Free for a reconciliation or a replay to begin.
    Idle,
    /// State is being rebuilt from snapshot plus log.
    Replaying,
    /// A reconciliation cycle is reading or awaiting the authority.
    Syncing,
}

impl Phase {
    fn encode(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Replaying => 1,
            Phase::Syncing => 2,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            1 => Phase::Replaying,
            2 => Phase::Syncing,
            _ => Phase::Idle,
        }
    }
}

/// Shared `Idle | Replaying | Syncing` cell.
///
/// Both the timer path and foreground calls must win [`PhaseGate::try_enter`]
/// before touching the log in a way that conflicts with the other.
#[derive(Debug, Clone, Default)]
pub struct PhaseGate {
    cell: Arc<AtomicU8>,
}

impl PhaseGate {
    /// Gate starting at `Idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase currently in effect.
    pub fn current(&self) -> Phase {
        Phase::decode(self.cell.load(Ordering::Acquire))
    }

    /// Atomically moves `Idle -> phase`; on failure returns the phase in effect.
    pub fn try_enter(&self, phase: Phase) -> Result<(), Phase> {
        self.cell
            .compare_exchange(
                Phase::Idle.encode(),
                phase.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(Phase::decode)
    }

    /// Returns to `Idle` if `phase` is still the one in effect.
    pub fn leave(&self, phase: Phase) -> bool {
        self.cell
            .compare_exchange(
                phase.encode(),
                Phase::Idle.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Forces `Idle`; only for teardown after in-flight work was cancelled.
    pub fn reset(&self) {
        self.cell.store(Phase::Idle.encode(), Ordering::Release);
    }
}
