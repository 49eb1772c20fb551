use hashbrown::HashMap;

use crate::types::{OpId, RequestId};

/// Result of presenting a request key to the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the candidate id is now bound to the key.
    Fresh,
    /// Seen before; resolves to the entry that carried the original effect.
    Duplicate(OpId),
}

/// Maps each request key to at most one accepted effect for the log's lifetime.
#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    seen: HashMap<RequestId, OpId>,
}

impl IdempotencyGuard {
    /// Empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-record: binds `candidate` to `request_id` unless the key is known.
    pub fn admit(&mut self, request_id: &RequestId, candidate: OpId) -> Admission {
        match self.seen.get(request_id) {
            Some(original) => Admission::Duplicate(*original),
            None => {
                self.seen.insert(request_id.clone(), candidate);
                Admission::Fresh
            }
        }
    }

    /// True exactly once per key.
    pub fn should_accept(&mut self, request_id: &RequestId, candidate: OpId) -> bool {
        self.admit(request_id, candidate) == Admission::Fresh
    }

    /// The op id bound to `request_id`, if any.
    pub fn resolve(&self, request_id: &RequestId) -> Option<OpId> {
        self.seen.get(request_id).copied()
    }

    /// Number of request keys seen.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True before the first admission.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_resolves_to_original_id() {
        let mut guard = IdempotencyGuard::new();
        let key = RequestId::from("r1");
        let first = OpId::new();
        let retry = OpId::new();

        assert!(guard.should_accept(&key, first));
        assert_eq!(guard.admit(&key, retry), Admission::Duplicate(first));
        assert!(!guard.should_accept(&key, retry));
        assert_eq!(guard.resolve(&key), Some(first));
        assert_eq!(guard.len(), 1);
    }
}
