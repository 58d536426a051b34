//! Invalidation Propagator
//!
//! In-process fan-out of invalidation batches between the sessions of one
//! repository. Each live session owns one FIFO queue; a publish appends to
//! every queue except the publisher's, and a session drains its queue at
//! its own synchronization points (save, transaction begin).

use crate::models::Invalidations;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Identity of a session within its repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct InvalidationPropagator {
    queues: Mutex<HashMap<SessionId, VecDeque<Invalidations>>>,
}

impl InvalidationPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<SessionId, VecDeque<Invalidations>>> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register the queue of a newly opened session
    pub fn add_queue(&self, session: SessionId) {
        self.queues().entry(session).or_default();
        tracing::debug!("invalidation queue added for {}", session);
    }

    /// Drop the queue of a closing session, discarding undelivered batches
    pub fn remove_queue(&self, session: SessionId) {
        if let Some(pending) = self.queues().remove(&session) {
            if !pending.is_empty() {
                tracing::debug!(
                    "{} closed with {} undelivered invalidation batches",
                    session,
                    pending.len()
                );
            }
        }
    }

    /// Append `batch` to every queue except `from`'s
    ///
    /// `from` is `None` for batches coming from outside the process (cluster)
    /// or from repository maintenance; those reach every session.
    pub fn publish(&self, from: Option<SessionId>, batch: &Invalidations) {
        if batch.is_empty() {
            return;
        }
        let mut queues = self.queues();
        for (session, queue) in queues.iter_mut() {
            if Some(*session) != from {
                queue.push_back(batch.clone());
            }
        }
        tracing::debug!(
            "published {} invalidations to {} queues",
            batch.len(),
            queues.len() - usize::from(from.is_some_and(|f| queues.contains_key(&f)))
        );
    }

    /// Take everything queued for `session`, merged into one batch
    pub fn drain(&self, session: SessionId) -> Invalidations {
        let mut merged = Invalidations::new();
        match self.queues().get_mut(&session) {
            Some(queue) => {
                for batch in queue.drain(..) {
                    merged.merge(batch);
                }
            }
            None => tracing::warn!("drain requested for unknown queue {}", session),
        }
        merged
    }

    /// Number of registered queues, equal to the number of live sessions
    pub fn active_queue_count(&self) -> usize {
        self.queues().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeId;

    fn batch(id: &str) -> Invalidations {
        let mut inv = Invalidations::new();
        inv.add_modified("hierarchy", &NodeId::from(id));
        inv
    }

    #[test]
    fn test_publish_skips_publisher() {
        let propagator = InvalidationPropagator::new();
        let (a, b, c) = (SessionId(1), SessionId(2), SessionId(3));
        for s in [a, b, c] {
            propagator.add_queue(s);
        }
        propagator.publish(Some(a), &batch("x"));
        assert!(propagator.drain(a).is_empty());
        assert_eq!(propagator.drain(b).len(), 1);
        assert_eq!(propagator.drain(c).len(), 1);
        // drained queues are empty afterwards
        assert!(propagator.drain(b).is_empty());
    }

    #[test]
    fn test_drain_merges_in_order() {
        let propagator = InvalidationPropagator::new();
        propagator.add_queue(SessionId(1));
        propagator.publish(None, &batch("x"));
        propagator.publish(None, &batch("y"));
        propagator.publish(None, &batch("x"));
        assert_eq!(propagator.drain(SessionId(1)).modified.len(), 2);
    }

    #[test]
    fn test_queue_count_tracks_sessions() {
        let propagator = InvalidationPropagator::new();
        assert_eq!(propagator.active_queue_count(), 0);
        propagator.add_queue(SessionId(1));
        propagator.add_queue(SessionId(2));
        assert_eq!(propagator.active_queue_count(), 2);
        propagator.remove_queue(SessionId(1));
        assert_eq!(propagator.active_queue_count(), 1);
        propagator.remove_queue(SessionId(1));
        assert_eq!(propagator.active_queue_count(), 1);
    }
}
