//! Thread-safe FIFO of pending modification rules.
//!
//! Only the head of the queue is ever consulted.  A head rule that never
//! matches the traffic it sees blocks every rule queued behind it; that is
//! the intended behavior, so a rule set reads as a script of faults applied
//! in order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::rule::ModificationRule;

/// Shared between the rule console and every relay session.
#[derive(Debug, Clone, Default)]
pub struct ModificationRegistry {
    queue: Arc<Mutex<VecDeque<ModificationRule>>>,
}

impl ModificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `rule` to the tail.
    pub fn enqueue(&self, rule: ModificationRule) {
        log::info!("[registry] queued {rule}");
        self.queue().push_back(rule);
    }

    /// Whether the head rule selects `datagram`.  Never looks past the head.
    pub fn peek_matches(&self, datagram: &[u8]) -> bool {
        self.queue()
            .front()
            .is_some_and(|rule| rule.matches(datagram))
    }

    /// Pop and return the head rule if it selects `datagram`; otherwise
    /// leave the queue alone.  Check and pop happen under one lock, so two
    /// datagrams can never consume the same rule.
    pub fn dequeue_if_matched(&self, datagram: &[u8]) -> Option<ModificationRule> {
        let mut queue = self.queue();
        if !queue.front()?.matches(datagram) {
            return None;
        }
        let rule = queue.pop_front();
        if let Some(rule) = &rule {
            log::debug!("[registry] matched {rule}; {} left", queue.len());
        }
        rule
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Snapshot of the queue, head first.
    pub fn pending(&self) -> Vec<ModificationRule> {
        self.queue().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.queue().clear();
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<ModificationRule>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
