/// Bounded FIFO for envelopes that arrive while a node is mid-cycle
///
/// Entries are kept in arrival order at this node and drained one at a time
/// when the state machine returns to IDLE.
use crate::message::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Default number of envelopes a node holds while busy
pub const DEFAULT_RELAY_CAPACITY: usize = 6;

/// What happens to a push when the buffer is already full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the incoming envelope, sender still sees success
    #[default]
    RejectNew,
    /// Drop the oldest queued envelope and keep the incoming one
    EvictOldest,
    /// Drop the incoming envelope and tell the sender to retry later
    NotifySender,
}

/// Result of a single push
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Queued { len: usize },
    /// Incoming envelope was discarded
    Dropped { notify: bool },
    /// Incoming envelope queued, this one was pushed out
    Evicted(Box<Envelope>),
}

impl PushOutcome {
    pub fn is_queued(&self) -> bool {
        !matches!(self, PushOutcome::Dropped { .. })
    }
}

#[derive(Debug)]
pub struct RelayBuffer {
    queue: VecDeque<Envelope>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: u64,
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_CAPACITY, OverflowPolicy::default())
    }
}

impl RelayBuffer {
    /// A zero capacity is bumped to one so a busy node can hold at least one trigger
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            policy,
            dropped: 0,
        }
    }

    pub fn push(&mut self, envelope: Envelope) -> PushOutcome {
        if self.queue.len() < self.capacity {
            self.queue.push_back(envelope);
            debug!("Relay buffer queued envelope ({}/{})", self.queue.len(), self.capacity);
            return PushOutcome::Queued {
                len: self.queue.len(),
            };
        }

        self.dropped += 1;
        match self.policy {
            OverflowPolicy::RejectNew | OverflowPolicy::NotifySender => {
                warn!(
                    "Relay buffer full ({}), dropping incoming {} envelope",
                    self.capacity,
                    envelope.kind()
                );
                PushOutcome::Dropped {
                    notify: self.policy == OverflowPolicy::NotifySender,
                }
            }
            OverflowPolicy::EvictOldest => {
                // Capacity is at least one, so a full queue always has a front
                let evicted = self.queue.pop_front();
                self.queue.push_back(envelope);
                warn!("Relay buffer full ({}), evicted oldest envelope", self.capacity);
                match evicted {
                    Some(old) => PushOutcome::Evicted(Box::new(old)),
                    None => PushOutcome::Queued {
                        len: self.queue.len(),
                    },
                }
            }
        }
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Envelopes lost to overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Timestamp;

    fn tagged(n: usize) -> Envelope {
        Envelope::ack().with_timestamp(Timestamp::Text(format!("row-{}", n)))
    }

    fn tag(envelope: &Envelope) -> String {
        envelope.timestamp.key()
    }

    #[test]
    fn test_fifo_order() {
        let mut buffer = RelayBuffer::default();
        for n in 0..3 {
            buffer.push(tagged(n));
        }
        assert_eq!(tag(&buffer.pop().unwrap()), "row-0");
        assert_eq!(tag(&buffer.pop().unwrap()), "row-1");
        assert_eq!(tag(&buffer.pop().unwrap()), "row-2");
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn test_reject_new_drops_seventh() {
        let mut buffer = RelayBuffer::default();
        for n in 0..6 {
            assert!(buffer.push(tagged(n)).is_queued());
        }
        assert!(buffer.is_full());

        let outcome = buffer.push(tagged(6));
        assert_eq!(outcome, PushOutcome::Dropped { notify: false });
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.dropped(), 1);

        // Newest was dropped, oldest survives
        assert_eq!(tag(&buffer.pop().unwrap()), "row-0");
    }

    #[test]
    fn test_evict_oldest_keeps_newest() {
        let mut buffer = RelayBuffer::new(2, OverflowPolicy::EvictOldest);
        buffer.push(tagged(0));
        buffer.push(tagged(1));

        match buffer.push(tagged(2)) {
            PushOutcome::Evicted(old) => assert_eq!(tag(&old), "row-0"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(tag(&buffer.pop().unwrap()), "row-1");
        assert_eq!(tag(&buffer.pop().unwrap()), "row-2");
    }

    #[test]
    fn test_notify_sender_flags_drop() {
        let mut buffer = RelayBuffer::new(1, OverflowPolicy::NotifySender);
        buffer.push(tagged(0));
        assert_eq!(buffer.push(tagged(1)), PushOutcome::Dropped { notify: true });
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let buffer = RelayBuffer::new(0, OverflowPolicy::RejectNew);
        assert_eq!(buffer.capacity(), 1);
    }
}
