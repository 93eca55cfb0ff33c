//! Bounded FIFO of envelopes awaiting transmission while disconnected.
//!
//! Submission order is the delivery order: the driver flushes from the head
//! on reconnect and stops on wire failure, so a partial flush never
//! reorders the remainder.

use std::collections::VecDeque;

use crew_protocol::{ClientEnvelope, Envelope};

/// Default maximum number of buffered envelopes.
pub const DEFAULT_QUEUE_LIMIT: usize = 1024;

/// The queue is at capacity; the send is rejected rather than an older
/// envelope silently dropped.
#[derive(Debug, thiserror::Error)]
#[error("outbound queue full ({limit} envelopes)")]
pub struct QueueFull {
    pub limit: usize,
}

pub struct OutboundQueue {
    queue: VecDeque<Envelope<ClientEnvelope>>,
    limit: usize,
}

impl OutboundQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit,
        }
    }

    /// Append to the tail. Fails when the buffer is at capacity.
    pub fn enqueue(&mut self, envelope: Envelope<ClientEnvelope>) -> Result<(), QueueFull> {
        if self.queue.len() >= self.limit {
            return Err(QueueFull { limit: self.limit });
        }
        self.queue.push_back(envelope);
        Ok(())
    }

    /// Take the next envelope to transmit.
    pub fn pop_front(&mut self) -> Option<Envelope<ClientEnvelope>> {
        self.queue.pop_front()
    }

    /// Put a popped envelope back at the head after a failed transmit.
    /// Bypasses the capacity limit: a requeue must never drop.
    pub fn requeue_front(&mut self, envelope: Envelope<ClientEnvelope>) {
        self.queue.push_front(envelope);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_protocol::SessionId;

    fn ping() -> Envelope<ClientEnvelope> {
        Envelope::new(SessionId::from("s"), ClientEnvelope::Ping)
    }

    #[test]
    fn preserves_fifo_order() {
        let mut q = OutboundQueue::new(10);
        for i in 0..3u64 {
            let env = Envelope::new(SessionId::from(format!("s-{i}").as_str()), ClientEnvelope::Ping);
            q.enqueue(env).unwrap();
        }
        assert_eq!(q.pop_front().unwrap().session_id, SessionId::from("s-0"));
        assert_eq!(q.pop_front().unwrap().session_id, SessionId::from("s-1"));
        assert_eq!(q.pop_front().unwrap().session_id, SessionId::from("s-2"));
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn rejects_when_full() {
        let mut q = OutboundQueue::new(2);
        q.enqueue(ping()).unwrap();
        q.enqueue(ping()).unwrap();
        let err = q.enqueue(ping()).unwrap_err();
        assert_eq!(err.limit, 2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn requeue_front_restores_order_and_ignores_cap() {
        let mut q = OutboundQueue::new(2);
        let a = Envelope::new(SessionId::from("a"), ClientEnvelope::Ping);
        let b = Envelope::new(SessionId::from("b"), ClientEnvelope::Ping);
        q.enqueue(a).unwrap();
        q.enqueue(b).unwrap();

        // simulate a failed transmit mid-flush
        let popped = q.pop_front().unwrap();
        q.requeue_front(popped);

        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_front().unwrap().session_id, SessionId::from("a"));
        assert_eq!(q.pop_front().unwrap().session_id, SessionId::from("b"));
    }
}
