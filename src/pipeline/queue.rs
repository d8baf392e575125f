//! Timestamped transform FIFO backing every pipe.
//!
//! Two buffer variants share one API: `Plain` has no synchronization and is
//! only touched by the scheduler thread, `Synchronized` guards the deque with
//! a mutex scoped to this one pipe so producer threads can push through a
//! [`PipeProducer`] while the scheduler executes and flushes.

use crate::pipeline::id::PipeId;
use crate::transform::Transformation;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// A queued value with its capture time.
#[derive(Debug, Clone, Copy)]
pub struct TimedTransform {
    pub value: Transformation,
    pub captured_at: Instant,
}

impl TimedTransform {
    pub fn now(value: Transformation) -> Self {
        Self {
            value,
            captured_at: Instant::now(),
        }
    }
}

/// How `flush` trims the queue after an execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlushPolicy {
    /// Keep only the `n` most recent entries.
    Quorum(usize),
    /// Drop entries older than the given number of seconds. Not implemented:
    /// flushing with this policy keeps the queue untouched.
    Timeout(f32),
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy::Quorum(10)
    }
}

type SharedDeque = Arc<Mutex<VecDeque<TimedTransform>>>;

enum PipeBuffer {
    Plain(VecDeque<TimedTransform>),
    Synchronized(SharedDeque),
}

fn lock(deque: &SharedDeque) -> MutexGuard<'_, VecDeque<TimedTransform>> {
    // a panicking producer cannot leave the deque half-modified
    deque.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// FIFO of timestamped transforms.
pub struct TransformQueue {
    buffer: PipeBuffer,
}

impl TransformQueue {
    pub fn plain() -> Self {
        Self {
            buffer: PipeBuffer::Plain(VecDeque::new()),
        }
    }

    pub fn synchronized() -> Self {
        Self {
            buffer: PipeBuffer::Synchronized(Arc::new(Mutex::new(VecDeque::new()))),
        }
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self.buffer, PipeBuffer::Synchronized(_))
    }

    pub fn push(&mut self, value: Transformation) {
        let entry = TimedTransform::now(value);
        match &mut self.buffer {
            PipeBuffer::Plain(deque) => deque.push_back(entry),
            PipeBuffer::Synchronized(shared) => lock(shared).push_back(entry),
        }
    }

    pub fn len(&self) -> usize {
        match &self.buffer {
            PipeBuffer::Plain(deque) => deque.len(),
            PipeBuffer::Synchronized(shared) => lock(shared).len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry at `index`, oldest first.
    pub fn get(&self, index: usize) -> Option<TimedTransform> {
        match &self.buffer {
            PipeBuffer::Plain(deque) => deque.get(index).copied(),
            PipeBuffer::Synchronized(shared) => lock(shared).get(index).copied(),
        }
    }

    /// Most recently pushed value.
    pub fn latest(&self) -> Option<Transformation> {
        match &self.buffer {
            PipeBuffer::Plain(deque) => deque.back().map(|e| e.value),
            PipeBuffer::Synchronized(shared) => lock(shared).back().map(|e| e.value),
        }
    }

    /// Apply `policy`. Returns the number of dropped entries.
    pub fn flush(&mut self, policy: FlushPolicy) -> usize {
        match policy {
            FlushPolicy::Quorum(keep) => match &mut self.buffer {
                PipeBuffer::Plain(deque) => trim_front(deque, keep),
                PipeBuffer::Synchronized(shared) => trim_front(&mut lock(shared), keep),
            },
            FlushPolicy::Timeout(_) => {
                tracing::warn!("Flush policy {:?} is not implemented, queue kept", policy);
                0
            }
        }
    }

    /// Producer handle for other threads. `None` for plain queues.
    pub fn producer(&self, pipe_id: PipeId) -> Option<PipeProducer> {
        match &self.buffer {
            PipeBuffer::Plain(_) => None,
            PipeBuffer::Synchronized(shared) => Some(PipeProducer {
                pipe_id,
                deque: Arc::clone(shared),
            }),
        }
    }
}

impl Default for TransformQueue {
    fn default() -> Self {
        Self::plain()
    }
}

fn trim_front(deque: &mut VecDeque<TimedTransform>, keep: usize) -> usize {
    let excess = deque.len().saturating_sub(keep);
    deque.drain(..excess);
    excess
}

/// Cloneable, `Send` push handle into a synchronized pipe.
#[derive(Clone)]
pub struct PipeProducer {
    pipe_id: PipeId,
    deque: SharedDeque,
}

impl PipeProducer {
    pub fn pipe_id(&self) -> PipeId {
        self.pipe_id
    }

    pub fn push(&self, value: Transformation) {
        lock(&self.deque).push_back(TimedTransform::now(value));
    }

    pub fn len(&self) -> usize {
        lock(&self.deque).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PipeProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeProducer")
            .field("pipe_id", &self.pipe_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f32) -> Transformation {
        Transformation::from_position([x, 0.0, 0.0])
    }

    #[test]
    fn test_quorum_flush_drops_oldest() {
        for mut queue in [TransformQueue::plain(), TransformQueue::synchronized()] {
            for i in 0..15 {
                queue.push(at(i as f32));
            }
            assert_eq!(queue.flush(FlushPolicy::Quorum(10)), 5);
            assert_eq!(queue.len(), 10);
            assert_eq!(queue.get(0).map(|e| e.value.position[0]), Some(5.0));
            assert_eq!(queue.latest().map(|v| v.position[0]), Some(14.0));
        }
    }

    #[test]
    fn test_flush_below_quorum_is_noop() {
        let mut queue = TransformQueue::plain();
        queue.push(at(1.0));
        assert_eq!(queue.flush(FlushPolicy::Quorum(10)), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_timeout_policy_keeps_queue() {
        let mut queue = TransformQueue::plain();
        queue.push(at(1.0));
        queue.push(at(2.0));
        assert_eq!(queue.flush(FlushPolicy::Timeout(0.0)), 0);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_capture_timestamps_are_monotonic() {
        let mut queue = TransformQueue::plain();
        queue.push(at(1.0));
        queue.push(at(2.0));
        let first = queue.get(0).unwrap().captured_at;
        let second = queue.get(1).unwrap().captured_at;
        assert!(second >= first);
    }

    #[test]
    fn test_plain_queue_has_no_producer() {
        assert!(TransformQueue::plain().producer(PipeId(1)).is_none());
    }

    #[test]
    fn test_producer_pushes_from_other_threads() {
        let queue = TransformQueue::synchronized();
        let producer = queue.producer(PipeId(2)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let producer = producer.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        producer.push(at((t * 100 + i) as f32));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 100);
        assert_eq!(producer.len(), 100);
    }
}
