//! Replication queue
//!
//! Per-SA ordered buffering between the negotiation threads (many
//! producers) and the dispatcher tasks (few consumers).
//!
//! # Structure
//!
//! ```text
//!                 ┌──────────────── lanes ───────────────┐
//! enqueue(sa) ──► │ sa 7:  [seq 4][seq 5][seq 6]          │
//!                 │ sa 9:  [seq 1]                (busy)  │ ──► take_next_ready()
//!                 │ sa 12: [seq 2][seq 3]                 │       (sa, batch)
//!                 └───────────────────────────────────────┘
//!                 ready: [7, 12]
//! ```
//!
//! - Sequence numbers are assigned under the queue lock, so insertion order
//!   is sequence order even with concurrent producers on one SA.
//! - A lane with a batch in flight is not handed out again until the batch
//!   is completed or requeued. This keeps store writes per SA monotonic
//!   while different SAs dispatch concurrently.
//! - A lane removed after its terminal event leaves its last sequence
//!   behind, so a late event for the same SA continues the numbering
//!   instead of reusing `sa:{id}:1`. The most recent `RETIRED_MEMORY`
//!   retirements are remembered.
//! - Each lane holds at most `max_per_sa` pending records. On overflow the
//!   oldest record of the lowest priority class present is evicted; if the
//!   incoming record ranks below everything buffered, it is shed instead.
//!
//! All operations hold one short-lived lock and do O(`max_per_sa`) work at
//! most; nothing here performs I/O.

use crate::config::StoreConfig;
use crate::event::{EventKind, Priority, ReplicationRecord, SaIdentifier};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Retired SAs whose last sequence is remembered
pub const RETIRED_MEMORY: usize = 4096;

/// A record removed by the admission policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dropped {
    /// SA stream
    pub sa: SaIdentifier,
    /// Kind of the dropped record
    pub kind: EventKind,
    /// Sequence of the dropped record
    pub sequence: u64,
}

/// Outcome of [`ReplicationQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Record buffered
    Accepted {
        /// Assigned sequence
        sequence: u64,
    },

    /// Record buffered after evicting an older, lower priority one
    Evicted {
        /// Assigned sequence
        sequence: u64,
        /// Record that made room
        victim: Dropped,
    },

    /// Record refused: the lane is full of higher priority records
    Shed(Dropped),

    /// Queue closed for shutdown
    Closed,
}

/// Point-in-time queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// SAs with state in the queue
    pub lanes: usize,
    /// Records waiting for dispatch
    pub pending: usize,
    /// Batches currently with a dispatcher
    pub in_flight: usize,
    /// SAs waiting for a dispatcher
    pub ready: usize,
}

#[derive(Debug, Default)]
struct Lane {
    next_seq: u64,
    pending: VecDeque<ReplicationRecord>,
    in_flight: bool,
    scheduled: bool,
    retired: bool,
}

impl Lane {
    fn resume(next_seq: u64) -> Self {
        Self {
            next_seq,
            ..Self::default()
        }
    }

    fn is_removable(&self) -> bool {
        self.retired && !self.in_flight && self.pending.is_empty()
    }
}

/// Last sequence of recently retired SAs, oldest retirement first
#[derive(Debug, Default)]
struct Retired {
    last_seq: HashMap<SaIdentifier, u64>,
    order: VecDeque<SaIdentifier>,
}

impl Retired {
    fn last_seq(&self, sa: SaIdentifier) -> u64 {
        self.last_seq.get(&sa).copied().unwrap_or(0)
    }

    fn remember(&mut self, sa: SaIdentifier, last_seq: u64) {
        if self.last_seq.insert(sa, last_seq).is_none() {
            self.order.push_back(sa);
        }
        while self.order.len() > RETIRED_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.last_seq.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    lanes: HashMap<SaIdentifier, Lane>,
    retired: Retired,
    ready: VecDeque<SaIdentifier>,
    pending_total: usize,
    in_flight: usize,
    closed: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending_total == 0 && self.in_flight == 0
    }
}

/// Bounded per-SA replication queue
#[derive(Debug)]
pub struct ReplicationQueue {
    max_per_sa: usize,
    max_batch: usize,
    state: Mutex<QueueState>,
    work: Notify,
    idle: Notify,
}

impl ReplicationQueue {
    /// Create a queue
    ///
    /// Both bounds are clamped to at least 1.
    pub fn new(max_per_sa: usize, max_batch: usize) -> Self {
        Self {
            max_per_sa: max_per_sa.max(1),
            max_batch: max_batch.max(1),
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            idle: Notify::new(),
        }
    }

    /// Create a queue with the configured bounds
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.max_queue_per_sa, config.max_batch_size)
    }

    /// Per-SA bound
    pub fn max_per_sa(&self) -> usize {
        self.max_per_sa
    }

    /// Batch bound
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    // A panicking producer must not wedge every other hook.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next sequence for `sa`, build the record and admit it
    ///
    /// `terminal` marks the last event of the SA; its lane is dropped once
    /// drained. `build` runs under the queue lock and must not block.
    pub fn enqueue<F>(&self, sa: SaIdentifier, terminal: bool, build: F) -> Admission
    where
        F: FnOnce(u64) -> ReplicationRecord,
    {
        let mut guard = self.lock();
        if guard.closed {
            return Admission::Closed;
        }

        let QueueState {
            lanes,
            retired,
            ready,
            pending_total,
            ..
        } = &mut *guard;

        let lane = lanes.entry(sa).or_insert_with(|| {
            let last_seq = retired.last_seq(sa);
            let mut lane = Lane::resume(last_seq);
            // Late event after the terminal one: drop the lane again once drained
            lane.retired = last_seq > 0;
            lane
        });
        lane.next_seq += 1;
        let sequence = lane.next_seq;
        let record = build(sequence);
        if terminal {
            lane.retired = true;
        }

        let admission = if lane.pending.len() < self.max_per_sa {
            lane.pending.push_back(record);
            *pending_total += 1;
            Admission::Accepted { sequence }
        } else {
            match lowest_priority(&lane.pending) {
                Some((index, lowest)) if lowest <= record.priority() => {
                    let victim = lane
                        .pending
                        .remove(index)
                        .map(|r| dropped(&r))
                        .unwrap_or(Dropped {
                            sa,
                            kind: record.event_kind,
                            sequence,
                        });
                    lane.pending.push_back(record);
                    Admission::Evicted { sequence, victim }
                }
                _ => Admission::Shed(dropped(&record)),
            }
        };

        let scheduled = schedule(lane, sa, ready);
        if lane.is_removable() {
            retire(lanes, retired, sa);
        }
        drop(guard);

        if scheduled {
            self.work.notify_one();
        }
        admission
    }

    /// Remove the next contiguous batch of one ready SA
    ///
    /// The SA stays busy until [`complete`](Self::complete) or
    /// [`requeue`](Self::requeue) is called for it.
    pub fn take_next_ready(&self) -> Option<(SaIdentifier, Vec<ReplicationRecord>)> {
        let mut guard = self.lock();
        let QueueState {
            lanes,
            ready,
            pending_total,
            in_flight,
            ..
        } = &mut *guard;

        while let Some(sa) = ready.pop_front() {
            let Some(lane) = lanes.get_mut(&sa) else {
                continue;
            };
            lane.scheduled = false;
            if lane.in_flight || lane.pending.is_empty() {
                continue;
            }

            let count = lane.pending.len().min(self.max_batch);
            let batch: Vec<_> = lane.pending.drain(..count).collect();
            lane.in_flight = true;
            *pending_total -= count;
            *in_flight += 1;
            return Some((sa, batch));
        }
        None
    }

    /// Acknowledge the in-flight batch of `sa`
    pub fn complete(&self, sa: SaIdentifier) {
        let mut guard = self.lock();
        let QueueState {
            lanes,
            retired,
            ready,
            in_flight,
            ..
        } = &mut *guard;

        let mut scheduled = false;
        if let Some(lane) = lanes.get_mut(&sa) {
            if lane.in_flight {
                lane.in_flight = false;
                *in_flight -= 1;
            }
            scheduled = schedule(lane, sa, ready);
            if lane.is_removable() {
                retire(lanes, retired, sa);
            }
        }

        let idle = guard.is_idle();
        drop(guard);

        if scheduled {
            self.work.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Return a failed batch to the front of its lane
    ///
    /// The admission bound is re-applied; records evicted to make the lane
    /// fit are returned.
    pub fn requeue(&self, sa: SaIdentifier, batch: Vec<ReplicationRecord>) -> Vec<Dropped> {
        let mut guard = self.lock();
        let QueueState {
            lanes,
            retired,
            ready,
            pending_total,
            in_flight,
            ..
        } = &mut *guard;

        let last_seq = batch
            .iter()
            .map(|r| r.sequence)
            .max()
            .unwrap_or(0)
            .max(retired.last_seq(sa));
        let lane = lanes
            .entry(sa)
            .or_insert_with(|| Lane::resume(last_seq));
        if lane.in_flight {
            lane.in_flight = false;
            *in_flight -= 1;
        }

        *pending_total += batch.len();
        for record in batch.into_iter().rev() {
            lane.pending.push_front(record);
        }

        let mut evicted = Vec::new();
        while lane.pending.len() > self.max_per_sa {
            let Some((index, _)) = lowest_priority(&lane.pending) else {
                break;
            };
            if let Some(record) = lane.pending.remove(index) {
                *pending_total -= 1;
                evicted.push(dropped(&record));
            }
        }

        let scheduled = schedule(lane, sa, ready);
        drop(guard);

        if scheduled {
            self.work.notify_one();
        }
        evicted
    }

    /// Stop admitting new records; dispatch continues
    pub fn close(&self) {
        self.lock().closed = true;
        self.work.notify_waiters();
    }

    /// Admit records again after [`close`](Self::close)
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Whether the queue refuses new records
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Drop every pending record; returns how many were dropped
    ///
    /// In-flight batches are left to their dispatchers.
    pub fn discard_all(&self) -> usize {
        let mut guard = self.lock();
        let QueueState {
            lanes,
            retired,
            ready,
            pending_total,
            ..
        } = &mut *guard;

        let discarded = *pending_total;
        for lane in lanes.values_mut() {
            lane.pending.clear();
            lane.scheduled = false;
        }
        let removable: Vec<_> = lanes
            .iter()
            .filter(|(_, lane)| lane.is_removable())
            .map(|(sa, _)| *sa)
            .collect();
        for sa in removable {
            retire(lanes, retired, sa);
        }
        ready.clear();
        *pending_total = 0;

        let idle = guard.is_idle();
        drop(guard);

        if idle {
            self.idle.notify_waiters();
        }
        discarded
    }

    /// Records waiting for dispatch
    pub fn pending_len(&self) -> usize {
        self.lock().pending_total
    }

    /// Nothing pending and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Current occupancy
    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            lanes: state.lanes.len(),
            pending: state.pending_total,
            in_flight: state.in_flight,
            ready: state.ready.len(),
        }
    }

    /// Wait until an SA may have become ready
    ///
    /// Wakeups can be spurious; callers re-check with
    /// [`take_next_ready`](Self::take_next_ready).
    pub async fn wait_for_work(&self) {
        self.work.notified().await;
    }

    /// Wait until nothing is pending or in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

fn dropped(record: &ReplicationRecord) -> Dropped {
    Dropped {
        sa: record.sa_id,
        kind: record.event_kind,
        sequence: record.sequence,
    }
}

/// Index of the oldest record in the lowest priority class present
fn lowest_priority(pending: &VecDeque<ReplicationRecord>) -> Option<(usize, Priority)> {
    let mut lowest: Option<(usize, Priority)> = None;
    for (index, record) in pending.iter().enumerate() {
        let priority = record.priority();
        match lowest {
            Some((_, current)) if current <= priority => {}
            _ => lowest = Some((index, priority)),
        }
    }
    lowest
}

fn retire(lanes: &mut HashMap<SaIdentifier, Lane>, retired: &mut Retired, sa: SaIdentifier) {
    if let Some(lane) = lanes.remove(&sa) {
        retired.remember(sa, lane.next_seq);
    }
}

fn schedule(lane: &mut Lane, sa: SaIdentifier, ready: &mut VecDeque<SaIdentifier>) -> bool {
    if lane.in_flight || lane.scheduled || lane.pending.is_empty() {
        return false;
    }
    lane.scheduled = true;
    ready.push_back(sa);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EventEncoder;
    use crate::event::LifecycleEvent;
    use crate::bus::IkeSaState;
    use std::sync::Arc;

    fn sa(id: u32) -> SaIdentifier {
        SaIdentifier::new(id)
    }

    fn push(queue: &ReplicationQueue, event: LifecycleEvent) -> Admission {
        let encoder = EventEncoder::new("test");
        let terminal = event.is_terminal();
        queue.enqueue(event.sa(), terminal, |seq| encoder.encode(&event, seq))
    }

    fn state(id: u32) -> LifecycleEvent {
        LifecycleEvent::StateChanged {
            sa: sa(id),
            new_state: IkeSaState::Connecting,
        }
    }

    fn updown(id: u32) -> LifecycleEvent {
        LifecycleEvent::Established { sa: sa(id), up: true }
    }

    fn message(id: u32) -> LifecycleEvent {
        LifecycleEvent::MessageObserved {
            sa: sa(id),
            direction: crate::event::Direction::Outbound,
            is_plaintext: true,
            exchange: 34,
            message_id: 0,
        }
    }

    fn sequences(batch: &[ReplicationRecord]) -> Vec<u64> {
        batch.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn test_sequences_per_sa() {
        let queue = ReplicationQueue::new(16, 16);

        assert_eq!(push(&queue, updown(1)), Admission::Accepted { sequence: 1 });
        assert_eq!(push(&queue, state(1)), Admission::Accepted { sequence: 2 });
        assert_eq!(push(&queue, updown(2)), Admission::Accepted { sequence: 1 });
        assert_eq!(queue.pending_len(), 3);

        let (first, batch) = queue.take_next_ready().unwrap();
        assert_eq!(first, sa(1));
        assert_eq!(sequences(&batch), vec![1, 2]);

        let (second, batch) = queue.take_next_ready().unwrap();
        assert_eq!(second, sa(2));
        assert_eq!(sequences(&batch), vec![1]);

        assert!(queue.take_next_ready().is_none());
    }

    #[test]
    fn test_batch_size_bound() {
        let queue = ReplicationQueue::new(16, 3);
        for _ in 0..7 {
            push(&queue, state(1));
        }

        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![1, 2, 3]);
        queue.complete(sa(1));

        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![4, 5, 6]);
    }

    #[test]
    fn test_in_flight_lane_not_redispatched() {
        let queue = ReplicationQueue::new(16, 2);
        for _ in 0..4 {
            push(&queue, state(1));
        }

        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![1, 2]);

        // More work for the same SA while its batch is out
        push(&queue, state(1));
        assert!(queue.take_next_ready().is_none());

        queue.complete(sa(1));
        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![3, 4]);
    }

    #[test]
    fn test_eviction_prefers_loss_tolerant() {
        let queue = ReplicationQueue::new(3, 3);
        push(&queue, updown(1)); // 1 critical
        push(&queue, state(1)); // 2 transition
        push(&queue, message(1)); // 3 diagnostic

        // Full: a critical arrival evicts the diagnostic record first
        match push(&queue, updown(1)) {
            Admission::Evicted { sequence, victim } => {
                assert_eq!(sequence, 4);
                assert_eq!(victim.sequence, 3);
                assert_eq!(victim.kind, EventKind::MessageObserved);
            }
            other => panic!("Expected eviction, got {:?}", other),
        }

        // Then the transition record
        match push(&queue, updown(1)) {
            Admission::Evicted { victim, .. } => assert_eq!(victim.sequence, 2),
            other => panic!("Expected eviction, got {:?}", other),
        }

        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![1, 4, 5]);
        assert!(batch.iter().all(|r| r.priority() == Priority::Critical));
    }

    #[test]
    fn test_eviction_keeps_newest_within_class() {
        let queue = ReplicationQueue::new(3, 3);
        push(&queue, state(1));
        push(&queue, state(1));
        push(&queue, state(1));

        match push(&queue, state(1)) {
            Admission::Evicted { victim, .. } => assert_eq!(victim.sequence, 1),
            other => panic!("Expected eviction, got {:?}", other),
        }

        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![2, 3, 4]);
    }

    #[test]
    fn test_low_priority_arrival_is_shed() {
        let queue = ReplicationQueue::new(2, 2);
        push(&queue, updown(1));
        push(&queue, updown(1));

        match push(&queue, message(1)) {
            Admission::Shed(dropped) => {
                assert_eq!(dropped.sequence, 3);
                assert_eq!(dropped.kind, EventKind::MessageObserved);
            }
            other => panic!("Expected shed, got {:?}", other),
        }

        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![1, 2]);
    }

    #[test]
    fn test_requeue_restores_order_and_bound() {
        let queue = ReplicationQueue::new(4, 2);
        push(&queue, updown(1)); // 1
        push(&queue, state(1)); // 2

        let (id, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![1, 2]);

        push(&queue, message(1)); // 3
        push(&queue, updown(1)); // 4
        push(&queue, updown(1)); // 5

        // 5 records for a bound of 4: the diagnostic record goes
        let evicted = queue.requeue(id, batch);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].sequence, 3);

        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![1, 2]);
        queue.complete(id);
        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![4, 5]);
    }

    #[test]
    fn test_terminal_lane_removed_after_drain() {
        let queue = ReplicationQueue::new(8, 8);
        push(&queue, updown(1));
        push(
            &queue,
            LifecycleEvent::StateChanged {
                sa: sa(1),
                new_state: IkeSaState::Destroying,
            },
        );
        assert_eq!(queue.stats().lanes, 1);

        let (id, _) = queue.take_next_ready().unwrap();
        queue.complete(id);
        assert_eq!(queue.stats().lanes, 0);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_late_event_after_retirement_gets_fresh_sequence() {
        let queue = ReplicationQueue::new(8, 8);
        push(&queue, updown(7));
        push(
            &queue,
            LifecycleEvent::StateChanged {
                sa: sa(7),
                new_state: IkeSaState::Destroying,
            },
        );
        let (id, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![1, 2]);
        queue.complete(id);
        assert_eq!(queue.stats().lanes, 0);

        // A message hook racing the teardown on another thread
        assert_eq!(push(&queue, message(7)), Admission::Accepted { sequence: 3 });
        let (_, batch) = queue.take_next_ready().unwrap();
        assert_eq!(sequences(&batch), vec![3]);

        // The late lane is dropped again and the numbering still carries on
        queue.complete(id);
        assert_eq!(queue.stats().lanes, 0);
        assert_eq!(push(&queue, message(7)), Admission::Accepted { sequence: 4 });
    }

    #[test]
    fn test_retired_memory_is_bounded() {
        let queue = ReplicationQueue::new(8, 8);
        let destroy = |id| LifecycleEvent::StateChanged {
            sa: sa(id),
            new_state: IkeSaState::Destroying,
        };

        for id in 1..=(RETIRED_MEMORY as u32 + 1) {
            push(&queue, destroy(id));
            let (busy, _) = queue.take_next_ready().unwrap();
            queue.complete(busy);
        }
        assert_eq!(queue.lock().retired.last_seq.len(), RETIRED_MEMORY);

        // The oldest retirement was forgotten, the newest is still known
        assert_eq!(push(&queue, message(1)), Admission::Accepted { sequence: 1 });
        assert_eq!(
            push(&queue, message(RETIRED_MEMORY as u32 + 1)),
            Admission::Accepted { sequence: 2 }
        );
    }

    #[test]
    fn test_discard_all_remembers_retired_lanes() {
        let queue = ReplicationQueue::new(8, 8);
        push(&queue, updown(4));
        push(
            &queue,
            LifecycleEvent::StateChanged {
                sa: sa(4),
                new_state: IkeSaState::Destroying,
            },
        );

        assert_eq!(queue.discard_all(), 2);
        assert_eq!(queue.stats().lanes, 0);
        assert_eq!(push(&queue, message(4)), Admission::Accepted { sequence: 3 });
    }

    #[test]
    fn test_closed_queue_refuses() {
        let queue = ReplicationQueue::new(8, 8);
        push(&queue, updown(1));
        queue.close();

        assert_eq!(push(&queue, updown(1)), Admission::Closed);
        assert!(queue.is_closed());

        // Already buffered work still drains
        assert!(queue.take_next_ready().is_some());
    }

    #[test]
    fn test_discard_all() {
        let queue = ReplicationQueue::new(8, 2);
        for id in 1..=3 {
            push(&queue, updown(id));
            push(&queue, state(id));
        }
        let (busy, _) = queue.take_next_ready().unwrap();

        assert_eq!(queue.discard_all(), 4);
        assert_eq!(queue.pending_len(), 0);
        assert!(!queue.is_idle());

        queue.complete(busy);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_concurrent_producers_keep_sequence_order() {
        let queue = Arc::new(ReplicationQueue::new(10_000, 64));
        let encoder = Arc::new(EventEncoder::new("test"));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                let encoder = Arc::clone(&encoder);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let event = state((t % 4) + 1);
                        queue.enqueue(event.sa(), false, |seq| encoder.encode(&event, seq));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.pending_len(), 4000);

        let mut seen: HashMap<SaIdentifier, u64> = HashMap::new();
        while let Some((id, batch)) = queue.take_next_ready() {
            for record in &batch {
                let last = seen.entry(id).or_insert(0);
                assert_eq!(record.sequence, *last + 1);
                *last = record.sequence;
            }
            queue.complete(id);
        }
        assert_eq!(seen.len(), 4);
        assert!(seen.values().all(|&last| last == 1000));
    }

    #[tokio::test]
    async fn test_wait_idle_wakes_on_complete() {
        let queue = Arc::new(ReplicationQueue::new(8, 8));
        push(&queue, updown(1));
        let (id, _) = queue.take_next_ready().unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        queue.complete(id);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle did not return")
            .unwrap();
    }
}
