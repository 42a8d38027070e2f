//! Global timestamp ordering for deferred events.
//!
//! Each perf ring buffer delivers its records in timestamp order, but
//! nothing orders records across buffers. The processor keeps one queue
//! per origin fd and emits events to its visitor in merged timestamp
//! order, never emitting past the oldest per-fd high-water mark: any
//! future arrival on an fd must be at least as new as the newest
//! timestamp already seen there, and an fd whose queue has drained
//! still bounds the horizon until something newer arrives on it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::Arc;

use log::debug;

use crate::records::{EmptySampleRecord, StackSampleRecord};
use crate::tracer::InstrumentedFunction;

/// A decoded event whose processing was moved off the dispatcher's hot
/// path, tagged by the ring buffer fd it originated from.
pub enum DeferredEvent {
    /// A periodic stack sample of the traced process.
    StackSample(Box<StackSampleRecord>),
    /// An instrumented function was entered, with registers and stack
    /// captured for unwinding.
    UprobeEntry {
        function: Arc<InstrumentedFunction>,
        record: Box<StackSampleRecord>,
    },
    /// An instrumented function returned.
    UretprobeReturn {
        function: Arc<InstrumentedFunction>,
        record: Box<EmptySampleRecord>,
    },
    /// The traced process mapped executable memory; carries a fresh
    /// /proc/<pid>/maps snapshot for the unwinder.
    MapsRefresh { timestamp_ns: u64, maps: String },
}

impl DeferredEvent {
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            DeferredEvent::StackSample(record) => record.sample_id.time,
            DeferredEvent::UprobeEntry { record, .. } => record.sample_id.time,
            DeferredEvent::UretprobeReturn { record, .. } => record.sample_id.time,
            DeferredEvent::MapsRefresh { timestamp_ns, .. } => *timestamp_ns,
        }
    }
}

pub trait PerfEventVisitor {
    fn visit(&mut self, event: DeferredEvent);
}

pub struct PerfEventProcessor<V> {
    visitor: V,
    queues: BTreeMap<RawFd, VecDeque<DeferredEvent>>,
    /// Newest timestamp ever seen per fd. Never removed, even when the
    /// fd's queue drains.
    last_seen_ns: HashMap<RawFd, u64>,
}

impl<V: PerfEventVisitor> PerfEventProcessor<V> {
    pub fn new(visitor: V) -> Self {
        PerfEventProcessor {
            visitor,
            queues: BTreeMap::new(),
            last_seen_ns: HashMap::new(),
        }
    }

    /// Queue one event. Arrivals on a single fd are expected in timestamp
    /// order; a straggler is tolerated by inserting it in place rather
    /// than asserting.
    pub fn add_event(&mut self, origin_fd: RawFd, event: DeferredEvent) {
        let timestamp_ns = event.timestamp_ns();
        let last_seen = self.last_seen_ns.entry(origin_fd).or_insert(0);
        *last_seen = (*last_seen).max(timestamp_ns);
        let queue = self.queues.entry(origin_fd).or_default();
        if queue
            .back()
            .is_some_and(|back| back.timestamp_ns() > timestamp_ns)
        {
            debug!("out of order event on fd {origin_fd}, reordering");
            let index = queue
                .iter()
                .rposition(|queued| queued.timestamp_ns() <= timestamp_ns)
                .map_or(0, |i| i + 1);
            queue.insert(index, event);
        } else {
            queue.push_back(event);
        }
    }

    /// Emit every event that can no longer be preceded by a future
    /// arrival: everything up to the minimum of the per-fd high-water
    /// marks, drained fds included.
    pub fn process_old_events(&mut self) {
        let horizon = self.last_seen_ns.values().copied().min();
        if let Some(horizon) = horizon {
            self.emit_up_to(Some(horizon));
        }
    }

    /// Drain everything, in merged timestamp order. Called once no more
    /// events can arrive.
    pub fn process_all_events(&mut self) {
        self.emit_up_to(None);
    }

    fn emit_up_to(&mut self, horizon: Option<u64>) {
        loop {
            let next_fd = self
                .queues
                .iter()
                .filter_map(|(fd, queue)| {
                    queue.front().map(|front| (*fd, front.timestamp_ns()))
                })
                .min_by_key(|&(_, timestamp_ns)| timestamp_ns);
            let Some((fd, timestamp_ns)) = next_fd else {
                break;
            };
            if horizon.is_some_and(|h| timestamp_ns > h) {
                break;
            }
            if let Some(event) = self.queues.get_mut(&fd).and_then(VecDeque::pop_front) {
                self.visitor.visit(event);
            }
        }
    }
}
