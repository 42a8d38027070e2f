//! Per-thread correlation of probe events into call paths.
//!
//! Return probes hijack the return address saved on the stack, so any
//! capture taken while a thread is inside an instrumented function
//! unwinds only as far as the first hijacked slot. To rebuild the
//! missing outer frames, each entry stores the full call path computed
//! at that point, and every capture taken deeper (a nested entry or a
//! periodic stack sample) is joined against the innermost open call's
//! stored path. A matching return pops the call and emits its stored
//! path spanning entry to return.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::event_processor::{DeferredEvent, PerfEventVisitor};
use crate::listener::{CallstackEvent, TracerListener};
use crate::records::SampleRegsUser;
use crate::tracer::InstrumentedFunction;

/// Call-path reconstruction from a captured register set and stack
/// copy. Supplied by the host; the engine only drives it.
pub trait Unwinder: Send {
    /// Replace the memory-map knowledge used to resolve return addresses.
    fn update_maps(&mut self, maps: &str);
    /// Produce the call path for a captured register set and stack copy,
    /// innermost frame first.
    fn unwind(&mut self, regs: &SampleRegsUser, stack: &[u8]) -> Vec<u64>;
}

struct OpenFunctionCall {
    function: Arc<InstrumentedFunction>,
    begin_timestamp_ns: u64,
    /// Full call path at entry, outer frames already rebuilt.
    callstack: Vec<u64>,
}

pub struct UprobesVisitor {
    listener: Arc<dyn TracerListener>,
    unwinder: Box<dyn Unwinder>,
    open_calls_per_thread: HashMap<u32, Vec<OpenFunctionCall>>,
}

impl UprobesVisitor {
    pub fn new(
        listener: Arc<dyn TracerListener>,
        mut unwinder: Box<dyn Unwinder>,
        initial_maps: &str,
    ) -> Self {
        unwinder.update_maps(initial_maps);
        UprobesVisitor {
            listener,
            unwinder,
            open_calls_per_thread: HashMap::new(),
        }
    }
}

impl PerfEventVisitor for UprobesVisitor {
    fn visit(&mut self, event: DeferredEvent) {
        match event {
            DeferredEvent::MapsRefresh { maps, .. } => {
                self.unwinder.update_maps(&maps);
            }

            DeferredEvent::UprobeEntry { function, record } => {
                // Unwind the entry capture now, not at return time, so
                // captures taken while the call is open can join against
                // the result.
                let tid = record.sample_id.tid;
                let mut frames = self.unwinder.unwind(&record.regs, record.stack_bytes());
                ensure_innermost(&mut frames, function.virtual_address);
                let calls = self.open_calls_per_thread.entry(tid).or_default();
                if let Some(enclosing) = calls.last() {
                    join_with_enclosing(&mut frames, &enclosing.callstack);
                }
                calls.push(OpenFunctionCall {
                    function,
                    begin_timestamp_ns: record.sample_id.time,
                    callstack: frames,
                });
            }

            DeferredEvent::UretprobeReturn { function, record } => {
                let tid = record.sample_id.tid;
                let end_timestamp_ns = record.sample_id.time;
                let open_call = self
                    .open_calls_per_thread
                    .get_mut(&tid)
                    .and_then(Vec::pop);
                match open_call {
                    Some(call) => {
                        // An entry for a different function means events
                        // were lost in between; the path is suspect.
                        let degraded =
                            call.function.virtual_address != function.virtual_address;
                        self.listener.on_callstack(CallstackEvent {
                            tid,
                            begin_timestamp_ns: call.begin_timestamp_ns,
                            end_timestamp_ns,
                            frames: call.callstack,
                            degraded,
                        });
                    }
                    None => {
                        debug!("return probe with no matching entry on tid {tid}");
                        self.listener.on_callstack(CallstackEvent {
                            tid,
                            begin_timestamp_ns: end_timestamp_ns,
                            end_timestamp_ns,
                            frames: vec![function.virtual_address],
                            degraded: true,
                        });
                    }
                }
            }

            DeferredEvent::StackSample(record) => {
                let tid = record.sample_id.tid;
                let timestamp_ns = record.sample_id.time;
                let mut frames = self.unwinder.unwind(&record.regs, record.stack_bytes());
                if let Some(call) = self
                    .open_calls_per_thread
                    .get(&tid)
                    .and_then(|calls| calls.last())
                {
                    ensure_function_frame(&mut frames, call.function.virtual_address);
                    join_with_enclosing(&mut frames, &call.callstack);
                }
                self.listener.on_callstack(CallstackEvent {
                    tid,
                    begin_timestamp_ns: timestamp_ns,
                    end_timestamp_ns: timestamp_ns,
                    frames,
                    degraded: false,
                });
            }
        }
    }
}

/// Entry captures begin in the instrumented function itself; make its
/// address the innermost frame when unwinding did not resolve it.
fn ensure_innermost(frames: &mut Vec<u64>, virtual_address: u64) {
    if frames.first() != Some(&virtual_address) {
        frames.insert(0, virtual_address);
    }
}

/// A sample inside an instrumented call must name that function even
/// when unwinding could not reach its frame.
fn ensure_function_frame(frames: &mut Vec<u64>, virtual_address: u64) {
    if !frames.contains(&virtual_address) {
        frames.insert(0, virtual_address);
    }
}

/// Append the enclosing call's frames beyond its own innermost one. A
/// truncated capture stops at the hijacked return address, which lives
/// in the enclosing call's innermost frame, so that frame is already
/// covered.
fn join_with_enclosing(frames: &mut Vec<u64>, enclosing_callstack: &[u64]) {
    if let Some(outer_frames) = enclosing_callstack.get(1..) {
        frames.extend_from_slice(outer_frames);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeUnwinder;
    use super::*;
    use crate::listener::testing::RecordingListener;
    use crate::records::{EmptySampleRecord, StackSampleRecord};
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn function(virtual_address: u64) -> Arc<InstrumentedFunction> {
        Arc::new(InstrumentedFunction {
            binary_path: PathBuf::from("/usr/bin/target"),
            file_offset: 0x1000,
            virtual_address,
        })
    }

    fn entry(function: &Arc<InstrumentedFunction>, tid: u32, time: u64) -> DeferredEvent {
        let mut record: Box<StackSampleRecord> = unsafe { Box::new_zeroed().assume_init() };
        record.sample_id.tid = tid;
        record.sample_id.time = time;
        DeferredEvent::UprobeEntry {
            function: function.clone(),
            record,
        }
    }

    fn ret(function: &Arc<InstrumentedFunction>, tid: u32, time: u64) -> DeferredEvent {
        let mut record: Box<EmptySampleRecord> = Box::default();
        record.sample_id.tid = tid;
        record.sample_id.time = time;
        DeferredEvent::UretprobeReturn {
            function: function.clone(),
            record,
        }
    }

    fn sample(tid: u32, time: u64) -> DeferredEvent {
        let mut record: Box<StackSampleRecord> = unsafe { Box::new_zeroed().assume_init() };
        record.sample_id.tid = tid;
        record.sample_id.time = time;
        DeferredEvent::StackSample(record)
    }

    fn visitor_with_unwinds(
        listener: Arc<RecordingListener>,
        unwinds: Vec<Vec<u64>>,
    ) -> UprobesVisitor {
        let unwinder = FakeUnwinder {
            unwinds: unwinds.into(),
            ..FakeUnwinder::default()
        };
        UprobesVisitor::new(listener, Box::new(unwinder), "")
    }

    #[test]
    fn test_entry_return_pair_with_orphan_return() {
        let listener = Arc::new(RecordingListener::default());
        let mut visitor =
            visitor_with_unwinds(listener.clone(), vec![vec![0x4000, 0x5000]]);
        let f = function(0x4000);

        visitor.visit(entry(&f, 5, 100));
        visitor.visit(ret(&f, 5, 150));
        visitor.visit(ret(&f, 5, 160));

        let callstacks = listener.callstacks();
        assert_eq!(callstacks.len(), 2);

        assert_eq!(callstacks[0].tid, 5);
        assert_eq!(callstacks[0].begin_timestamp_ns, 100);
        assert_eq!(callstacks[0].end_timestamp_ns, 150);
        assert_eq!(callstacks[0].frames, vec![0x4000, 0x5000]);
        assert!(!callstacks[0].degraded);

        assert_eq!(callstacks[1].begin_timestamp_ns, 160);
        assert_eq!(callstacks[1].end_timestamp_ns, 160);
        assert_eq!(callstacks[1].frames, vec![0x4000]);
        assert!(callstacks[1].degraded);
    }

    #[test]
    fn test_nested_calls_pop_innermost_first() {
        let listener = Arc::new(RecordingListener::default());
        let mut visitor = visitor_with_unwinds(listener.clone(), vec![]);
        let outer = function(0xa000);
        let inner = function(0xb000);

        visitor.visit(entry(&outer, 7, 10));
        visitor.visit(entry(&inner, 7, 20));
        visitor.visit(ret(&inner, 7, 30));
        visitor.visit(ret(&outer, 7, 40));

        let callstacks = listener.callstacks();
        assert_eq!(callstacks.len(), 2);
        assert_eq!(callstacks[0].frames, vec![0xb000]);
        assert_eq!(callstacks[0].begin_timestamp_ns, 20);
        assert_eq!(callstacks[0].end_timestamp_ns, 30);
        assert_eq!(callstacks[1].frames, vec![0xa000]);
        assert_eq!(callstacks[1].begin_timestamp_ns, 10);
        assert_eq!(callstacks[1].end_timestamp_ns, 40);
        assert!(!callstacks[0].degraded);
        assert!(!callstacks[1].degraded);
    }

    #[test]
    fn test_nested_entry_joins_outer_frames() {
        // Thread: main -> 0xaa -> F(0x4000) -> 0xcc -> G(0xb000). The
        // capture at G's entry stops at F's hijacked return slot; F's
        // stored path supplies the frames beyond it.
        let listener = Arc::new(RecordingListener::default());
        let mut visitor = visitor_with_unwinds(
            listener.clone(),
            vec![vec![0x4000, 0xaa, 0xbb], vec![0xb000, 0xcc, 0x4000]],
        );
        let f = function(0x4000);
        let g = function(0xb000);

        visitor.visit(entry(&f, 7, 10));
        visitor.visit(entry(&g, 7, 20));
        visitor.visit(ret(&g, 7, 30));
        visitor.visit(ret(&f, 7, 40));

        let callstacks = listener.callstacks();
        assert_eq!(callstacks.len(), 2);
        assert_eq!(
            callstacks[0].frames,
            vec![0xb000, 0xcc, 0x4000, 0xaa, 0xbb]
        );
        assert_eq!(callstacks[1].frames, vec![0x4000, 0xaa, 0xbb]);
    }

    #[test]
    fn test_sample_joins_outer_frames_beyond_hijack() {
        // A sample at 0xdd inside G unwinds only to G's frame; the rest
        // of the path comes from the stored entry callstacks.
        let listener = Arc::new(RecordingListener::default());
        let mut visitor = visitor_with_unwinds(
            listener.clone(),
            vec![
                vec![0x4000, 0xaa, 0xbb],
                vec![0xb000, 0xcc, 0x4000],
                vec![0xdd, 0xb000],
            ],
        );
        let f = function(0x4000);
        let g = function(0xb000);

        visitor.visit(entry(&f, 7, 100));
        visitor.visit(entry(&g, 7, 110));
        visitor.visit(sample(7, 120));

        let callstacks = listener.callstacks();
        assert_eq!(callstacks.len(), 1);
        assert_eq!(
            callstacks[0].frames,
            vec![0xdd, 0xb000, 0xcc, 0x4000, 0xaa, 0xbb]
        );
        assert_eq!(callstacks[0].begin_timestamp_ns, 120);
        assert_eq!(callstacks[0].end_timestamp_ns, 120);
    }

    #[test]
    fn test_threads_do_not_share_call_stacks() {
        let listener = Arc::new(RecordingListener::default());
        let mut visitor = visitor_with_unwinds(listener.clone(), vec![]);
        let f = function(0x4000);

        visitor.visit(entry(&f, 1, 10));
        visitor.visit(ret(&f, 2, 20));

        let callstacks = listener.callstacks();
        assert_eq!(callstacks.len(), 1);
        assert_eq!(callstacks[0].tid, 2);
        assert!(callstacks[0].degraded);
    }

    #[test]
    fn test_sample_inside_call_resolves_innermost_function() {
        let listener = Arc::new(RecordingListener::default());
        let mut visitor =
            visitor_with_unwinds(listener.clone(), vec![vec![], vec![0x9999]]);
        let f = function(0x4000);

        visitor.visit(entry(&f, 5, 100));
        visitor.visit(sample(5, 120));

        let callstacks = listener.callstacks();
        assert_eq!(callstacks.len(), 1);
        assert_eq!(callstacks[0].frames, vec![0x4000, 0x9999]);
        assert_eq!(callstacks[0].begin_timestamp_ns, 120);
        assert_eq!(callstacks[0].end_timestamp_ns, 120);
    }

    #[test]
    fn test_sample_outside_any_call_is_plain() {
        let listener = Arc::new(RecordingListener::default());
        let mut visitor = visitor_with_unwinds(listener.clone(), vec![vec![0x1, 0x2]]);

        visitor.visit(sample(5, 100));

        let callstacks = listener.callstacks();
        assert_eq!(callstacks[0].frames, vec![0x1, 0x2]);
        assert!(!callstacks[0].degraded);
    }

    #[test]
    fn test_mismatched_return_function_degrades() {
        let listener = Arc::new(RecordingListener::default());
        let mut visitor = visitor_with_unwinds(listener.clone(), vec![]);

        visitor.visit(entry(&function(0x4000), 5, 100));
        visitor.visit(ret(&function(0x5000), 5, 150));

        let callstacks = listener.callstacks();
        assert_eq!(callstacks.len(), 1);
        assert!(callstacks[0].degraded);
        assert_eq!(callstacks[0].begin_timestamp_ns, 100);
    }

    #[test]
    fn test_maps_refresh_reaches_unwinder() {
        let listener = Arc::new(RecordingListener::default());
        let maps_updates = Arc::new(Mutex::new(Vec::new()));
        let unwinder = FakeUnwinder {
            maps_updates: maps_updates.clone(),
            ..FakeUnwinder::default()
        };
        let mut visitor = UprobesVisitor::new(listener, Box::new(unwinder), "initial");

        visitor.visit(DeferredEvent::MapsRefresh {
            timestamp_ns: 50,
            maps: "refreshed".to_string(),
        });

        let updates = maps_updates.lock().unwrap();
        assert_eq!(updates.as_slice(), ["initial", "refreshed"]);
    }
}
