//! The capability through which the engine delivers events.

/// A thread switched onto a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitchIn {
    pub tid: u32,
    pub cpu: u32,
    pub timestamp_ns: u64,
}

/// A thread switched off a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitchOut {
    pub tid: u32,
    pub cpu: u32,
    pub timestamp_ns: u64,
}

/// An unwound call path, innermost frame first. Produced for periodic
/// stack samples (where the two timestamps coincide) and for completed
/// instrumented-function calls (where they span entry to return).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallstackEvent {
    pub tid: u32,
    pub begin_timestamp_ns: u64,
    pub end_timestamp_ns: u64,
    pub frames: Vec<u64>,
    /// Set when the call path could not be fully reconstructed, e.g. a
    /// return probe with no matching entry.
    pub degraded: bool,
}

/// One GPU job, joined from the submit, schedule and fence-signal driver
/// tracepoints sharing the same (timeline, context, seqno).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuJob {
    pub pid: u32,
    pub tid: u32,
    pub context: u32,
    pub seqno: u32,
    pub timeline: String,
    pub submit_timestamp_ns: u64,
    pub schedule_timestamp_ns: u64,
    pub finish_timestamp_ns: u64,
}

/// Receives the normalized event stream. Implementations are called from
/// both engine threads and must tolerate concurrent calls.
pub trait TracerListener: Send + Sync {
    /// A thread of the traced process exists or was spawned.
    fn on_tid(&self, tid: u32);
    fn on_context_switch_in(&self, context_switch: ContextSwitchIn);
    fn on_context_switch_out(&self, context_switch: ContextSwitchOut);
    fn on_callstack(&self, callstack: CallstackEvent);
    fn on_gpu_job(&self, job: GpuJob);
}
