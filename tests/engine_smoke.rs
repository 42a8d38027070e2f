//! End-to-end smoke tests against the real perf_event subsystem.
//!
//! These open actual kernel event sources and therefore require root (or
//! perf_event_paranoid = -1); they are `#[ignore]`d by default.
//!
//! To run them:
//! ```
//! sudo cargo test --test engine_smoke -- --ignored
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use perfmux::records::SampleRegsUser;
use perfmux::{
    CallstackEvent, ContextSwitchIn, ContextSwitchOut, GpuJob, Tracer, TracerConfig,
    TracerListener, Unwinder,
};

#[derive(Default)]
struct CountingListener {
    tids: AtomicUsize,
    switches: AtomicUsize,
    callstacks: AtomicUsize,
}

impl TracerListener for CountingListener {
    fn on_tid(&self, _tid: u32) {
        self.tids.fetch_add(1, Ordering::Relaxed);
    }
    fn on_context_switch_in(&self, _context_switch: ContextSwitchIn) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }
    fn on_context_switch_out(&self, _context_switch: ContextSwitchOut) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }
    fn on_callstack(&self, _callstack: CallstackEvent) {
        self.callstacks.fetch_add(1, Ordering::Relaxed);
    }
    fn on_gpu_job(&self, _job: GpuJob) {}
}

struct NopUnwinder;

impl Unwinder for NopUnwinder {
    fn update_maps(&mut self, _maps: &str) {}
    fn unwind(&mut self, regs: &SampleRegsUser, _stack: &[u8]) -> Vec<u64> {
        // Degenerate call path: just the sampled instruction pointer slot.
        vec![regs.regs.get(8).copied().unwrap_or(0)]
    }
}

fn burn_cpu(duration: Duration) {
    let start = std::time::Instant::now();
    let mut x = 0u64;
    while start.elapsed() < duration {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
    }
    std::hint::black_box(x);
}

#[test]
#[ignore] // Requires root or perf_event_paranoid = -1.
fn test_trace_own_process_delivers_events() {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = Arc::new(CountingListener::default());
    let config = TracerConfig {
        pid: std::process::id(),
        sampling_period_ns: 1_000_000,
        trace_context_switches: true,
        trace_callstacks: true,
        trace_instrumented_functions: false,
        trace_gpu_driver_events: false,
        instrumented_functions: Vec::new(),
    };

    let tracer = Tracer::start(config, listener.clone(), Box::new(NopUnwinder))
        .expect("failed to start tracer");

    burn_cpu(Duration::from_millis(500));
    thread::sleep(Duration::from_millis(200));
    tracer.stop();

    // At least our own threads were announced, and sampling our busy loop
    // must have produced callstacks.
    assert!(listener.tids.load(Ordering::Relaxed) >= 1);
    assert!(listener.callstacks.load(Ordering::Relaxed) >= 1);
    assert!(listener.switches.load(Ordering::Relaxed) >= 1);
}

#[test]
#[ignore] // Requires root or perf_event_paranoid = -1.
fn test_stop_is_idempotent_under_drop() {
    let listener = Arc::new(CountingListener::default());
    let config = TracerConfig {
        pid: std::process::id(),
        trace_callstacks: false,
        trace_instrumented_functions: false,
        ..TracerConfig::default()
    };

    let tracer = Tracer::start(config, listener, Box::new(NopUnwinder))
        .expect("failed to start tracer");
    tracer.request_stop();
    // Dropping after an explicit stop request must join cleanly.
    drop(tracer);
}
