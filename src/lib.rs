//! perfmux - a Linux profiling backend over the kernel's perf_event
//! subsystem.
//!
//! The engine opens a fleet of perf event sources for one traced process
//! (context switches, periodic stack samples, mmap/task notifications,
//! dynamic u(ret)probes on instrumented functions, and AMD GPU driver
//! tracepoints), polls their memory-mapped ring buffers in a bounded
//! round-robin, and delivers a normalized event stream to a
//! [`TracerListener`].
//!
//! Stack samples and probe records are decoded on a background worker so
//! that per-thread call-path unwinding and probe correlation happen in
//! global timestamp order; GPU tracepoints are joined into jobs as they
//! arrive.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use perfmux::{Tracer, TracerConfig};
//!
//! # struct HostListener;
//! # impl perfmux::TracerListener for HostListener {
//! #     fn on_tid(&self, _: u32) {}
//! #     fn on_context_switch_in(&self, _: perfmux::ContextSwitchIn) {}
//! #     fn on_context_switch_out(&self, _: perfmux::ContextSwitchOut) {}
//! #     fn on_callstack(&self, _: perfmux::CallstackEvent) {}
//! #     fn on_gpu_job(&self, _: perfmux::GpuJob) {}
//! # }
//! # struct HostUnwinder;
//! # impl perfmux::Unwinder for HostUnwinder {
//! #     fn update_maps(&mut self, _: &str) {}
//! #     fn unwind(&mut self, _: &perfmux::records::SampleRegsUser, _: &[u8]) -> Vec<u64> {
//! #         Vec::new()
//! #     }
//! # }
//! let config = TracerConfig {
//!     pid: 12345,
//!     ..TracerConfig::default()
//! };
//! let tracer = Tracer::start(config, Arc::new(HostListener), Box::new(HostUnwinder))
//!     .expect("failed to start tracer");
//! // ... profile ...
//! tracer.stop();
//! ```

pub mod event_processor;
pub mod gpu;
pub mod listener;
pub mod perf;
pub mod process;
pub mod records;
pub mod ring_buffer;
pub mod stats;
pub mod tracer;
pub mod unwinding;

// Re-export the public surface.
pub use listener::{CallstackEvent, ContextSwitchIn, ContextSwitchOut, GpuJob, TracerListener};
pub use tracer::{InstrumentedFunction, Tracer, TracerConfig};
pub use unwinding::Unwinder;
