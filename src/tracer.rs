//! The tracer engine: opens the perf event source fleet for a traced
//! process, polls the ring buffers in a bounded round-robin, dispatches
//! records, and hands deferred events to the background worker that feeds
//! the timestamp-ordered correlator.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::mem;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, warn};

use crate::event_processor::{DeferredEvent, PerfEventProcessor};
use crate::gpu::GpuTracepointProcessor;
use crate::listener::{ContextSwitchIn, ContextSwitchOut, TracerListener};
use crate::perf;
use crate::process;
use crate::records::{
    ContextSwitchCpuWideRecord, ContextSwitchRecord, EmptySampleRecord, ForkExitRecord,
    LostRecord, PerfEventHeader, StackSampleRecord, EMPTY_SAMPLE_RECORD_SIZE, PERF_RECORD_EXIT,
    PERF_RECORD_FORK, PERF_RECORD_LOST, PERF_RECORD_MMAP, PERF_RECORD_SAMPLE, PERF_RECORD_SWITCH,
    PERF_RECORD_SWITCH_CPU_WIDE, RECORD_PID_OFFSET,
};
use crate::ring_buffer::PerfEventRingBuffer;
use crate::stats::TracerStats;
use crate::unwinding::{UprobesVisitor, Unwinder};

// Ring buffer sizes per source kind, in KB (powers of two). Sampling and
// probe records carry a stack block each, so those buffers are the large
// ones.
const CONTEXT_SWITCHES_RING_BUFFER_SIZE_KB: u32 = 256;
const MMAP_TASK_RING_BUFFER_SIZE_KB: u32 = 64;
const SAMPLING_RING_BUFFER_SIZE_KB: u32 = 16 * 1024;
const UPROBES_RING_BUFFER_SIZE_KB: u32 = 8 * 1024;
const GPU_TRACING_RING_BUFFER_SIZE_KB: u32 = 256;

/// Records consumed from one ring buffer before moving to the next, so a
/// hot buffer cannot starve the others.
const ROUND_ROBIN_POLLING_BATCH_SIZE: u32 = 5;

// Short enough that no configured buffer can overflow at expected rates.
const IDLE_TIME_ON_EMPTY_RING_BUFFERS_US: u64 = 1000;
const IDLE_TIME_ON_EMPTY_DEFERRED_EVENTS_US: u64 = 300;

const GPU_TRACEPOINTS: [(&str, &str); 3] = [
    ("amdgpu", "amdgpu_cs_ioctl"),
    ("amdgpu", "amdgpu_sched_run_job"),
    ("dma_fence", "dma_fence_signaled"),
];

/// A function to dynamically instrument with an entry and a return probe.
#[derive(Debug, Clone)]
pub struct InstrumentedFunction {
    pub binary_path: PathBuf,
    pub file_offset: u64,
    pub virtual_address: u64,
}

/// Runtime options for one trace.
#[derive(Debug)]
pub struct TracerConfig {
    /// Process to trace.
    pub pid: u32,
    /// Period of the stack sampling sources, in nanoseconds.
    pub sampling_period_ns: u64,
    /// Record context switches on every CPU, system-wide.
    pub trace_context_switches: bool,
    /// Sample call stacks of the traced process periodically.
    pub trace_callstacks: bool,
    /// Instrument the functions in `instrumented_functions`.
    pub trace_instrumented_functions: bool,
    /// Record AMD GPU driver tracepoints system-wide.
    pub trace_gpu_driver_events: bool,
    pub instrumented_functions: Vec<InstrumentedFunction>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            pid: 0,
            sampling_period_ns: 1_000_000,
            trace_context_switches: true,
            trace_callstacks: true,
            trace_instrumented_functions: true,
            trace_gpu_driver_events: false,
            instrumented_functions: Vec::new(),
        }
    }
}

/// Handle to a running trace. The engine runs on two internal threads:
/// the dispatcher that drains ring buffers, and the deferred worker that
/// feeds the correlator.
pub struct Tracer {
    exit_requested: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Tracer {
    /// Open the event sources described by `config` and start tracing.
    /// Individual source failures are reported and skipped; only failing
    /// to spawn the engine threads is fatal.
    pub fn start(
        config: TracerConfig,
        listener: Arc<dyn TracerListener>,
        unwinder: Box<dyn Unwinder>,
    ) -> Result<Tracer> {
        let exit_requested = Arc::new(AtomicBool::new(false));
        let thread_exit = exit_requested.clone();
        let thread = thread::Builder::new()
            .name("tracer".to_string())
            .spawn(move || {
                let mut tracer_thread = TracerThread::new(config, listener, unwinder);
                tracer_thread.run(&thread_exit);
            })
            .context("failed to spawn tracer thread")?;
        Ok(Tracer {
            exit_requested,
            thread: Some(thread),
        })
    }

    /// Ask the engine to stop. Returns immediately; in-flight records are
    /// still drained and correlated before the engine shuts down.
    pub fn request_stop(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    /// Stop and wait for the engine to finish its shutdown sequence. No
    /// listener call happens after this returns.
    pub fn stop(mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct TracerThread {
    pid: u32,
    sampling_period_ns: u64,
    trace_context_switches: bool,
    trace_callstacks: bool,
    trace_instrumented_functions: bool,
    trace_gpu_driver_events: bool,
    instrumented_functions: Vec<Arc<InstrumentedFunction>>,

    listener: Arc<dyn TracerListener>,
    unwinder: Option<Box<dyn Unwinder>>,

    /// Every fd the engine owns, committed at open time. Shutdown
    /// disables and closes exactly this set; ring buffers never close
    /// their fd so redirected fds cannot be double-closed.
    tracing_fds: Vec<RawFd>,
    ring_buffers: Vec<PerfEventRingBuffer>,
    /// Root fds of the consolidated u(ret)probe ring buffers.
    uprobe_fds: HashSet<RawFd>,
    gpu_tracing_fds: HashSet<RawFd>,
    uprobe_ids_to_function: HashMap<u64, Arc<InstrumentedFunction>>,

    deferred_events: Arc<Mutex<Vec<(RawFd, DeferredEvent)>>>,
    stop_deferred_thread: Arc<AtomicBool>,

    gpu_event_processor: Option<GpuTracepointProcessor>,
    stats: TracerStats,

    perf_event_open_errors: bool,
    uprobes_event_open_errors: bool,
}

impl TracerThread {
    fn new(
        config: TracerConfig,
        listener: Arc<dyn TracerListener>,
        unwinder: Box<dyn Unwinder>,
    ) -> Self {
        TracerThread {
            pid: config.pid,
            sampling_period_ns: config.sampling_period_ns,
            trace_context_switches: config.trace_context_switches,
            trace_callstacks: config.trace_callstacks,
            trace_instrumented_functions: config.trace_instrumented_functions,
            trace_gpu_driver_events: config.trace_gpu_driver_events,
            instrumented_functions: config
                .instrumented_functions
                .into_iter()
                .map(Arc::new)
                .collect(),
            listener,
            unwinder: Some(unwinder),
            tracing_fds: Vec::new(),
            ring_buffers: Vec::new(),
            uprobe_fds: HashSet::new(),
            gpu_tracing_fds: HashSet::new(),
            uprobe_ids_to_function: HashMap::new(),
            deferred_events: Arc::new(Mutex::new(Vec::new())),
            stop_deferred_thread: Arc::new(AtomicBool::new(false)),
            gpu_event_processor: None,
            stats: TracerStats::default(),
            perf_event_open_errors: false,
            uprobes_event_open_errors: false,
        }
    }

    fn run(&mut self, exit_requested: &AtomicBool) {
        self.reset();

        // perf_event_open refers to cores as "CPUs". Context switches and
        // GPU tracepoints are recorded on every core; everything bound to
        // the traced process only needs the cores its cpuset allows.
        let all_cpus: Vec<i32> = (0..process::num_cpus() as i32).collect();
        let cpuset_cpus = match process::cpuset_cpus(self.pid) {
            Ok(cpus) if !cpus.is_empty() => cpus,
            Ok(_) => {
                error!("empty cpuset for pid {}, using all CPUs", self.pid);
                all_cpus.clone()
            }
            Err(e) => {
                error!("could not read cpuset: {e:#}, using all CPUs");
                all_cpus.clone()
            }
        };

        if self.trace_context_switches {
            self.open_context_switch_sources(&all_cpus);
        }
        self.open_mmap_task_sources(&cpuset_cpus);
        if self.trace_callstacks {
            self.open_sampling_sources(&cpuset_cpus);
        }
        if self.trace_instrumented_functions {
            self.open_uprobe_sources(&cpuset_cpus);
        }
        if self.trace_gpu_driver_events {
            if self.open_gpu_tracepoints(&all_cpus) {
                self.init_gpu_event_processor();
            } else {
                warn!("there were errors opening GPU tracepoint events");
            }
        }

        if self.uprobes_event_open_errors {
            warn!(
                "there were errors with perf_event_open, including for uprobes: \
                 did you forget to run as root?"
            );
        } else if self.perf_event_open_errors {
            warn!(
                "there were errors with perf_event_open: did you forget to run as root \
                 or to set /proc/sys/kernel/perf_event_paranoid to -1?"
            );
        }

        // Start recording. Return probes were committed before their entry
        // probes, so a return can never fire into an unprepared slot.
        for &fd in &self.tracing_fds {
            if let Err(e) = perf::perf_event_enable(fd) {
                warn!("failed to enable perf event fd {fd}: {e}");
            }
        }

        // Bring the listener up to date with the threads that already
        // exist; fork records cover everything from here on.
        match process::list_threads(self.pid) {
            Ok(tids) => {
                for tid in tids {
                    self.listener.on_tid(tid);
                }
            }
            Err(e) => warn!("failed to enumerate threads of pid {}: {e:#}", self.pid),
        }

        self.stats.reset(process::monotonic_timestamp_ns());

        let initial_maps = process::read_maps(self.pid).unwrap_or_else(|e| {
            warn!("failed to read maps of pid {}: {e:#}", self.pid);
            String::new()
        });
        let Some(unwinder) = self.unwinder.take() else {
            error!("tracer was started without an unwinder");
            return;
        };
        let visitor = UprobesVisitor::new(self.listener.clone(), unwinder, &initial_maps);
        let processor = PerfEventProcessor::new(visitor);

        let deferred_events = self.deferred_events.clone();
        let stop_deferred = self.stop_deferred_thread.clone();
        let deferred_thread = match thread::Builder::new()
            .name("deferred_events".to_string())
            .spawn(move || process_deferred_events(processor, deferred_events, stop_deferred))
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to spawn deferred events thread: {e}");
                for &fd in &self.tracing_fds {
                    let _ = perf::perf_event_disable(fd);
                }
                self.ring_buffers.clear();
                self.close_tracing_fds();
                return;
            }
        };

        let mut ring_buffers = mem::take(&mut self.ring_buffers);
        let mut last_iteration_saw_events = false;
        while !exit_requested.load(Ordering::Acquire) {
            if !last_iteration_saw_events {
                self.stats
                    .print_if_window_elapsed(process::monotonic_timestamp_ns());
                // Sleep rather than spin when every buffer is drained.
                thread::sleep(Duration::from_micros(IDLE_TIME_ON_EMPTY_RING_BUFFERS_US));
            }
            last_iteration_saw_events = self.poll_ring_buffers(&mut ring_buffers, exit_requested);
        }

        // Finish processing all deferred events, then flush the
        // correlator so nothing queued is abandoned.
        self.stop_deferred_thread.store(true, Ordering::Release);
        match deferred_thread.join() {
            Ok(mut processor) => processor.process_all_events(),
            Err(_) => error!("deferred events thread panicked"),
        }

        for &fd in &self.tracing_fds {
            let _ = perf::perf_event_disable(fd);
        }
        // Unmap every ring buffer before closing the fds backing them.
        drop(ring_buffers);
        self.close_tracing_fds();
    }

    fn reset(&mut self) {
        self.tracing_fds.clear();
        self.ring_buffers.clear();
        self.uprobe_fds.clear();
        self.gpu_tracing_fds.clear();
        self.uprobe_ids_to_function.clear();
        self.deferred_events.lock().unwrap().clear();
        self.stop_deferred_thread.store(false, Ordering::Release);
        self.gpu_event_processor = None;
        self.perf_event_open_errors = false;
        self.uprobes_event_open_errors = false;
    }

    fn close_tracing_fds(&mut self) {
        for &fd in &self.tracing_fds {
            unsafe { libc::close(fd) };
        }
        self.tracing_fds.clear();
    }

    /// Open one source and its ring buffer per CPU; a failed CPU is
    /// skipped and reported.
    fn open_per_cpu_sources<F>(&mut self, cpus: &[i32], size_kb: u32, name: &str, open: F)
    where
        F: Fn(i32) -> std::io::Result<RawFd>,
    {
        for &cpu in cpus {
            let fd = match open(cpu) {
                Ok(fd) => fd,
                Err(e) => {
                    debug!("perf_event_open for {name}_{cpu} failed: {e}");
                    self.perf_event_open_errors = true;
                    continue;
                }
            };
            match PerfEventRingBuffer::open(fd, size_kb, format!("{name}_{cpu}")) {
                Ok(ring_buffer) => {
                    self.tracing_fds.push(fd);
                    self.ring_buffers.push(ring_buffer);
                }
                Err(e) => {
                    debug!("mapping ring buffer {name}_{cpu} failed: {e}");
                    self.perf_event_open_errors = true;
                    unsafe { libc::close(fd) };
                }
            }
        }
    }

    fn open_context_switch_sources(&mut self, all_cpus: &[i32]) {
        self.open_per_cpu_sources(
            all_cpus,
            CONTEXT_SWITCHES_RING_BUFFER_SIZE_KB,
            "context_switch",
            |cpu| perf::context_switch_event_open(-1, cpu),
        );
    }

    fn open_mmap_task_sources(&mut self, cpuset_cpus: &[i32]) {
        let pid = self.pid as libc::pid_t;
        self.open_per_cpu_sources(
            cpuset_cpus,
            MMAP_TASK_RING_BUFFER_SIZE_KB,
            "mmap_task",
            |cpu| perf::mmap_task_event_open(pid, cpu),
        );
    }

    fn open_sampling_sources(&mut self, cpuset_cpus: &[i32]) {
        let pid = self.pid as libc::pid_t;
        let period_ns = self.sampling_period_ns;
        self.open_per_cpu_sources(
            cpuset_cpus,
            SAMPLING_RING_BUFFER_SIZE_KB,
            "sampling",
            |cpu| perf::sample_event_open(period_ns, pid, cpu),
        );
    }

    /// Open the entry and return probe pair for every instrumented
    /// function on every cpuset CPU. A function whose probes cannot all
    /// be opened is rolled back and skipped. All u(ret)probes of one CPU
    /// share a single ring buffer: the first entry-probe fd of the CPU
    /// becomes the root, everything else is redirected into it.
    fn open_uprobe_sources(&mut self, cpuset_cpus: &[i32]) {
        let mut ring_buffer_fds_per_cpu: HashMap<i32, RawFd> = HashMap::new();

        for function in self.instrumented_functions.clone() {
            let binary_path = match CString::new(function.binary_path.as_os_str().as_bytes()) {
                Ok(path) => path,
                Err(_) => {
                    error!("binary path contains a NUL byte: {:?}", function.binary_path);
                    self.uprobes_event_open_errors = true;
                    continue;
                }
            };

            let mut uprobe_fds_per_cpu: HashMap<i32, RawFd> = HashMap::new();
            let mut uretprobe_fds_per_cpu: HashMap<i32, RawFd> = HashMap::new();
            let mut open_error = false;

            for &cpu in cpuset_cpus {
                match perf::uprobe_stack_event_open(&binary_path, function.file_offset, -1, cpu)
                {
                    Ok(fd) => {
                        uprobe_fds_per_cpu.insert(cpu, fd);
                    }
                    Err(_) => {
                        open_error = true;
                        break;
                    }
                }
                match perf::uretprobe_event_open(&binary_path, function.file_offset, -1, cpu) {
                    Ok(fd) => {
                        uretprobe_fds_per_cpu.insert(cpu, fd);
                    }
                    Err(_) => {
                        open_error = true;
                        break;
                    }
                }
            }

            if open_error {
                self.perf_event_open_errors = true;
                self.uprobes_event_open_errors = true;
                error!(
                    "opening u(ret)probes for function at {:#016x}",
                    function.virtual_address
                );
                for fd in uprobe_fds_per_cpu.values().chain(uretprobe_fds_per_cpu.values()) {
                    unsafe { libc::close(*fd) };
                }
                continue;
            }

            // Commit the return probes ahead of the entry probes: a
            // return without its entry is tolerated, the opposite is not,
            // so returns must be enabled first.
            for &fd in uretprobe_fds_per_cpu.values() {
                self.tracing_fds.push(fd);
            }
            for &fd in uprobe_fds_per_cpu.values() {
                self.tracing_fds.push(fd);
            }

            // Record the stream id association so samples can be tied
            // back to the function.
            for &fd in uprobe_fds_per_cpu
                .values()
                .chain(uretprobe_fds_per_cpu.values())
            {
                match perf::perf_event_get_id(fd) {
                    Ok(stream_id) => {
                        self.uprobe_ids_to_function
                            .insert(stream_id, function.clone());
                    }
                    Err(e) => warn!("failed to read stream id of fd {fd}: {e}"),
                }
            }

            for &cpu in cpuset_cpus {
                let (Some(&uprobe_fd), Some(&uretprobe_fd)) =
                    (uprobe_fds_per_cpu.get(&cpu), uretprobe_fds_per_cpu.get(&cpu))
                else {
                    continue;
                };
                if let Some(&ring_buffer_fd) = ring_buffer_fds_per_cpu.get(&cpu) {
                    self.redirect(uprobe_fd, ring_buffer_fd);
                    self.redirect(uretprobe_fd, ring_buffer_fd);
                } else {
                    // First successful entry probe of this CPU: allocate
                    // the CPU's ring buffer on it and make it the root.
                    match PerfEventRingBuffer::open(
                        uprobe_fd,
                        UPROBES_RING_BUFFER_SIZE_KB,
                        format!("uprobes_uretprobes_{cpu}"),
                    ) {
                        Ok(ring_buffer) => {
                            self.ring_buffers.push(ring_buffer);
                            ring_buffer_fds_per_cpu.insert(cpu, uprobe_fd);
                            self.uprobe_fds.insert(uprobe_fd);
                            self.redirect(uretprobe_fd, uprobe_fd);
                        }
                        Err(e) => {
                            debug!("mapping uprobes ring buffer for cpu {cpu} failed: {e}");
                            self.perf_event_open_errors = true;
                        }
                    }
                }
            }
        }
    }

    fn redirect(&mut self, fd: RawFd, ring_buffer_fd: RawFd) {
        if let Err(e) = perf::perf_event_redirect(fd, ring_buffer_fd) {
            warn!("failed to redirect fd {fd} into ring buffer fd {ring_buffer_fd}: {e}");
            self.perf_event_open_errors = true;
        }
    }

    /// Open the three GPU tracepoints on every CPU. All or nothing: a
    /// single failure rolls back every GPU fd opened so far and disables
    /// GPU tracing for the run.
    fn open_gpu_tracepoints(&mut self, all_cpus: &[i32]) -> bool {
        let mut gpu_fds: Vec<RawFd> = Vec::new();
        let mut ring_buffers: Vec<PerfEventRingBuffer> = Vec::new();

        for &cpu in all_cpus {
            for (category, name) in GPU_TRACEPOINTS {
                let fd = match perf::tracepoint_event_open(category, name, -1, cpu) {
                    Ok(fd) => fd,
                    Err(e) => {
                        debug!("opening tracepoint {category}:{name} on cpu {cpu} failed: {e}");
                        close_file_descriptors(&gpu_fds);
                        return false;
                    }
                };
                gpu_fds.push(fd);

                match PerfEventRingBuffer::open(
                    fd,
                    GPU_TRACING_RING_BUFFER_SIZE_KB,
                    format!("{category}:{name}_{cpu}"),
                ) {
                    Ok(ring_buffer) => ring_buffers.push(ring_buffer),
                    Err(e) => {
                        debug!("mapping ring buffer for {category}:{name}_{cpu} failed: {e}");
                        drop(ring_buffers);
                        close_file_descriptors(&gpu_fds);
                        return false;
                    }
                }
            }
        }

        // Every tracepoint opened; commit the fds and ring buffers.
        for fd in gpu_fds {
            self.gpu_tracing_fds.insert(fd);
            self.tracing_fds.push(fd);
        }
        self.ring_buffers.extend(ring_buffers);
        true
    }

    fn init_gpu_event_processor(&mut self) {
        let ids: Vec<u64> = GPU_TRACEPOINTS
            .iter()
            .filter_map(|(category, name)| perf::get_tracepoint_id(category, name).ok())
            .collect();
        match ids.as_slice() {
            &[cs_ioctl, sched_run_job, fence_signaled] => {
                self.gpu_event_processor = Some(GpuTracepointProcessor::new(
                    self.listener.clone(),
                    cs_ioctl,
                    sched_run_job,
                    fence_signaled,
                ));
            }
            _ => error!("failed to initialize GPU tracepoint event processor"),
        }
    }

    /// One round-robin pass over every ring buffer, consuming at most
    /// [`ROUND_ROBIN_POLLING_BATCH_SIZE`] records per buffer. Returns
    /// whether any record was seen.
    fn poll_ring_buffers(
        &mut self,
        ring_buffers: &mut [PerfEventRingBuffer],
        exit_requested: &AtomicBool,
    ) -> bool {
        let mut saw_events = false;
        for ring_buffer in ring_buffers.iter_mut() {
            if exit_requested.load(Ordering::Acquire) {
                break;
            }
            for _ in 0..ROUND_ROBIN_POLLING_BATCH_SIZE {
                if exit_requested.load(Ordering::Acquire) {
                    break;
                }
                if !ring_buffer.has_data() {
                    break;
                }
                saw_events = true;

                let mut header = PerfEventHeader::default();
                ring_buffer.read_header(&mut header);
                match header.type_ {
                    PERF_RECORD_SWITCH => {
                        // Only CPU-wide sources are opened, so this record
                        // should not exist; decode it anyway.
                        error!(
                            "unexpected PERF_RECORD_SWITCH (only \
                             PERF_RECORD_SWITCH_CPU_WIDE are expected)"
                        );
                        self.process_context_switch_event(&header, ring_buffer);
                    }
                    PERF_RECORD_SWITCH_CPU_WIDE => {
                        self.process_context_switch_cpu_wide_event(&header, ring_buffer);
                    }
                    PERF_RECORD_FORK => self.process_fork_event(&header, ring_buffer),
                    PERF_RECORD_EXIT => self.process_exit_event(&header, ring_buffer),
                    PERF_RECORD_MMAP => self.process_mmap_event(&header, ring_buffer),
                    PERF_RECORD_SAMPLE => self.process_sample_event(&header, ring_buffer),
                    PERF_RECORD_LOST => self.process_lost_event(&header, ring_buffer),
                    unknown => {
                        error!("unexpected perf_event_header type: {unknown}");
                        ring_buffer.skip_record(&header);
                    }
                }
            }
        }
        saw_events
    }

    fn process_context_switch_event(
        &mut self,
        header: &PerfEventHeader,
        ring_buffer: &mut PerfEventRingBuffer,
    ) {
        let record: Box<ContextSwitchRecord> = ring_buffer.consume_record(header);
        let tid = record.sample_id.tid;
        let cpu = record.sample_id.cpu;
        let timestamp_ns = record.sample_id.time;

        if record.is_switch_out() {
            self.listener.on_context_switch_out(ContextSwitchOut {
                tid,
                cpu,
                timestamp_ns,
            });
        } else {
            self.listener.on_context_switch_in(ContextSwitchIn {
                tid,
                cpu,
                timestamp_ns,
            });
        }
        self.stats.sched_switch_count += 1;
    }

    fn process_context_switch_cpu_wide_event(
        &mut self,
        header: &PerfEventHeader,
        ring_buffer: &mut PerfEventRingBuffer,
    ) {
        let record: Box<ContextSwitchCpuWideRecord> = ring_buffer.consume_record(header);
        let tid = record.sample_id.tid;
        let cpu = record.sample_id.cpu;
        let timestamp_ns = record.sample_id.time;

        // Switches with pid/tid 0 are the idle task, discard them.
        if tid != 0 {
            if record.is_switch_out() {
                self.listener.on_context_switch_out(ContextSwitchOut {
                    tid,
                    cpu,
                    timestamp_ns,
                });
            } else {
                self.listener.on_context_switch_in(ContextSwitchIn {
                    tid,
                    cpu,
                    timestamp_ns,
                });
            }
        }
        self.stats.sched_switch_count += 1;
    }

    fn process_fork_event(
        &mut self,
        header: &PerfEventHeader,
        ring_buffer: &mut PerfEventRingBuffer,
    ) {
        let record: Box<ForkExitRecord> = ring_buffer.consume_record(header);
        if record.pid != self.pid {
            return;
        }
        // A new thread of the traced process was spawned.
        self.listener.on_tid(record.tid);
    }

    fn process_exit_event(
        &mut self,
        header: &PerfEventHeader,
        ring_buffer: &mut PerfEventRingBuffer,
    ) {
        let record: Box<ForkExitRecord> = ring_buffer.consume_record(header);
        if record.pid != self.pid {
            return;
        }
        // Nothing to do; thread exit is not currently reported.
    }

    fn process_mmap_event(
        &mut self,
        header: &PerfEventHeader,
        ring_buffer: &mut PerfEventRingBuffer,
    ) {
        let pid = ring_buffer.peek_u32(RECORD_PID_OFFSET);
        ring_buffer.skip_record(header);

        if pid != self.pid {
            return;
        }

        // The traced process mapped executable memory; hand the unwinder
        // a fresh maps snapshot. This should happen rarely.
        match process::read_maps(self.pid) {
            Ok(maps) => self.defer_event(
                ring_buffer.fd(),
                DeferredEvent::MapsRefresh {
                    timestamp_ns: process::monotonic_timestamp_ns(),
                    maps,
                },
            ),
            Err(e) => warn!("failed to refresh maps of pid {}: {e:#}", self.pid),
        }
    }

    fn process_sample_event(
        &mut self,
        header: &PerfEventHeader,
        ring_buffer: &mut PerfEventRingBuffer,
    ) {
        let fd = ring_buffer.fd();
        let is_probe = self.uprobe_fds.contains(&fd);
        let is_gpu_event = self.gpu_tracing_fds.contains(&fd);

        // An event can never be a probe and a GPU event.
        assert!(!(is_probe && is_gpu_event));

        let is_uretprobe = is_probe && header.size as usize == EMPTY_SAMPLE_RECORD_SIZE;
        let is_uprobe = is_probe && !is_uretprobe;

        // Keep only records of the traced process, except GPU tracepoints
        // where system-wide visibility is the point.
        let pid = ring_buffer.peek_u32(RECORD_PID_OFFSET);
        if pid != self.pid && !is_gpu_event {
            ring_buffer.skip_record(header);
            return;
        }

        if is_uprobe {
            let record: Box<StackSampleRecord> = ring_buffer.consume_record(header);
            let Some(function) = self
                .uprobe_ids_to_function
                .get(&record.sample_id.stream_id)
            else {
                debug!(
                    "uprobe sample with unknown stream id {}",
                    record.sample_id.stream_id
                );
                return;
            };
            let function = function.clone();
            self.defer_event(fd, DeferredEvent::UprobeEntry { function, record });
            self.stats.uprobes_count += 1;
        } else if is_uretprobe {
            let record: Box<EmptySampleRecord> = ring_buffer.consume_record(header);
            let Some(function) = self
                .uprobe_ids_to_function
                .get(&record.sample_id.stream_id)
            else {
                debug!(
                    "uretprobe sample with unknown stream id {}",
                    record.sample_id.stream_id
                );
                return;
            };
            let function = function.clone();
            self.defer_event(fd, DeferredEvent::UretprobeReturn { function, record });
            self.stats.uprobes_count += 1;
        } else if is_gpu_event {
            let raw = ring_buffer.consume_raw(header);
            if let Some(processor) = self.gpu_event_processor.as_mut() {
                processor.push_event(&raw);
            }
            self.stats.gpu_events_count += 1;
        } else {
            let record: Box<StackSampleRecord> = ring_buffer.consume_record(header);
            self.defer_event(fd, DeferredEvent::StackSample(record));
            self.stats.sample_count += 1;
        }
    }

    fn process_lost_event(
        &mut self,
        header: &PerfEventHeader,
        ring_buffer: &mut PerfEventRingBuffer,
    ) {
        let record: Box<LostRecord> = ring_buffer.consume_record(header);
        self.stats.record_lost(ring_buffer.name(), record.lost);
    }

    fn defer_event(&self, origin_fd: RawFd, event: DeferredEvent) {
        self.deferred_events.lock().unwrap().push((origin_fd, event));
    }
}

fn close_file_descriptors(fds: &[RawFd]) {
    for &fd in fds {
        unsafe { libc::close(fd) };
    }
}

/// The deferred worker: repeatedly swap out the queued batch and feed it
/// to the correlator, emitting everything old enough to be globally
/// ordered. Once the stop flag is set one final drain runs, so no queued
/// event is abandoned.
fn process_deferred_events(
    mut processor: PerfEventProcessor<UprobesVisitor>,
    deferred_events: Arc<Mutex<Vec<(RawFd, DeferredEvent)>>>,
    stop: Arc<AtomicBool>,
) -> PerfEventProcessor<UprobesVisitor> {
    let mut should_exit = false;
    while !should_exit {
        // Read the flag before consuming: by the time it is set the
        // dispatcher has stopped producing, so this iteration sees
        // everything that will ever be queued.
        should_exit = stop.load(Ordering::Acquire);
        let events = mem::take(&mut *deferred_events.lock().unwrap());
        if events.is_empty() {
            if !should_exit {
                thread::sleep(Duration::from_micros(IDLE_TIME_ON_EMPTY_DEFERRED_EVENTS_US));
            }
        } else {
            for (origin_fd, event) in events {
                processor.add_event(origin_fd, event);
            }
            processor.process_old_events();
        }
    }
    processor
}
