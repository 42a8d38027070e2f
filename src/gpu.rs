//! Correlation of GPU driver tracepoints into jobs.
//!
//! A single job execution produces three events that share the same
//! timeline, context and seqno:
//! - amdgpu:amdgpu_cs_ioctl when the application submits a command buffer,
//! - amdgpu:amdgpu_sched_run_job when it is scheduled onto the hardware,
//! - dma_fence:dma_fence_signaled when the hardware finishes it.
//!
//! Tracepoints are recorded system-wide, so all three phases are observed
//! even when they fire on different CPUs or in other processes' contexts.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::listener::{GpuJob, TracerListener};
use crate::records::{
    data_loc_str, AmdgpuSchedJobBody, DmaFenceSignaledBody, SampleId, TracepointCommon,
    RAW_SAMPLE_DATA_OFFSET,
};

/// Partial jobs not touched for this long are dropped; a missing phase
/// (from record loss) must not pin its key forever.
const DISCARD_HORIZON_NS: u64 = 10_000_000_000;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct GpuJobKey {
    timeline: String,
    context: u32,
    seqno: u32,
}

#[derive(Debug, Default)]
struct PartialGpuJob {
    pid: u32,
    tid: u32,
    submit_timestamp_ns: Option<u64>,
    schedule_timestamp_ns: Option<u64>,
    finish_timestamp_ns: Option<u64>,
    last_update_ns: u64,
}

pub struct GpuTracepointProcessor {
    listener: Arc<dyn TracerListener>,
    amdgpu_cs_ioctl_id: u64,
    amdgpu_sched_run_job_id: u64,
    dma_fence_signaled_id: u64,
    pending: HashMap<GpuJobKey, PartialGpuJob>,
    newest_timestamp_ns: u64,
    discard_horizon_ns: u64,
}

impl GpuTracepointProcessor {
    pub fn new(
        listener: Arc<dyn TracerListener>,
        amdgpu_cs_ioctl_id: u64,
        amdgpu_sched_run_job_id: u64,
        dma_fence_signaled_id: u64,
    ) -> Self {
        GpuTracepointProcessor {
            listener,
            amdgpu_cs_ioctl_id,
            amdgpu_sched_run_job_id,
            dma_fence_signaled_id,
            pending: HashMap::new(),
            newest_timestamp_ns: 0,
            discard_horizon_ns: DISCARD_HORIZON_NS,
        }
    }

    /// Feed one raw tracepoint sample, as consumed from a ring buffer.
    pub fn push_event(&mut self, raw: &[u8]) {
        if raw.len() < RAW_SAMPLE_DATA_OFFSET {
            warn!("GPU tracepoint record too short: {} bytes", raw.len());
            return;
        }
        let mut sample_id = SampleId::default();
        plain::copy_from_bytes(&mut sample_id, &raw[8..40]).unwrap();
        let raw_size =
            u32::from_ne_bytes(raw[40..RAW_SAMPLE_DATA_OFFSET].try_into().unwrap()) as usize;
        let Some(body) = raw.get(RAW_SAMPLE_DATA_OFFSET..RAW_SAMPLE_DATA_OFFSET + raw_size)
        else {
            warn!("GPU tracepoint record truncated");
            return;
        };
        if body.len() < std::mem::size_of::<TracepointCommon>() {
            return;
        }
        let tracepoint_id = u16::from_ne_bytes(body[0..2].try_into().unwrap()) as u64;

        if tracepoint_id == self.amdgpu_cs_ioctl_id {
            let Some(key) = parse_sched_job_body(body) else {
                return;
            };
            let partial = self.pending.entry(key.clone()).or_default();
            partial.pid = sample_id.pid;
            partial.tid = sample_id.tid;
            partial.submit_timestamp_ns = Some(sample_id.time);
            partial.last_update_ns = sample_id.time;
            self.complete_if_ready(&key);
        } else if tracepoint_id == self.amdgpu_sched_run_job_id {
            let Some(key) = parse_sched_job_body(body) else {
                return;
            };
            let partial = self.pending.entry(key.clone()).or_default();
            partial.schedule_timestamp_ns = Some(sample_id.time);
            partial.last_update_ns = sample_id.time;
            self.complete_if_ready(&key);
        } else if tracepoint_id == self.dma_fence_signaled_id {
            let mut fence = DmaFenceSignaledBody::default();
            if plain::copy_from_bytes(&mut fence, body).is_err() {
                return;
            }
            let Some(timeline) = data_loc_str(body, fence.timeline) else {
                return;
            };
            let key = GpuJobKey {
                timeline,
                context: fence.context,
                seqno: fence.seqno,
            };
            let partial = self.pending.entry(key.clone()).or_default();
            partial.finish_timestamp_ns = Some(sample_id.time);
            partial.last_update_ns = sample_id.time;
            self.complete_if_ready(&key);
        } else {
            warn!("unexpected tracepoint id in GPU sample: {tracepoint_id}");
            return;
        }

        self.newest_timestamp_ns = self.newest_timestamp_ns.max(sample_id.time);
        self.discard_stale();
    }

    fn complete_if_ready(&mut self, key: &GpuJobKey) {
        let Some(partial) = self.pending.get(key) else {
            return;
        };
        let (Some(submit), Some(schedule), Some(finish)) = (
            partial.submit_timestamp_ns,
            partial.schedule_timestamp_ns,
            partial.finish_timestamp_ns,
        ) else {
            return;
        };
        let job = GpuJob {
            pid: partial.pid,
            tid: partial.tid,
            context: key.context,
            seqno: key.seqno,
            timeline: key.timeline.clone(),
            submit_timestamp_ns: submit,
            schedule_timestamp_ns: schedule,
            finish_timestamp_ns: finish,
        };
        self.pending.remove(key);
        self.listener.on_gpu_job(job);
    }

    fn discard_stale(&mut self) {
        let newest = self.newest_timestamp_ns;
        let horizon = self.discard_horizon_ns;
        self.pending
            .retain(|_, partial| newest.saturating_sub(partial.last_update_ns) <= horizon);
    }
}

fn parse_sched_job_body(body: &[u8]) -> Option<GpuJobKey> {
    let mut parsed = AmdgpuSchedJobBody::default();
    plain::copy_from_bytes(&mut parsed, body).ok()?;
    let timeline = data_loc_str(body, parsed.timeline)?;
    Some(GpuJobKey {
        timeline,
        context: parsed.context,
        seqno: parsed.seqno,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::testing::RecordingListener;
    use crate::records::{PerfEventHeader, PERF_RECORD_SAMPLE};

    const CS_IOCTL_ID: u64 = 1070;
    const SCHED_RUN_JOB_ID: u64 = 1071;
    const FENCE_SIGNALED_ID: u64 = 901;

    fn raw_record(body: &[u8], time: u64, pid: u32, tid: u32) -> Vec<u8> {
        let header = PerfEventHeader {
            type_: PERF_RECORD_SAMPLE,
            misc: 0,
            size: (RAW_SAMPLE_DATA_OFFSET + body.len()) as u16,
        };
        let mut raw = Vec::new();
        raw.extend_from_slice(unsafe { plain::as_bytes(&header) });
        raw.extend_from_slice(&pid.to_ne_bytes());
        raw.extend_from_slice(&tid.to_ne_bytes());
        raw.extend_from_slice(&time.to_ne_bytes());
        raw.extend_from_slice(&0u64.to_ne_bytes()); // stream_id
        raw.extend_from_slice(&0u32.to_ne_bytes()); // cpu
        raw.extend_from_slice(&0u32.to_ne_bytes()); // res
        raw.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        raw.extend_from_slice(body);
        raw
    }

    fn sched_job_body(
        tracepoint_id: u64,
        timeline: &str,
        context: u32,
        seqno: u32,
    ) -> Vec<u8> {
        let string_offset = 28u32;
        let data_loc = (((timeline.len() as i32) + 1) << 16) | string_offset as i32;
        let mut body = Vec::new();
        body.extend_from_slice(&(tracepoint_id as u16).to_ne_bytes());
        body.extend_from_slice(&[0u8; 2]); // common flags, preempt count
        body.extend_from_slice(&0i32.to_ne_bytes()); // common pid
        body.extend_from_slice(&7u64.to_ne_bytes()); // sched_job_id
        body.extend_from_slice(&data_loc.to_ne_bytes());
        body.extend_from_slice(&context.to_ne_bytes());
        body.extend_from_slice(&seqno.to_ne_bytes());
        body.extend_from_slice(timeline.as_bytes());
        body.push(0);
        body
    }

    fn fence_body(timeline: &str, context: u32, seqno: u32) -> Vec<u8> {
        let string_offset = 24u32;
        let data_loc = (((timeline.len() as i32) + 1) << 16) | string_offset as i32;
        let mut body = Vec::new();
        body.extend_from_slice(&(FENCE_SIGNALED_ID as u16).to_ne_bytes());
        body.extend_from_slice(&[0u8; 2]);
        body.extend_from_slice(&0i32.to_ne_bytes());
        body.extend_from_slice(&0i32.to_ne_bytes()); // driver data_loc
        body.extend_from_slice(&data_loc.to_ne_bytes());
        body.extend_from_slice(&context.to_ne_bytes());
        body.extend_from_slice(&seqno.to_ne_bytes());
        body.extend_from_slice(timeline.as_bytes());
        body.push(0);
        body
    }

    fn processor(listener: Arc<RecordingListener>) -> GpuTracepointProcessor {
        GpuTracepointProcessor::new(listener, CS_IOCTL_ID, SCHED_RUN_JOB_ID, FENCE_SIGNALED_ID)
    }

    #[test]
    fn test_three_phases_make_one_job() {
        let listener = Arc::new(RecordingListener::default());
        let mut processor = processor(listener.clone());

        processor.push_event(&raw_record(
            &sched_job_body(CS_IOCTL_ID, "timeline7", 3, 42),
            1000,
            200,
            201,
        ));
        processor.push_event(&raw_record(
            &sched_job_body(SCHED_RUN_JOB_ID, "timeline7", 3, 42),
            1100,
            0,
            0,
        ));
        assert!(listener.gpu_jobs().is_empty());

        processor.push_event(&raw_record(&fence_body("timeline7", 3, 42), 2000, 0, 0));

        let jobs = listener.gpu_jobs();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.timeline, "timeline7");
        assert_eq!(job.context, 3);
        assert_eq!(job.seqno, 42);
        assert_eq!(job.pid, 200);
        assert_eq!(job.tid, 201);
        assert_eq!(job.submit_timestamp_ns, 1000);
        assert_eq!(job.schedule_timestamp_ns, 1100);
        assert_eq!(job.finish_timestamp_ns, 2000);
        assert!(job.submit_timestamp_ns <= job.schedule_timestamp_ns);
        assert!(job.schedule_timestamp_ns <= job.finish_timestamp_ns);
        assert!(processor.pending.is_empty());
    }

    #[test]
    fn test_phase_order_does_not_matter() {
        let listener = Arc::new(RecordingListener::default());
        let mut processor = processor(listener.clone());

        processor.push_event(&raw_record(&fence_body("gfx", 1, 5), 900, 0, 0));
        processor.push_event(&raw_record(
            &sched_job_body(SCHED_RUN_JOB_ID, "gfx", 1, 5),
            800,
            0,
            0,
        ));
        processor.push_event(&raw_record(
            &sched_job_body(CS_IOCTL_ID, "gfx", 1, 5),
            700,
            42,
            43,
        ));

        let jobs = listener.gpu_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].pid, 42);
        assert_eq!(jobs[0].submit_timestamp_ns, 700);
    }

    #[test]
    fn test_distinct_keys_do_not_join() {
        let listener = Arc::new(RecordingListener::default());
        let mut processor = processor(listener.clone());

        processor.push_event(&raw_record(
            &sched_job_body(CS_IOCTL_ID, "gfx", 1, 5),
            100,
            1,
            1,
        ));
        processor.push_event(&raw_record(
            &sched_job_body(SCHED_RUN_JOB_ID, "gfx", 1, 6),
            110,
            0,
            0,
        ));
        processor.push_event(&raw_record(&fence_body("gfx", 2, 5), 120, 0, 0));

        assert!(listener.gpu_jobs().is_empty());
        assert_eq!(processor.pending.len(), 3);
    }

    #[test]
    fn test_stale_partials_are_discarded() {
        let listener = Arc::new(RecordingListener::default());
        let mut processor = processor(listener.clone());

        processor.push_event(&raw_record(
            &sched_job_body(CS_IOCTL_ID, "gfx", 1, 5),
            1_000,
            1,
            1,
        ));
        assert_eq!(processor.pending.len(), 1);

        // An unrelated event far past the horizon evicts the orphan.
        processor.push_event(&raw_record(
            &sched_job_body(CS_IOCTL_ID, "gfx", 9, 9),
            1_000 + DISCARD_HORIZON_NS + 1_000,
            1,
            1,
        ));
        assert_eq!(processor.pending.len(), 1);

        // The evicted job never completes.
        processor.push_event(&raw_record(
            &sched_job_body(SCHED_RUN_JOB_ID, "gfx", 1, 5),
            1_000 + DISCARD_HORIZON_NS + 2_000,
            0,
            0,
        ));
        processor.push_event(&raw_record(
            &fence_body("gfx", 1, 5),
            1_000 + DISCARD_HORIZON_NS + 3_000,
            0,
            0,
        ));
        assert!(listener.gpu_jobs().is_empty());
    }

    #[test]
    fn test_unknown_tracepoint_id_ignored() {
        let listener = Arc::new(RecordingListener::default());
        let mut processor = processor(listener.clone());
        processor.push_event(&raw_record(&sched_job_body(9999, "gfx", 1, 1), 10, 0, 0));
        assert!(processor.pending.is_empty());
        assert!(listener.gpu_jobs().is_empty());
    }
}
