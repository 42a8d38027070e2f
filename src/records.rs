//! Binary layouts of the perf ring-buffer records consumed by the engine.
//!
//! Within a sample, fields appear in `sample_type` bit order. The structs
//! below therefore only match records produced with the exact `sample_type`
//! each opener in [`crate::perf`] requests; they are not general-purpose
//! perf record parsers.

use plain::Plain;

// Record types from enum perf_event_type in linux/perf_event.h.
pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;

pub const PERF_RECORD_MISC_SWITCH_OUT: u16 = 1 << 13;

// sample_type bits.
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

/// x86-64 user registers captured for DWARF unwinding: the sixteen general
/// purpose registers plus IP, FLAGS, CS and SS. Segment base registers are
/// omitted, older kernels reject them in `sample_regs_user`.
pub const SAMPLE_REGS_USER_MASK: u64 = 0x00ff_0fff;
pub const SAMPLE_REGS_USER_COUNT: usize = SAMPLE_REGS_USER_MASK.count_ones() as usize;

/// Bytes of user stack copied into every stack-carrying sample. The request
/// is honored verbatim by the kernel, so the record layout is fixed. Keep
/// the total record size below the u16 `perf_event_header::size` limit.
pub const SAMPLE_STACK_USER_SIZE_BYTES: usize = 32768;

/// The pid lives directly after the header both in samples (the first
/// `sample_type` field is TID) and in mmap records.
pub const RECORD_PID_OFFSET: u64 = 8;

/// Offset of the raw tracepoint body inside a raw sample: header,
/// sample-id block, then the u32 raw size.
pub const RAW_SAMPLE_DATA_OFFSET: usize = 44;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}
unsafe impl Plain for PerfEventHeader {}

/// Sample-id block of the sampling-mode sources (periodic sampling,
/// probes, GPU tracepoints): TID | TIME | STREAM_ID | CPU.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleId {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub res: u32,
}
unsafe impl Plain for SampleId {}

/// `sample_id_all` trailer of the notification sources (context switch,
/// mmap/task): TID | TIME | CPU.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleIdTrailer {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub cpu: u32,
    pub res: u32,
}
unsafe impl Plain for SampleIdTrailer {}

/// PERF_RECORD_SWITCH_CPU_WIDE.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextSwitchCpuWideRecord {
    pub header: PerfEventHeader,
    pub next_prev_pid: u32,
    pub next_prev_tid: u32,
    pub sample_id: SampleIdTrailer,
}
unsafe impl Plain for ContextSwitchCpuWideRecord {}

impl ContextSwitchCpuWideRecord {
    pub fn is_switch_out(&self) -> bool {
        self.header.misc & PERF_RECORD_MISC_SWITCH_OUT != 0
    }
}

/// PERF_RECORD_SWITCH. Only produced by per-thread sources, which the
/// engine never opens; kept for defensive dispatch.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextSwitchRecord {
    pub header: PerfEventHeader,
    pub sample_id: SampleIdTrailer,
}
unsafe impl Plain for ContextSwitchRecord {}

impl ContextSwitchRecord {
    pub fn is_switch_out(&self) -> bool {
        self.header.misc & PERF_RECORD_MISC_SWITCH_OUT != 0
    }
}

/// PERF_RECORD_FORK and PERF_RECORD_EXIT share this layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkExitRecord {
    pub header: PerfEventHeader,
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
    pub sample_id: SampleIdTrailer,
}
unsafe impl Plain for ForkExitRecord {}

/// PERF_RECORD_LOST.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LostRecord {
    pub header: PerfEventHeader,
    pub id: u64,
    pub lost: u64,
    pub sample_id: SampleIdTrailer,
}
unsafe impl Plain for LostRecord {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SampleRegsUser {
    pub abi: u64,
    pub regs: [u64; SAMPLE_REGS_USER_COUNT],
}
unsafe impl Plain for SampleRegsUser {}

impl Default for SampleRegsUser {
    fn default() -> Self {
        SampleRegsUser {
            abi: 0,
            regs: [0; SAMPLE_REGS_USER_COUNT],
        }
    }
}

#[repr(C)]
pub struct SampleStackUser {
    pub size: u64,
    pub data: [u8; SAMPLE_STACK_USER_SIZE_BYTES],
    pub dyn_size: u64,
}
unsafe impl Plain for SampleStackUser {}

/// PERF_RECORD_SAMPLE carrying user registers and a user stack copy. Both
/// the periodic sampling sources and the uprobe (entry) sources produce
/// this shape.
#[repr(C)]
pub struct StackSampleRecord {
    pub header: PerfEventHeader,
    pub sample_id: SampleId,
    pub regs: SampleRegsUser,
    pub stack: SampleStackUser,
}
unsafe impl Plain for StackSampleRecord {}

impl StackSampleRecord {
    /// The portion of the stack block the kernel actually captured.
    pub fn stack_bytes(&self) -> &[u8] {
        let len = self.stack.dyn_size.min(self.stack.size) as usize;
        &self.stack.data[..len.min(SAMPLE_STACK_USER_SIZE_BYTES)]
    }
}

/// PERF_RECORD_SAMPLE with no payload beyond the sample-id block. This is
/// what the uretprobe (return) sources produce; record size equality with
/// this layout is what distinguishes returns from entries.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySampleRecord {
    pub header: PerfEventHeader,
    pub sample_id: SampleId,
}
unsafe impl Plain for EmptySampleRecord {}

pub const EMPTY_SAMPLE_RECORD_SIZE: usize = std::mem::size_of::<EmptySampleRecord>();
pub const STACK_SAMPLE_RECORD_SIZE: usize = std::mem::size_of::<StackSampleRecord>();

// Raw tracepoint bodies. Offsets follow the tracefs format files; only the
// fields up to and including seqno are declared, later fields (fence
// pointer, ring name) differ across kernel versions and are never read.

/// Common prefix of every tracepoint entry.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracepointCommon {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
}
unsafe impl Plain for TracepointCommon {}

/// amdgpu:amdgpu_cs_ioctl and amdgpu:amdgpu_sched_run_job share this
/// prefix. `timeline` is a `__data_loc char[]` reference into the body.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct AmdgpuSchedJobBody {
    pub common: TracepointCommon,
    pub sched_job_id: u64,
    pub timeline: i32,
    pub context: u32,
    pub seqno: u32,
}
unsafe impl Plain for AmdgpuSchedJobBody {}

/// dma_fence:dma_fence_signaled.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DmaFenceSignaledBody {
    pub common: TracepointCommon,
    pub driver: i32,
    pub timeline: i32,
    pub context: u32,
    pub seqno: u32,
}
unsafe impl Plain for DmaFenceSignaledBody {}

/// Resolve a `__data_loc char[]` reference: the low 16 bits are the offset
/// from the start of the tracepoint body, the high 16 bits the length
/// including the terminating NUL.
pub fn data_loc_str(body: &[u8], data_loc: i32) -> Option<String> {
    let offset = (data_loc & 0xffff) as usize;
    let len = ((data_loc >> 16) & 0xffff) as usize;
    let bytes = body.get(offset..offset + len)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_record_sizes() {
        assert_eq!(mem::size_of::<PerfEventHeader>(), 8);
        assert_eq!(mem::size_of::<SampleId>(), 32);
        assert_eq!(mem::size_of::<SampleIdTrailer>(), 24);
        assert_eq!(mem::size_of::<ContextSwitchCpuWideRecord>(), 40);
        assert_eq!(mem::size_of::<ForkExitRecord>(), 56);
        assert_eq!(mem::size_of::<LostRecord>(), 48);
        assert_eq!(EMPTY_SAMPLE_RECORD_SIZE, 40);
        // Header, sample id, regs (abi word plus the register array), then
        // the stack block (size, data, dyn_size).
        assert_eq!(
            STACK_SAMPLE_RECORD_SIZE,
            8 + 32 + (8 + SAMPLE_REGS_USER_COUNT * 8) + (8 + SAMPLE_STACK_USER_SIZE_BYTES + 8)
        );
        // The full record must still be expressible in the u16 header size.
        assert!(STACK_SAMPLE_RECORD_SIZE <= u16::MAX as usize);
        // Header, sample id block, u32 raw size.
        assert_eq!(RAW_SAMPLE_DATA_OFFSET, 8 + mem::size_of::<SampleId>() + 4);
    }

    #[test]
    fn test_register_mask_count() {
        assert_eq!(SAMPLE_REGS_USER_COUNT, 20);
    }

    #[test]
    fn test_empty_sample_cannot_collide_with_entry() {
        // Entry/return discrimination relies on this strict inequality.
        assert!(STACK_SAMPLE_RECORD_SIZE > EMPTY_SAMPLE_RECORD_SIZE);
    }

    #[test]
    fn test_gpu_body_layouts() {
        assert_eq!(mem::size_of::<TracepointCommon>(), 8);
        assert_eq!(mem::size_of::<AmdgpuSchedJobBody>(), 28);
        assert_eq!(mem::size_of::<DmaFenceSignaledBody>(), 24);
    }

    #[test]
    fn test_data_loc_extraction() {
        let mut body = vec![0u8; 40];
        body[28..35].copy_from_slice(b"gfx_0.0");
        let data_loc = (8i32 << 16) | 28;
        assert_eq!(data_loc_str(&body, data_loc).as_deref(), Some("gfx_0.0"));
    }

    #[test]
    fn test_data_loc_out_of_bounds() {
        let body = vec![0u8; 16];
        let data_loc = (8i32 << 16) | 32;
        assert_eq!(data_loc_str(&body, data_loc), None);
    }

    #[test]
    fn test_switch_out_misc_bit() {
        let mut record = ContextSwitchCpuWideRecord::default();
        assert!(!record.is_switch_out());
        record.header.misc = PERF_RECORD_MISC_SWITCH_OUT;
        assert!(record.is_switch_out());
    }

    #[test]
    fn test_stack_bytes_clamped_by_dyn_size() {
        let mut record: Box<StackSampleRecord> =
            unsafe { Box::new_zeroed().assume_init() };
        record.stack.size = SAMPLE_STACK_USER_SIZE_BYTES as u64;
        record.stack.dyn_size = 64;
        assert_eq!(record.stack_bytes().len(), 64);
    }
}
