use std::ffi::CStr;
use std::fs;
use std::io::{Error, ErrorKind};
use std::mem;
use std::os::fd::RawFd;
use std::path::Path;

use bitfield::bitfield;
use libc;
use nix::errno::Errno;
use nix::{ioctl_none, ioctl_read, ioctl_write_int_bad, request_code_none};
use regex::Regex;

use crate::records::{
    PERF_SAMPLE_CPU, PERF_SAMPLE_RAW, PERF_SAMPLE_REGS_USER, PERF_SAMPLE_STACK_USER,
    PERF_SAMPLE_STREAM_ID, PERF_SAMPLE_TID, PERF_SAMPLE_TIME, SAMPLE_REGS_USER_MASK,
    SAMPLE_STACK_USER_SIZE_BYTES,
};

#[repr(C)]
#[allow(non_camel_case_types)]
pub union sample_un {
    pub sample_period: u64,
    pub sample_freq: u64,
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub union wakeup_un {
    pub wakeup_events: u32,
    pub wakeup_watermark: u32,
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub union bp_1_un {
    pub bp_addr: u64,
    pub kprobe_func: u64,
    pub uprobe_path: u64,
    pub config1: u64,
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub union bp_2_un {
    pub bp_len: u64,
    pub kprobe_addr: u64,
    pub probe_offset: u64,
    pub config2: u64,
}

bitfield! {
    #[allow(non_camel_case_types)]
    pub struct perf_event_attr_flags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 16, 15;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub exclude_host, set_exclude_host: 19, 19;
    pub exclude_guest, set_exclude_guest: 20, 20;
    pub exclude_callchain_kernel, set_exclude_callchain_kernel: 21, 21;
    pub exclude_callchain_user, set_exclude_callchain_user: 22, 22;
    pub mmap2, set_mmap2: 23, 23;
    pub comm_exec, set_comm_exec: 24, 24;
    pub use_clockid, set_use_clockid: 25, 25;
    pub context_switch, set_context_switch: 26, 26;
    pub write_backward, set_write_backward: 27, 27;
    pub namespaces, set_namespaces: 28, 28;
    pub __reserved_1, _: 63, 29;
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample: sample_un,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup: wakeup_un,
    pub bp_type: u32,
    pub bp_1: bp_1_un,
    pub bp_2: bp_2_un,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

const UPROBE_PMU_PATH: &str = "/sys/bus/event_source/devices/uprobe";

// Tracepoint ids live in debugfs; newer distributions mount tracefs
// separately as well.
const TRACEFS_EVENT_PATHS: [&str; 2] = [
    "/sys/kernel/debug/tracing/events",
    "/sys/kernel/tracing/events",
];

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

pub fn perf_event_open(
    attr: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<RawFd, Error> {
    let fd = unsafe {
        syscall(
            libc::SYS_perf_event_open,
            attr as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    } as i32;

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    Ok(fd)
}

const PERF_EVENT_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_ENABLE: u8 = 0;
const PERF_EVENT_IOC_DISABLE: u8 = 1;
const PERF_EVENT_IOC_SET_OUTPUT: u8 = 5;
const PERF_EVENT_IOC_ID: u8 = 7;
ioctl_none!(
    perf_event_ioc_enable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_ENABLE
);
ioctl_none!(
    perf_event_ioc_disable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_DISABLE
);
ioctl_write_int_bad!(
    perf_event_ioc_set_output,
    request_code_none!(PERF_EVENT_MAGIC, PERF_EVENT_IOC_SET_OUTPUT)
);
ioctl_read!(perf_event_ioc_id, PERF_EVENT_MAGIC, PERF_EVENT_IOC_ID, u64);

pub fn perf_event_enable(fd: RawFd) -> Result<(), Error> {
    unsafe { perf_event_ioc_enable(fd) }
        .map(|_| ())
        .map_err(Error::from)
}

pub fn perf_event_disable(fd: RawFd) -> Result<(), Error> {
    match unsafe { perf_event_ioc_disable(fd) } {
        Ok(_) => Ok(()),
        Err(Errno::ENOTTY) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Redirect `fd`'s output into the ring buffer mapped on `target_fd`.
pub fn perf_event_redirect(fd: RawFd, target_fd: RawFd) -> Result<(), Error> {
    unsafe { perf_event_ioc_set_output(fd, target_fd) }
        .map(|_| ())
        .map_err(Error::from)
}

/// The kernel-assigned stream id that ties records back to this source.
pub fn perf_event_get_id(fd: RawFd) -> Result<u64, Error> {
    let mut id: u64 = 0;
    unsafe { perf_event_ioc_id(fd, &mut id) }.map_err(Error::from)?;
    Ok(id)
}

fn base_attr() -> perf_event_attr {
    let mut attr: perf_event_attr = unsafe { mem::zeroed() };
    attr.size = mem::size_of::<perf_event_attr>() as u32;
    attr.flags.set_disabled(1);
    // All sources share the monotonic clock so kernel timestamps merge
    // with engine-generated ones.
    attr.flags.set_use_clockid(1);
    attr.clockid = libc::CLOCK_MONOTONIC;
    attr
}

/// CPU-wide context switch source. Pass `pid = -1` to observe every task
/// scheduled on `cpu`.
pub fn context_switch_event_open(pid: libc::pid_t, cpu: i32) -> Result<RawFd, Error> {
    let mut attr = base_attr();
    attr._type = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_DUMMY;
    attr.sample_type = PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU;
    attr.flags.set_context_switch(1);
    attr.flags.set_sample_id_all(1);
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Executable-mmap and task (fork/exit) notification source.
pub fn mmap_task_event_open(pid: libc::pid_t, cpu: i32) -> Result<RawFd, Error> {
    let mut attr = base_attr();
    attr._type = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_DUMMY;
    attr.sample_type = PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU;
    attr.flags.set_mmap(1);
    attr.flags.set_task(1);
    attr.flags.set_sample_id_all(1);
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

fn stack_sample_type() -> u64 {
    PERF_SAMPLE_TID
        | PERF_SAMPLE_TIME
        | PERF_SAMPLE_STREAM_ID
        | PERF_SAMPLE_CPU
        | PERF_SAMPLE_REGS_USER
        | PERF_SAMPLE_STACK_USER
}

fn set_stack_capture(attr: &mut perf_event_attr) {
    attr.sample_regs_user = SAMPLE_REGS_USER_MASK;
    attr.sample_stack_user = SAMPLE_STACK_USER_SIZE_BYTES as u32;
}

/// Periodic CPU-clock sampling source with user registers and user stack
/// capture, firing every `period_ns` nanoseconds.
pub fn sample_event_open(period_ns: u64, pid: libc::pid_t, cpu: i32) -> Result<RawFd, Error> {
    let mut attr = base_attr();
    attr._type = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample.sample_period = period_ns;
    attr.sample_type = stack_sample_type();
    set_stack_capture(&mut attr);
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Dynamic uprobe on `(binary, file offset)`, firing on function entry
/// with registers and stack captured for unwinding.
pub fn uprobe_stack_event_open(
    binary_path: &CStr,
    file_offset: u64,
    pid: libc::pid_t,
    cpu: i32,
) -> Result<RawFd, Error> {
    let mut attr = base_attr();
    attr._type = uprobe_pmu_type()?;
    attr.sample.sample_period = 1;
    attr.sample_type = stack_sample_type();
    set_stack_capture(&mut attr);
    attr.bp_1.uprobe_path = binary_path.as_ptr() as u64;
    attr.bp_2.probe_offset = file_offset;
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Dynamic uretprobe on `(binary, file offset)`. Return records carry the
/// sample-id block only, which keeps them at the empty-sample size.
pub fn uretprobe_event_open(
    binary_path: &CStr,
    file_offset: u64,
    pid: libc::pid_t,
    cpu: i32,
) -> Result<RawFd, Error> {
    let mut attr = base_attr();
    attr._type = uprobe_pmu_type()?;
    attr.config = 1 << uprobe_retprobe_bit()?;
    attr.sample.sample_period = 1;
    attr.sample_type =
        PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_STREAM_ID | PERF_SAMPLE_CPU;
    attr.bp_1.uprobe_path = binary_path.as_ptr() as u64;
    attr.bp_2.probe_offset = file_offset;
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Static tracepoint source resolved by `(category, name)`, with the raw
/// tracepoint body attached to each sample.
pub fn tracepoint_event_open(
    category: &str,
    name: &str,
    pid: libc::pid_t,
    cpu: i32,
) -> Result<RawFd, Error> {
    let mut attr = base_attr();
    attr._type = PERF_TYPE_TRACEPOINT;
    attr.config = get_tracepoint_id(category, name)?;
    attr.sample.sample_period = 1;
    attr.sample_type = PERF_SAMPLE_TID
        | PERF_SAMPLE_TIME
        | PERF_SAMPLE_STREAM_ID
        | PERF_SAMPLE_CPU
        | PERF_SAMPLE_RAW;
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

pub fn uprobe_pmu_type() -> Result<u32, Error> {
    let buf = fs::read_to_string(Path::new(UPROBE_PMU_PATH).join("type"))?;
    buf.trim()
        .parse()
        .map_err(|_| Error::new(ErrorKind::InvalidData, "malformed uprobe PMU type"))
}

pub fn uprobe_retprobe_bit() -> Result<u64, Error> {
    let buf = fs::read_to_string(Path::new(UPROBE_PMU_PATH).join("format/retprobe"))?;
    parse_config_bit(&buf)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "malformed retprobe format"))
}

/// The retprobe format file reads e.g. "config:0".
fn parse_config_bit(format: &str) -> Option<u64> {
    let re = Regex::new(r"config:(\d+)").unwrap();
    let caps = re.captures(format)?;
    caps[1].parse().ok()
}

pub fn get_tracepoint_id(category: &str, name: &str) -> Result<u64, Error> {
    let mut last_err = Error::from(ErrorKind::NotFound);
    for base in TRACEFS_EVENT_PATHS {
        let path = Path::new(base).join(category).join(name).join("id");
        match fs::read_to_string(&path) {
            Ok(buf) => {
                return buf
                    .trim()
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::InvalidData, "malformed tracepoint id"));
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}
