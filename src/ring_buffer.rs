//! Single-consumer reader over a kernel perf ring buffer.
//!
//! The kernel writes records into the mmap'd data region and publishes the
//! producer position in `data_head`; we consume records and publish our
//! position in `data_tail`. Records may wrap around the end of the region,
//! reads linearize them with a two-chunk copy.

use std::io::{Error, ErrorKind};
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use plain::Plain;

use crate::records::PerfEventHeader;

/// First page of the mapping; `data_head`/`data_tail` start at offset 1024.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_mmap_page {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved: [u8; 948],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// One mapped perf ring buffer. The fd is a non-owning handle: fds are
/// closed through the engine's tracked fd set, never here, so that
/// redirected fds cannot be double-closed. Dropping only unmaps.
pub struct PerfEventRingBuffer {
    metadata: *mut perf_event_mmap_page,
    data: *mut u8,
    data_size: u64,
    mask: u64,
    mmap_len: usize,
    position: u64,
    fd: RawFd,
    name: String,
    #[cfg(test)]
    _backing: Option<Box<[u64]>>,
}

// The mapping stays valid wherever the buffer is moved; head/tail are
// synchronized with the kernel through the fences below.
unsafe impl Send for PerfEventRingBuffer {}

impl PerfEventRingBuffer {
    /// Map `size_kb` (a power of two) of ring buffer over `fd`.
    pub fn open(fd: RawFd, size_kb: u32, name: String) -> Result<Self, Error> {
        let data_size = size_kb as u64 * 1024;
        if !data_size.is_power_of_two() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("ring buffer size must be a power of two KB, got {size_kb}"),
            ));
        }
        let page = page_size();
        let mmap_len = page + data_size as usize;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let metadata = base as *mut perf_event_mmap_page;
        let data_offset = match unsafe { (*metadata).data_offset } {
            0 => page as u64,
            offset => offset,
        };
        Ok(PerfEventRingBuffer {
            metadata,
            data: unsafe { (base as *mut u8).add(data_offset as usize) },
            data_size,
            mask: data_size - 1,
            mmap_len,
            position: 0,
            fd,
            name,
            #[cfg(test)]
            _backing: None,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_data(&self) -> bool {
        self.read_head() != self.position
    }

    /// Peek the next record's header without advancing.
    pub fn read_header(&self, header: &mut PerfEventHeader) {
        let mut buf = [0u8; mem::size_of::<PerfEventHeader>()];
        self.copy_at(0, &mut buf);
        plain::copy_from_bytes(header, &buf).unwrap();
    }

    /// Copy the next record into a typed view and advance past it. Records
    /// shorter than `T` (a truncated stack block, for instance) leave the
    /// remaining fields zeroed.
    pub fn consume_record<T: Plain>(&mut self, header: &PerfEventHeader) -> Box<T> {
        let mut record: Box<T> = unsafe { Box::new_zeroed().assume_init() };
        let bytes = unsafe { plain::as_mut_bytes(record.as_mut()) };
        let len = (header.size as usize).min(bytes.len());
        self.copy_at(0, &mut bytes[..len]);
        self.advance(header.size);
        record
    }

    /// Copy the next record verbatim and advance past it.
    pub fn consume_raw(&mut self, header: &PerfEventHeader) -> Vec<u8> {
        let mut bytes = vec![0u8; header.size as usize];
        self.copy_at(0, &mut bytes);
        self.advance(header.size);
        bytes
    }

    /// Advance past the next record without materializing it.
    pub fn skip_record(&mut self, header: &PerfEventHeader) {
        self.advance(header.size);
    }

    /// Read one u32 field of the next record, `offset` bytes from its
    /// start, without advancing. Used to read the pid before deciding
    /// whether a record is worth consuming.
    pub fn peek_u32(&self, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.copy_at(offset, &mut buf);
        u32::from_ne_bytes(buf)
    }

    #[cfg(test)]
    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    fn read_head(&self) -> u64 {
        let head = unsafe { ptr::read_volatile(&(*self.metadata).data_head) };
        fence(Ordering::Acquire);
        head
    }

    fn advance(&mut self, record_size: u16) {
        self.position += record_size as u64;
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(&mut (*self.metadata).data_tail, self.position) };
    }

    fn copy_at(&self, offset: u64, dest: &mut [u8]) {
        let start = (self.position + offset) & self.mask;
        let first = dest.len().min((self.data_size - start) as usize);
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(start as usize), dest.as_mut_ptr(), first);
            if first < dest.len() {
                // Wrapped around the end of the region.
                ptr::copy_nonoverlapping(
                    self.data,
                    dest[first..].as_mut_ptr(),
                    dest.len() - first,
                );
            }
        }
    }
}

impl Drop for PerfEventRingBuffer {
    fn drop(&mut self) {
        if self.mmap_len > 0 {
            unsafe {
                libc::munmap(self.metadata as *mut libc::c_void, self.mmap_len);
            }
        }
    }
}
