//! Per-CPU memory-mapped ring buffers over perf tracepoint events.
//!
//! Each CPU gets one buffer backed by a group-leader perf fd; additional
//! tracepoints attach to the same buffer with `PERF_EVENT_IOC_SET_OUTPUT`.
//! The buffer follows the perf mmap layout: one metadata page
//! (`data_head`/`data_tail`) followed by a power-of-two data area into which
//! the kernel appends `perf_event_header`-framed records.
//!
//! Wraparound discipline: reassemble-on-read. A record may physically
//! straddle the end of the data area; the drain copies the two segments into
//! a per-buffer scratch buffer and always hands the callback one contiguous
//! record.

use crate::cancel::CancelToken;
use byteorder::ByteOrder;
use byteorder::NativeEndian;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub const PERF_RECORD_SAMPLE: u32 = 9;

const PERF_TYPE_TRACEPOINT: u32 = 2;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 8;

// perf_event_attr.sample_type bits.
const PERF_SAMPLE_TID: u64 = 1 << 1;
const PERF_SAMPLE_TIME: u64 = 1 << 2;
const PERF_SAMPLE_CPU: u64 = 1 << 7;
const PERF_SAMPLE_RAW: u64 = 1 << 10;

// perf_event_attr bitfield flags.
const ATTR_WATERMARK: u64 = 1 << 14;
const ATTR_WRITE_BACKWARD: u64 = 1 << 27;

// `_IO('$', 0)` / `_IO('$', 1)` / `_IO('$', 5)`
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_EVENT_IOC_SET_OUTPUT: libc::c_ulong = 0x2405;

/// Errors owning the whole buffer set.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Requested per-CPU buffer size cannot be used.
    #[error("invalid buffer size {0} bytes (must be a positive power of two)")]
    InvalidBufferSize(usize),
    /// Buffer mapping or event attach failed; the set is unusable.
    #[error("ring buffer setup failed: {0}")]
    Os(#[from] io::Error),
}

/// Record envelope shared by all ring-buffer records.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub rtype: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    fn parse(bytes: &[u8]) -> Self {
        Self {
            rtype: NativeEndian::read_u32(&bytes[0..4]),
            misc: NativeEndian::read_u16(&bytes[4..6]),
            size: NativeEndian::read_u16(&bytes[6..8]),
        }
    }
}

/// Extract the sample timestamp from a full record, if it is a sample.
///
/// Samples are laid out for `sample_type = TID | TIME | CPU | RAW`:
/// envelope, `pid`/`tid` (8 bytes), `time` (8 bytes), `cpu`/`res`,
/// `raw_size`, raw payload.
pub fn sample_time(record: &[u8]) -> u64 {
    if record.len() >= 24 && NativeEndian::read_u32(&record[0..4]) == PERF_RECORD_SAMPLE {
        NativeEndian::read_u64(&record[16..24])
    } else {
        0
    }
}

/// Extract the raw tracepoint payload from a sample record: the bytes after
/// the fixed sample fields, bounded by the `raw_size` word. `None` for
/// non-sample records or malformed sizes.
pub fn sample_raw(record: &[u8]) -> Option<&[u8]> {
    if record.len() < 36 || NativeEndian::read_u32(&record[0..4]) != PERF_RECORD_SAMPLE {
        return None;
    }
    let raw_size = NativeEndian::read_u32(&record[32..36]) as usize;
    record.get(36..36 + raw_size)
}

/// Owning wrapper over one mmap region. Unmapped exactly once, on drop.
struct RingMap {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned; the kernel-shared metadata words
// are only touched through atomics.
unsafe impl Send for RingMap {}

impl RingMap {
    fn map(fd: &OwnedFd, len: usize) -> io::Result<Self> {
        // SAFETY: len is nonzero and fd is a valid perf event fd; failure is
        // checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned non-null"),
            len,
        })
    }

    #[cfg(test)]
    fn anonymous(len: usize) -> io::Result<Self> {
        // SAFETY: anonymous private mapping, checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned non-null"),
            len,
        })
    }
}

impl Drop for RingMap {
    fn drop(&mut self) {
        // SAFETY: ptr/len are the exact values returned by mmap, and this
        // wrapper is the region's only owner.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Metadata words at the head of the mapping (subset of
/// `perf_event_mmap_page`; the kernel places the data cursors at byte 1024).
#[repr(C)]
struct RingPage {
    _header: [u8; 1024],
    data_head: AtomicU64,
    data_tail: AtomicU64,
    data_offset: u64,
    data_size: u64,
}

/// One CPU's ring buffer.
///
/// Field order matters for teardown: the mapping is declared before the fd
/// so it is unmapped while the fd is still open.
pub struct RingBuffer {
    cpu: usize,
    map: RingMap,
    leader: Option<OwnedFd>,
    backward: bool,
    data_offset: usize,
    data_size: usize,
    scratch: Vec<u8>,
}

impl RingBuffer {
    fn from_fd(cpu: usize, fd: OwnedFd, page_size: usize, data_size: usize) -> io::Result<Self> {
        let map = RingMap::map(&fd, page_size + data_size)?;
        let mut buf = Self {
            cpu,
            map,
            leader: Some(fd),
            backward: false,
            data_offset: page_size,
            data_size,
            scratch: Vec::new(),
        };
        // Kernels that publish data_offset/data_size override the defaults.
        let (page_offset, page_data_size) = {
            let page = buf.page();
            (page.data_offset, page.data_size)
        };
        if page_data_size != 0 {
            buf.data_offset = page_offset as usize;
            buf.data_size = page_data_size as usize;
        }
        Ok(buf)
    }

    /// Anonymous buffer with the perf layout, used by unit tests and the
    /// session's synthetic paths.
    #[cfg(test)]
    pub(crate) fn anonymous(cpu: usize, page_size: usize, data_size: usize) -> io::Result<Self> {
        let map = RingMap::anonymous(page_size + data_size)?;
        // SAFETY: the fresh anonymous mapping is exclusively owned and no
        // reference into it exists yet.
        unsafe {
            (*map.ptr.as_ptr().cast::<RingPage>()).data_offset = page_size as u64;
        }
        // data_size left zero in the page; the struct fields are authoritative.
        Ok(Self {
            cpu,
            map,
            leader: None,
            backward: false,
            data_offset: page_size,
            data_size,
            scratch: Vec::new(),
        })
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    fn page(&self) -> &RingPage {
        // SAFETY: the mapping is at least one page and starts with the
        // metadata page; alignment is page alignment. Only a shared
        // reference is ever minted; the kernel-written cursor words are
        // accessed through the atomics.
        unsafe { &*self.map.ptr.as_ptr().cast::<RingPage>() }
    }

    fn data(&self) -> &[u8] {
        // SAFETY: data_offset..data_offset+data_size lies inside the mapping.
        unsafe {
            std::slice::from_raw_parts(self.map.ptr.as_ptr().add(self.data_offset), self.data_size)
        }
    }

    fn has_pending(&self) -> bool {
        let page = self.page();
        page.data_head.load(Ordering::Acquire) != page.data_tail.load(Ordering::Relaxed)
    }

    /// Copy the record at logical offset `pos` (length `len`) into the
    /// scratch buffer, reassembling across the wrap boundary if needed.
    /// Records are always copied out so the delivered slice never aliases
    /// memory the kernel keeps writing into.
    fn record_at(&mut self, pos: u64, len: usize) -> &[u8] {
        let mask = self.data_size - 1;
        let start = (pos as usize) & mask;
        let data_ptr = self.map.ptr.as_ptr().wrapping_add(self.data_offset).cast_const();
        self.scratch.clear();
        // SAFETY: both segments lie inside data_offset..data_offset+data_size
        // of the owned mapping.
        unsafe {
            if start + len <= self.data_size {
                self.scratch
                    .extend_from_slice(std::slice::from_raw_parts(data_ptr.add(start), len));
            } else {
                let first = self.data_size - start;
                self.scratch
                    .extend_from_slice(std::slice::from_raw_parts(data_ptr.add(start), first));
                self.scratch
                    .extend_from_slice(std::slice::from_raw_parts(data_ptr, len - first));
            }
        }
        &self.scratch
    }

    /// Read the 8-byte envelope at logical offset `pos`.
    fn header_at(&self, pos: u64) -> RecordHeader {
        let mask = self.data_size - 1;
        let start = (pos as usize) & mask;
        let data = self.data();
        if start + RecordHeader::SIZE <= self.data_size {
            RecordHeader::parse(&data[start..start + RecordHeader::SIZE])
        } else {
            let mut bytes = [0u8; RecordHeader::SIZE];
            let first = self.data_size - start;
            bytes[..first].copy_from_slice(&data[start..]);
            bytes[first..].copy_from_slice(&data[..RecordHeader::SIZE - first]);
            RecordHeader::parse(&bytes)
        }
    }

    /// Drain all complete records in publish order, forward rings only.
    ///
    /// The read cursor is published back to the kernel only after the
    /// callback returns `Ok`, so a failing callback leaves the cursor on
    /// the failed record.
    pub fn drain(
        &mut self,
        mut callback: impl FnMut(usize, u64, &[u8]) -> io::Result<()>,
    ) -> io::Result<usize> {
        debug_assert!(!self.backward);
        let head = self.page().data_head.load(Ordering::Acquire);
        let mut tail = self.page().data_tail.load(Ordering::Relaxed);
        let mut drained = 0usize;

        while tail != head {
            let header = self.header_at(tail);
            let len = header.size as usize;
            if len < RecordHeader::SIZE || (tail + len as u64) > head {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt record envelope at offset {tail} (size {len})"),
                ));
            }
            let cpu = self.cpu;
            let record = self.record_at(tail, len);
            let time = sample_time(record);
            callback(cpu, time, record)?;
            tail += len as u64;
            self.page().data_tail.store(tail, Ordering::Release);
            drained += 1;
        }
        Ok(drained)
    }

    /// Drain an overwrite (write-backward) ring: one lap forward from the
    /// current head yields records newest-first; they are delivered in
    /// chronological order.
    pub fn drain_overwrite(
        &mut self,
        mut callback: impl FnMut(usize, u64, &[u8]) -> io::Result<()>,
    ) -> io::Result<usize> {
        let head = self.page().data_head.load(Ordering::Acquire);
        let mut pos = head;
        let mut consumed = 0usize;
        let mut offsets: Vec<(u64, usize)> = Vec::new();

        while consumed < self.data_size {
            let header = self.header_at(pos);
            let len = header.size as usize;
            if header.rtype == 0 || len < RecordHeader::SIZE || consumed + len > self.data_size {
                break;
            }
            offsets.push((pos, len));
            pos = pos.wrapping_add(len as u64);
            consumed += len;
        }

        for (pos, len) in offsets.iter().rev() {
            let cpu = self.cpu;
            let record = self.record_at(*pos, *len);
            let time = sample_time(record);
            callback(cpu, time, record)?;
        }
        Ok(offsets.len())
    }

    fn dispatch_drain(
        &mut self,
        callback: impl FnMut(usize, u64, &[u8]) -> io::Result<()>,
    ) -> io::Result<usize> {
        if self.backward {
            self.drain_overwrite(callback)
        } else {
            self.drain(callback)
        }
    }

    /// Build one synthetic sample record (test publishers).
    #[cfg(test)]
    fn build_sample(&self, time: u64, payload: &[u8]) -> Vec<u8> {
        let body_len = 8 + 8 + 8 + 4 + payload.len();
        let total = (RecordHeader::SIZE + body_len + 7) & !7;
        let mut record = Vec::with_capacity(total);
        record.extend_from_slice(&PERF_RECORD_SAMPLE.to_ne_bytes());
        record.extend_from_slice(&0u16.to_ne_bytes());
        record.extend_from_slice(&(total as u16).to_ne_bytes());
        record.extend_from_slice(&0u32.to_ne_bytes()); // pid
        record.extend_from_slice(&0u32.to_ne_bytes()); // tid
        record.extend_from_slice(&time.to_ne_bytes());
        record.extend_from_slice(&(self.cpu as u32).to_ne_bytes());
        record.extend_from_slice(&0u32.to_ne_bytes()); // res
        record.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        record.extend_from_slice(payload);
        record.resize(total, 0);
        record
    }

    /// Copy bytes into the data area at `start`, wrapping at the end.
    #[cfg(test)]
    fn copy_in(&self, start: usize, bytes: &[u8]) {
        let data_ptr = self.map.ptr.as_ptr().wrapping_add(self.data_offset);
        // SAFETY: test-only writer into our own anonymous mapping; both
        // segments stay inside data_offset..data_offset+data_size.
        unsafe {
            if start + bytes.len() <= self.data_size {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data_ptr.add(start), bytes.len());
            } else {
                let first = self.data_size - start;
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data_ptr.add(start), first);
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    data_ptr,
                    bytes.len() - first,
                );
            }
        }
    }

    /// Publish one synthetic sample record the way a forward ring does:
    /// appended at the head, head advancing upward.
    #[cfg(test)]
    pub(crate) fn publish(&mut self, time: u64, payload: &[u8]) {
        let record = self.build_sample(time, payload);
        let head = self.page().data_head.load(Ordering::Relaxed);
        let mask = self.data_size - 1;
        self.copy_in((head as usize) & mask, &record);
        self.page()
            .data_head
            .store(head + record.len() as u64, Ordering::Release);
    }

    /// Publish one synthetic sample record the way a write-backward ring
    /// does: the head counts down and the newest record starts at it.
    #[cfg(test)]
    pub(crate) fn publish_backward(&mut self, time: u64, payload: &[u8]) {
        let record = self.build_sample(time, payload);
        let head = self.page().data_head.load(Ordering::Relaxed);
        let new_head = head.wrapping_sub(record.len() as u64);
        let mask = self.data_size - 1;
        self.copy_in((new_head as usize) & mask, &record);
        self.page().data_head.store(new_head, Ordering::Release);
    }
}

/// Outcome of one blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one buffer has unread data.
    Ready,
    /// The timeout elapsed; not an error.
    TimedOut,
    /// The cancellation token fired.
    Cancelled,
}

/// Attach parameters for one tracepoint across all buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    /// Wake a blocked reader once this many bytes are pending (realtime).
    pub wakeup_watermark_bytes: Option<u32>,
    /// Open overwrite (write-backward) buffers (circular mode).
    pub overwrite: bool,
}

/// Summary of one drain pass across all CPUs.
#[derive(Debug, Default)]
pub struct DrainSummary {
    pub records: usize,
    /// Per-CPU read errors; draining of other CPUs continues past these.
    pub errors: Vec<(usize, io::Error)>,
}

/// All per-CPU ring buffers of one session.
pub struct RingBufferSet {
    page_size: usize,
    buffer_bytes: usize,
    slots: Vec<Option<RingBuffer>>,
    /// fds of non-leader events, redirected into the leaders' buffers.
    followers: Vec<OwnedFd>,
}

impl RingBufferSet {
    /// Allocate slots for `cpu_count` buffers of `buffer_bytes` each.
    ///
    /// No kernel resources are acquired yet; the per-CPU mappings are
    /// created when the first tracepoint is attached (the mmap needs the
    /// group-leader fd). `buffer_bytes` is rounded up to a power-of-two
    /// multiple of the page size.
    pub fn open(cpu_count: usize, buffer_bytes: usize) -> Result<Self, RingError> {
        if cpu_count == 0 || buffer_bytes == 0 {
            return Err(RingError::InvalidBufferSize(buffer_bytes));
        }
        // SAFETY: sysconf with a valid name has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let buffer_bytes = buffer_bytes.next_power_of_two().max(page_size);
        let mut slots = Vec::with_capacity(cpu_count);
        slots.resize_with(cpu_count, || None);
        Ok(Self {
            page_size,
            buffer_bytes,
            slots,
            followers: Vec::new(),
        })
    }

    pub fn cpu_count(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// True once the per-CPU mappings exist.
    pub fn is_attached(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// Attach one tracepoint (by kernel format id) to every CPU's buffer.
    ///
    /// The first attach creates the leader fds and mappings; any failure
    /// unwinds everything created by this call, so the set is never left
    /// partially mapped.
    pub fn attach(&mut self, format_id: u32, opts: &AttachOptions) -> Result<(), RingError> {
        let first_attach = !self.is_attached();
        let mut new_slots: Vec<(usize, RingBuffer)> = Vec::new();
        let mut new_followers: Vec<OwnedFd> = Vec::new();

        let result = (|| -> io::Result<()> {
            for cpu in 0..self.slots.len() {
                let fd = perf_event_open_tracepoint(format_id, cpu as i32, opts)?;
                match &self.slots[cpu] {
                    None => {
                        enable_event(&fd)?;
                        let mut buf = RingBuffer::from_fd(
                            cpu,
                            fd,
                            self.page_size,
                            self.buffer_bytes,
                        )?;
                        buf.backward = opts.overwrite;
                        new_slots.push((cpu, buf));
                    }
                    Some(existing) => {
                        let leader = existing
                            .leader
                            .as_ref()
                            .ok_or_else(|| {
                                io::Error::new(
                                    io::ErrorKind::InvalidInput,
                                    "buffer has no leader fd",
                                )
                            })?;
                        set_output(&fd, leader)?;
                        enable_event(&fd)?;
                        new_followers.push(fd);
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                for (cpu, buf) in new_slots {
                    self.slots[cpu] = Some(buf);
                }
                self.followers.append(&mut new_followers);
                Ok(())
            }
            Err(err) => {
                // Unwind: dropping the partial buffers unmaps and closes
                // them; on a failed first attach nothing stays mapped.
                drop(new_slots);
                drop(new_followers);
                if first_attach {
                    for slot in &mut self.slots {
                        *slot = None;
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Stop the kernel writing into every buffer. Already-buffered records
    /// stay readable; this must precede the stop-time drain so record bytes
    /// do not mutate while they are copied out.
    pub fn disable_all(&self) -> io::Result<()> {
        for buf in self.slots.iter().flatten() {
            if let Some(leader) = &buf.leader {
                disable_event(leader)?;
            }
        }
        for fd in &self.followers {
            disable_event(fd)?;
        }
        Ok(())
    }

    /// Block until data is pending on any buffer, the timeout elapses, or
    /// the token is cancelled. Timeout expiry is a normal outcome.
    pub fn wait_for_data(
        &self,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> io::Result<WaitOutcome> {
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }
        if self.slots.iter().flatten().any(RingBuffer::has_pending) {
            return Ok(WaitOutcome::Ready);
        }

        let mut fds: Vec<libc::pollfd> = self
            .slots
            .iter()
            .flatten()
            .filter_map(|buf| buf.leader.as_ref())
            .map(|fd| libc::pollfd {
                fd: fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        fds.push(libc::pollfd {
            fd: cancel.poll_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });

        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(t.subsec_nanos()),
        });
        // SAFETY: fds points at a valid array of the stated length; the
        // timespec (when present) outlives the call.
        let rc = unsafe {
            libc::ppoll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                ts.as_ref().map_or(std::ptr::null(), std::ptr::from_ref),
                std::ptr::null(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                // Any handled signal interrupts ppoll, not just termination.
                // Report a timeout and let the caller's between-round
                // cancellation check decide whether to stop.
                return Ok(WaitOutcome::TimedOut);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(WaitOutcome::TimedOut);
        }
        let cancel_fd = fds.last().expect("poll set is never empty");
        if cancel_fd.revents & libc::POLLIN != 0 {
            return Ok(WaitOutcome::Cancelled);
        }
        Ok(WaitOutcome::Ready)
    }

    /// Drain every buffer with pending data. A read error on one CPU is
    /// recorded and draining continues on the others.
    pub fn drain_ready(
        &mut self,
        mut callback: impl FnMut(usize, u64, &[u8]) -> io::Result<()>,
    ) -> DrainSummary {
        let mut summary = DrainSummary::default();
        for buf in self.slots.iter_mut().flatten() {
            match buf.dispatch_drain(&mut callback) {
                Ok(count) => summary.records += count,
                Err(err) => {
                    log::warn!("cpu {} drain failed: {err}", buf.cpu());
                    summary.errors.push((buf.cpu(), err));
                }
            }
        }
        summary
    }

    /// Build a set from pre-made buffers (test sessions).
    #[cfg(test)]
    pub(crate) fn with_test_buffers(buffers: Vec<RingBuffer>) -> Self {
        let buffer_bytes = buffers
            .first()
            .map_or(0, |b| b.data_size);
        Self {
            page_size: 4096,
            buffer_bytes,
            slots: buffers.into_iter().map(Some).collect(),
            followers: Vec::new(),
        }
    }
}

/// `perf_event_attr`, sized to `PERF_ATTR_SIZE_VER6` (120 bytes).
#[repr(C)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    _reserved_2: u16,
    aux_sample_size: u32,
    _reserved_3: u32,
}

fn perf_event_open_tracepoint(
    format_id: u32,
    cpu: i32,
    opts: &AttachOptions,
) -> io::Result<OwnedFd> {
    let mut flags = 0u64;
    let mut wakeup = 0u32;
    if let Some(watermark) = opts.wakeup_watermark_bytes {
        flags |= ATTR_WATERMARK;
        wakeup = watermark;
    }
    if opts.overwrite {
        flags |= ATTR_WRITE_BACKWARD;
    }

    let attr = PerfEventAttr {
        type_: PERF_TYPE_TRACEPOINT,
        size: size_of::<PerfEventAttr>() as u32,
        config: u64::from(format_id),
        sample_period: 1,
        sample_type: PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU | PERF_SAMPLE_RAW,
        read_format: 0,
        flags,
        wakeup,
        bp_type: 0,
        config1: 0,
        config2: 0,
        branch_sample_type: 0,
        sample_regs_user: 0,
        sample_stack_user: 0,
        clockid: 0,
        sample_regs_intr: 0,
        aux_watermark: 0,
        sample_max_stack: 0,
        _reserved_2: 0,
        aux_sample_size: 0,
        _reserved_3: 0,
    };

    // SAFETY: attr points at a fully initialized struct whose size field
    // matches its layout; pid=-1/cpu selects per-CPU system-wide mode.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &raw const attr,
            -1 as libc::pid_t,
            cpu,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the syscall returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

fn enable_event(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: plain ioctl on an owned perf fd with no out-parameters.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE as _, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn disable_event(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: plain ioctl on an owned perf fd with no out-parameters.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_DISABLE as _, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_output(fd: &OwnedFd, leader: &OwnedFd) -> io::Result<()> {
    // SAFETY: plain ioctl on owned perf fds.
    let rc = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            PERF_EVENT_IOC_SET_OUTPUT as _,
            leader.as_raw_fd(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
