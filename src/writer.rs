//! Trace file writer.
//!
//! Produces a perf.data-style container: a fixed-size header reserved up
//! front and rewritten during finalize, a data section of framed records,
//! and an event-description section appended after the data. Readers that
//! stop at a truncation point still see a self-describing prefix thanks to
//! the `FINISHED_INIT` / `FINISHED_ROUND` markers inside the data stream.
//!
//! All multi-byte values are native endian; the file is meant to be read on
//! the machine (or at least the architecture) that produced it.

use byteorder::ByteOrder;
use byteorder::NativeEndian;
use byteorder::WriteBytesExt;
use std::fs::File;
use std::io;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

/// File magic, including the format version.
pub const MAGIC: [u8; 8] = *b"TPCOLL1\0";
/// Size of the file header in bytes.
pub const HEADER_SIZE: u64 = 72;

/// Record type tags in the data section.
pub const RECORD_FINISHED_INIT: u32 = 1;
pub const RECORD_FINISHED_ROUND: u32 = 2;
pub const RECORD_SAMPLE: u32 = 3;

/// Errors from the trace file writer.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    /// An operation was called in the wrong writer state.
    #[error("writer is {actual:?}, operation requires {required:?}")]
    BadState { required: State, actual: State },
    /// Underlying file I/O failed.
    #[error("trace file I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Writer lifecycle. Advances monotonically; enforced at every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// File created, header space reserved, no records yet.
    Created,
    /// `FINISHED_INIT` written; events may be appended.
    Initialized,
    /// Header backpatched and the handle consumed.
    Finalized,
}

/// One entry of the event-description section.
struct EventDesc {
    format_id: u32,
    /// `system:event`
    name: String,
}

/// Writes one trace file. See the module docs for the layout.
pub struct TraceFileWriter {
    file: Option<File>,
    state: State,
    pos: u64,
    event_count: u64,
    first_time: u64,
    last_time: u64,
    descs: Vec<EventDesc>,
}

impl TraceFileWriter {
    /// Create the output file and reserve the header.
    ///
    /// The reserved header is all zeros except the magic, so a reader of an
    /// unfinalized file can recognize the format but sees empty sections.
    pub fn create(path: &Path) -> Result<Self, WriterError> {
        let mut file = File::create(path)?;
        let mut header = [0u8; HEADER_SIZE as usize];
        header[..8].copy_from_slice(&MAGIC);
        file.write_all(&header)?;
        Ok(Self {
            file: Some(file),
            state: State::Created,
            pos: HEADER_SIZE,
            event_count: 0,
            first_time: 0,
            last_time: 0,
            descs: Vec::new(),
        })
    }

    /// Current write offset. Non-decreasing until the finalize backpatch.
    pub fn file_pos(&self) -> u64 {
        self.pos
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    fn require(&self, required: State) -> Result<(), WriterError> {
        if self.state == required {
            Ok(())
        } else {
            Err(WriterError::BadState {
                required,
                actual: self.state,
            })
        }
    }

    fn file_mut(&mut self) -> Result<&mut File, WriterError> {
        // state checks precede this; Finalized is the only fileless state
        self.file.as_mut().ok_or(WriterError::BadState {
            required: State::Initialized,
            actual: State::Finalized,
        })
    }

    /// Write a framed record: `{rtype, size}` then the body, zero-padded so
    /// the next record starts 8-aligned.
    fn write_record(&mut self, rtype: u32, body: &[u8]) -> Result<(), WriterError> {
        let unpadded = 8 + body.len();
        let total = unpadded.next_multiple_of(8);
        let file = self.file_mut()?;
        file.write_u32::<NativeEndian>(rtype)?;
        file.write_u32::<NativeEndian>(total as u32)?;
        file.write_all(body)?;
        if total > unpadded {
            file.write_all(&[0u8; 8][..total - unpadded])?;
        }
        self.pos += total as u64;
        Ok(())
    }

    /// Mark the end of setup. Exactly once, before any event.
    pub fn write_finished_init(&mut self) -> Result<(), WriterError> {
        self.require(State::Created)?;
        self.write_record(RECORD_FINISHED_INIT, &[])?;
        self.state = State::Initialized;
        Ok(())
    }

    /// Append one collected event.
    pub fn write_event(
        &mut self,
        cpu: u32,
        timestamp: u64,
        payload: &[u8],
    ) -> Result<(), WriterError> {
        self.require(State::Initialized)?;
        let mut body = Vec::with_capacity(16 + 4 + payload.len());
        body.extend_from_slice(&cpu.to_ne_bytes());
        body.extend_from_slice(&0u32.to_ne_bytes());
        body.extend_from_slice(&timestamp.to_ne_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        body.extend_from_slice(payload);
        self.write_record(RECORD_SAMPLE, &body)?;

        if self.event_count == 0 || timestamp < self.first_time {
            self.first_time = timestamp;
        }
        if timestamp > self.last_time {
            self.last_time = timestamp;
        }
        self.event_count += 1;
        Ok(())
    }

    /// Mark the end of one drain round. Events written before this marker
    /// are complete up to the round boundary.
    pub fn write_finished_round(&mut self) -> Result<(), WriterError> {
        self.require(State::Initialized)?;
        self.write_record(RECORD_FINISHED_ROUND, &[])
    }

    /// Register one tracepoint for the description section.
    pub fn add_event_desc(&mut self, format_id: u32, name: &str) {
        self.descs.push(EventDesc {
            format_id,
            name: name.to_string(),
        });
    }

    /// Write the description section, backpatch the header, flush and
    /// consume the file handle. The writer is unusable afterwards.
    pub fn finalize_and_close(&mut self) -> Result<(), WriterError> {
        self.require(State::Initialized)?;

        let data_size = self.pos - HEADER_SIZE;
        let desc_offset = self.pos;

        let mut desc = Vec::new();
        desc.extend_from_slice(&(self.descs.len() as u32).to_ne_bytes());
        for entry in &self.descs {
            desc.extend_from_slice(&entry.format_id.to_ne_bytes());
            desc.extend_from_slice(&(entry.name.len() as u32).to_ne_bytes());
            desc.extend_from_slice(entry.name.as_bytes());
            let pad = desc.len().next_multiple_of(8) - desc.len();
            desc.extend_from_slice(&[0u8; 8][..pad]);
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        header[..8].copy_from_slice(&MAGIC);
        NativeEndian::write_u64(&mut header[8..16], HEADER_SIZE);
        NativeEndian::write_u64(&mut header[16..24], HEADER_SIZE);
        NativeEndian::write_u64(&mut header[24..32], data_size);
        NativeEndian::write_u64(&mut header[32..40], desc_offset);
        NativeEndian::write_u64(&mut header[40..48], desc.len() as u64);
        NativeEndian::write_u64(&mut header[48..56], self.event_count);
        NativeEndian::write_u64(&mut header[56..64], self.first_time);
        NativeEndian::write_u64(&mut header[64..72], self.last_time);

        let file = self.file_mut()?;
        // A failed partial write can leave the physical position past the
        // tracked offset; the desc section goes where the header says it is.
        file.seek(SeekFrom::Start(desc_offset))?;
        file.write_all(&desc)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.flush()?;

        self.file = None;
        self.state = State::Finalized;
        Ok(())
    }

    /// Push the physical file position past the tracked offset, the way a
    /// partially completed write would.
    #[cfg(test)]
    fn skew_physical_position(&mut self) {
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Current(32)).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Cursor;
    use std::io::Read;

    struct Header {
        data_offset: u64,
        data_size: u64,
        desc_offset: u64,
        desc_size: u64,
        event_count: u64,
        first_time: u64,
        last_time: u64,
    }

    fn read_header(bytes: &[u8]) -> Header {
        assert_eq!(&bytes[..8], &MAGIC);
        assert_eq!(NativeEndian::read_u64(&bytes[8..16]), HEADER_SIZE);
        Header {
            data_offset: NativeEndian::read_u64(&bytes[16..24]),
            data_size: NativeEndian::read_u64(&bytes[24..32]),
            desc_offset: NativeEndian::read_u64(&bytes[32..40]),
            desc_size: NativeEndian::read_u64(&bytes[40..48]),
            event_count: NativeEndian::read_u64(&bytes[48..56]),
            first_time: NativeEndian::read_u64(&bytes[56..64]),
            last_time: NativeEndian::read_u64(&bytes[64..72]),
        }
    }

    /// Walk the data section and return `(rtype, body)` per record.
    fn read_records(bytes: &[u8], header: &Header) -> Vec<(u32, Vec<u8>)> {
        let start = header.data_offset as usize;
        let end = start + header.data_size as usize;
        let mut cursor = Cursor::new(&bytes[start..end]);
        let mut records = Vec::new();
        while (cursor.position() as usize) < end - start {
            let rtype = cursor.read_u32::<NativeEndian>().unwrap();
            let size = cursor.read_u32::<NativeEndian>().unwrap() as usize;
            assert_eq!(size % 8, 0, "records are 8-aligned");
            let mut body = vec![0u8; size - 8];
            cursor.read_exact(&mut body).unwrap();
            records.push((rtype, body));
        }
        records
    }

    #[test]
    fn finalized_file_is_self_describing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.trace");

        let mut writer = TraceFileWriter::create(&path).unwrap();
        writer.add_event_desc(42, "sched:sched_switch");
        writer.add_event_desc(1001, "user_events:MyEvent");
        writer.write_finished_init().unwrap();
        writer.write_event(0, 500, b"abc").unwrap();
        writer.write_event(1, 100, b"defgh").unwrap();
        writer.write_event(0, 900, b"").unwrap();
        writer.write_finished_round().unwrap();
        writer.finalize_and_close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = read_header(&bytes);
        assert_eq!(header.data_offset, HEADER_SIZE);
        assert_eq!(header.event_count, 3);
        assert_eq!(header.first_time, 100);
        assert_eq!(header.last_time, 900);
        assert_eq!(header.desc_offset, HEADER_SIZE + header.data_size);
        assert_eq!(
            bytes.len() as u64,
            header.desc_offset + header.desc_size
        );

        let records = read_records(&bytes, &header);
        assert_eq!(records[0].0, RECORD_FINISHED_INIT);
        assert_eq!(records.last().unwrap().0, RECORD_FINISHED_ROUND);
        let samples: Vec<_> = records
            .iter()
            .filter(|(rtype, _)| *rtype == RECORD_SAMPLE)
            .collect();
        assert_eq!(samples.len(), 3);

        // First sample: cpu 0, time 500, payload "abc".
        let body = &samples[0].1;
        assert_eq!(NativeEndian::read_u32(&body[0..4]), 0);
        assert_eq!(NativeEndian::read_u64(&body[8..16]), 500);
        let payload_len = NativeEndian::read_u32(&body[16..20]) as usize;
        assert_eq!(&body[20..20 + payload_len], b"abc");

        // Description section: count then (id, name) entries.
        let desc = &bytes[header.desc_offset as usize..];
        assert_eq!(NativeEndian::read_u32(&desc[0..4]), 2);
        assert_eq!(NativeEndian::read_u32(&desc[4..8]), 42);
        let name_len = NativeEndian::read_u32(&desc[8..12]) as usize;
        assert_eq!(&desc[12..12 + name_len], b"sched:sched_switch");
    }

    #[test]
    fn empty_file_has_zero_time_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.trace");

        let mut writer = TraceFileWriter::create(&path).unwrap();
        writer.write_finished_init().unwrap();
        writer.finalize_and_close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = read_header(&bytes);
        assert_eq!(header.event_count, 0);
        assert_eq!((header.first_time, header.last_time), (0, 0));
    }

    #[test]
    fn state_machine_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.trace");
        let mut writer = TraceFileWriter::create(&path).unwrap();
        assert_eq!(writer.state(), State::Created);

        // Nothing but init is valid while Created.
        assert!(matches!(
            writer.write_event(0, 1, b"x"),
            Err(WriterError::BadState { .. })
        ));
        assert!(matches!(
            writer.write_finished_round(),
            Err(WriterError::BadState { .. })
        ));
        assert!(matches!(
            writer.finalize_and_close(),
            Err(WriterError::BadState { .. })
        ));

        writer.write_finished_init().unwrap();
        assert_eq!(writer.state(), State::Initialized);
        // Init is once-only.
        assert!(matches!(
            writer.write_finished_init(),
            Err(WriterError::BadState { .. })
        ));

        writer.finalize_and_close().unwrap();
        assert_eq!(writer.state(), State::Finalized);
        // Everything is rejected after finalize.
        assert!(matches!(
            writer.write_event(0, 1, b"x"),
            Err(WriterError::BadState { .. })
        ));
        assert!(matches!(
            writer.finalize_and_close(),
            Err(WriterError::BadState { .. })
        ));
    }

    #[test]
    fn file_pos_tracks_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos.trace");
        let mut writer = TraceFileWriter::create(&path).unwrap();
        assert_eq!(writer.file_pos(), HEADER_SIZE);

        writer.write_finished_init().unwrap();
        assert_eq!(writer.file_pos(), HEADER_SIZE + 8);

        // 8 header + 24 body (16 fixed + 4 len + 4 payload) = 32, no pad.
        writer.write_event(0, 7, b"abcd").unwrap();
        assert_eq!(writer.file_pos(), HEADER_SIZE + 8 + 32);

        let before = writer.file_pos();
        writer.write_finished_round().unwrap();
        assert!(writer.file_pos() > before);
    }

    #[test]
    fn finalize_places_desc_at_tracked_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skewed.trace");

        let mut writer = TraceFileWriter::create(&path).unwrap();
        writer.add_event_desc(7, "sys:ev");
        writer.write_finished_init().unwrap();
        writer.write_event(0, 10, b"x").unwrap();
        // A write failure mid-record leaves the file cursor ahead of the
        // tracked position; finalize must not write the desc section there.
        writer.skew_physical_position();
        writer.finalize_and_close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = read_header(&bytes);
        assert_eq!(header.desc_offset, header.data_offset + header.data_size);
        assert_eq!(bytes.len() as u64, header.desc_offset + header.desc_size);
        let desc = &bytes[header.desc_offset as usize..];
        assert_eq!(NativeEndian::read_u32(&desc[0..4]), 1);
        assert_eq!(NativeEndian::read_u32(&desc[4..8]), 7);
    }

    #[test]
    fn unfinalized_file_keeps_zeroed_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.trace");
        let mut writer = TraceFileWriter::create(&path).unwrap();
        writer.write_finished_init().unwrap();
        writer.write_event(3, 11, b"zz").unwrap();
        drop(writer);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], &MAGIC);
        // Sections were never backpatched.
        assert!(bytes[8..HEADER_SIZE as usize].iter().all(|&b| b == 0));
        assert!(bytes.len() as u64 > HEADER_SIZE);
    }
}
