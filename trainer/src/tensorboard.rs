//! A minimal TensorBoard event file writer, scalars only.
//!
//! Event files are TFRecord streams of `Event` protocol buffers. Each record is
//! `len: u64 | masked_crc(len) | data | masked_crc(data)`, little endian, with
//! CRC-32C checksums.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    process,
    time::{SystemTime, UNIX_EPOCH},
};

const FILE_VERSION: &str = "brain.Event:2";
const SESSION_START: u64 = 1;
const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Appends scalar summaries to a new event file.
pub struct EventWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl EventWriter {
    /// Creates a new event file inside `dir`.
    ///
    /// # Arguments
    /// * `dir` - The directory TensorBoard is pointed at.
    /// * `purge_step` - When resuming, the first step of this session. Readers
    ///   drop every event at or after it that an earlier session wrote.
    pub fn create(dir: &Path, purge_step: Option<usize>) -> io::Result<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(io::Error::other)?;
        let base = format!(
            "events.out.tfevents.{}.snn-mixer-train.{}",
            now.as_secs(),
            process::id()
        );
        let (path, file) = create_unique(dir, &base)?;

        let mut writer = Self {
            out: BufWriter::new(file),
            path,
        };

        let mut event = event_header(0);
        put_bytes(&mut event, 3, FILE_VERSION.as_bytes());
        writer.write_record(&event)?;

        if let Some(step) = purge_step {
            let mut session_log = Vec::new();
            put_varint_field(&mut session_log, 1, SESSION_START);

            let mut event = event_header(step as u64);
            put_bytes(&mut event, 6, &session_log);
            writer.write_record(&event)?;
        }

        writer.out.flush()?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records `value` under `tag` at `step` and flushes it to disk.
    pub fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> io::Result<()> {
        let mut summary_value = Vec::new();
        put_bytes(&mut summary_value, 1, tag.as_bytes());
        summary_value.push(tag_byte(2, 5));
        summary_value.extend_from_slice(&value.to_le_bytes());

        let mut summary = Vec::new();
        put_bytes(&mut summary, 1, &summary_value);

        let mut event = event_header(step as u64);
        put_bytes(&mut event, 5, &summary);

        self.write_record(&event)?;
        self.out.flush()
    }

    fn write_record(&mut self, data: &[u8]) -> io::Result<()> {
        let len = (data.len() as u64).to_le_bytes();

        self.out.write_all(&len)?;
        self.out.write_all(&masked_crc32c(&len).to_le_bytes())?;
        self.out.write_all(data)?;
        self.out.write_all(&masked_crc32c(data).to_le_bytes())
    }
}

/// Creates `dir/base`, or `dir/base.N` for the first free `N` when sessions
/// start within the same second.
fn create_unique(dir: &Path, base: &str) -> io::Result<(PathBuf, File)> {
    let mut n = 0;
    loop {
        let name = match n {
            0 => base.to_string(),
            n => format!("{base}.{n}"),
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// An `Event` holding `wall_time` and `step`.
fn event_header(step: u64) -> Vec<u8> {
    let wall_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();

    let mut event = vec![tag_byte(1, 1)];
    event.extend_from_slice(&wall_time.to_le_bytes());
    put_varint_field(&mut event, 2, step);
    event
}

fn tag_byte(field: u8, wire_type: u8) -> u8 {
    (field << 3) | wire_type
}

fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn put_varint_field(buf: &mut Vec<u8>, field: u8, v: u64) {
    buf.push(tag_byte(field, 0));
    put_varint(buf, v);
}

fn put_bytes(buf: &mut Vec<u8>, field: u8, bytes: &[u8]) {
    buf.push(tag_byte(field, 2));
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

const fn crc32c_table() -> [u32; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ 0x82f6_3b78
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = crc32c_table();

fn crc32c(data: &[u8]) -> u32 {
    !data.iter().fold(!0u32, |crc, &b| {
        CRC32C_TABLE[((crc ^ b as u32) & 0xff) as usize] ^ (crc >> 8)
    })
}

fn masked_crc32c(data: &[u8]) -> u32 {
    crc32c(data).rotate_right(15).wrapping_add(CRC_MASK_DELTA)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    /// Splits an event file into its records, checking every checksum.
    fn records(path: &Path) -> Vec<Vec<u8>> {
        let raw = fs::read(path).unwrap();
        let mut out = Vec::new();
        let mut rest = raw.as_slice();

        while !rest.is_empty() {
            let (len, tail) = rest.split_at(8);
            let (len_crc, tail) = tail.split_at(4);
            assert_eq!(masked_crc32c(len).to_le_bytes(), len_crc);

            let n = u64::from_le_bytes(len.try_into().unwrap()) as usize;
            let (data, tail) = tail.split_at(n);
            let (data_crc, tail) = tail.split_at(4);
            assert_eq!(masked_crc32c(data).to_le_bytes(), data_crc);

            out.push(data.to_vec());
            rest = tail;
        }

        out
    }

    #[test]
    fn crc32c_check_value() {
        assert_eq!(crc32c(b"123456789"), 0xe306_9283);
        assert_eq!(crc32c(b""), 0);
    }

    #[test]
    fn header_purge_marker_and_scalars_are_framed() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = EventWriter::create(dir.path(), Some(3)).unwrap();
        writer.add_scalar("test_acc1", 0.5, 3).unwrap();

        let records = records(writer.path());
        assert_eq!(records.len(), 3);

        // wall_time (9 bytes) then step
        let version = &records[0][11..];
        assert_eq!(version[0], tag_byte(3, 2));
        assert_eq!(&version[2..], FILE_VERSION.as_bytes());

        let purge = &records[1][9..];
        assert_eq!(purge, [0x10, 3, 0x32, 2, 0x08, 1]);

        let scalar = &records[2][9..];
        let mut expected = vec![0x10, 3, 0x2a, 18, 0x0a, 16, 0x0a, 9];
        expected.extend_from_slice(b"test_acc1");
        expected.push(0x15);
        expected.extend_from_slice(&0.5f32.to_le_bytes());
        assert_eq!(scalar, expected);
    }

    #[test]
    fn sessions_in_the_same_second_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = EventWriter::create(dir.path(), None).unwrap();
        let b = EventWriter::create(dir.path(), Some(1)).unwrap();

        assert_ne!(a.path(), b.path());
        assert_eq!(records(a.path()).len(), 1);
        assert_eq!(records(b.path()).len(), 2);
    }

    #[test]
    fn large_steps_use_multi_byte_varints() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        assert_eq!(buf, [0xac, 0x02]);
    }
}
