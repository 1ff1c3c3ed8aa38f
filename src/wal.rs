use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Record;

/// File header: name plus format version in the last byte.
const MAGIC: [u8; 8] = *b"KAIROS\x00\x01";

/// Upper bound on one encoded record. A length prefix above this is
/// treated as corruption rather than allocated.
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Entry framing: `[u32 len][bincode Record][u32 crc32]`.
fn encode_record(writer: &mut impl Write, record: &Record) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record of {} bytes exceeds WAL limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next entry and its framed size. `None` at the end of the log, at a torn
/// entry, or at the first entry that fails its checksum.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<(Record, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Record>(&payload)
        .ok()
        .map(|record| (record, (len + 8) as u64)))
}

struct Scan {
    records: Vec<Record>,
    /// Bytes up to the end of the last good entry. Zero for a file without a header.
    valid_len: u64,
}

fn scan(reader: &mut impl Read) -> io::Result<Scan> {
    let mut scan = Scan {
        records: Vec::new(),
        valid_len: 0,
    };
    let mut magic = [0u8; MAGIC.len()];
    if !read_or_eof(reader, &mut magic)? {
        return Ok(scan);
    }
    if magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a kairos WAL"));
    }
    scan.valid_len = MAGIC.len() as u64;
    while let Some((record, size)) = read_entry(reader)? {
        scan.records.push(record);
        scan.valid_len += size;
    }
    Ok(scan)
}

/// Append-only log of store mutations.
///
/// Appends are buffered and made durable together by `flush_sync`, which is
/// how the store's writer task group-commits.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open the log at `path`, creating it when missing, and return every
    /// intact record. A torn or corrupt tail is cut off so new appends
    /// follow the last good entry. A file with a foreign header is refused.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Record>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();
        let Scan { records, valid_len } = scan(&mut BufReader::new(&file))?;

        if valid_len < file_len {
            warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "truncating damaged WAL tail"
            );
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::Start(valid_len))?;
        if valid_len == 0 {
            file.write_all(&MAGIC)?;
            file.sync_all()?;
        }

        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((wal, records))
    }

    pub fn append_buffered(&mut self, record: &Record) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, records: &[Record]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&MAGIC)?;
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AvailabilityWindow, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("kairos_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn window(start: i64, end: i64) -> Record {
        Record::WindowAdded {
            window: AvailabilityWindow {
                id: Ulid::new(),
                span: Span::new(start, end),
            },
        }
    }

    fn write_all(wal: &mut Wal, records: &[Record]) {
        for r in records {
            wal.append_buffered(r).unwrap();
        }
        wal.flush_sync().unwrap();
    }

    #[test]
    fn new_log_starts_with_header() {
        let path = tmp_path("fresh.wal");
        let (_wal, records) = Wal::recover(&path).unwrap();
        assert!(records.is_empty());
        assert_eq!(fs::read(&path).unwrap(), MAGIC);
    }

    #[test]
    fn records_survive_reopen() {
        let path = tmp_path("reopen.wal");
        let records: Vec<Record> = (0..5).map(|i| window(i * 1000, i * 1000 + 500)).collect();
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            write_all(&mut wal, &records[..2]);
            assert_eq!(wal.appends_since_compact(), 2);
        }
        {
            let (mut wal, replayed) = Wal::recover(&path).unwrap();
            assert_eq!(replayed, records[..2]);
            write_all(&mut wal, &records[2..]);
        }
        assert_eq!(Wal::recover(&path).unwrap().1, records);
    }

    #[test]
    fn torn_tail_is_cut_before_new_appends() {
        let path = tmp_path("torn.wal");
        let first = window(0, 1000);
        let later = Record::BookingDeleted { id: Ulid::new() };
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            write_all(&mut wal, std::slice::from_ref(&first));
        }
        let good_len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[7u8; 6])
            .unwrap();

        {
            let (mut wal, replayed) = Wal::recover(&path).unwrap();
            assert_eq!(replayed, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
            write_all(&mut wal, std::slice::from_ref(&later));
        }
        assert_eq!(Wal::recover(&path).unwrap().1, vec![first, later]);
    }

    #[test]
    fn bad_checksum_ends_replay() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&Record::WindowRemoved { id: Ulid::new() }).unwrap();
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        let (_wal, replayed) = Wal::recover(&path).unwrap();
        assert!(replayed.is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), MAGIC.len() as u64);
    }

    #[test]
    fn oversized_length_is_not_allocated() {
        let path = tmp_path("huge_len.wal");
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        let (_wal, replayed) = Wal::recover(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn foreign_file_is_refused() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP\x01\x0e\x00 not ours").unwrap();
        let err = Wal::recover(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(fs::read(&path).unwrap(), b"PGDMP\x01\x0e\x00 not ours");
    }

    #[test]
    fn compaction_keeps_header_and_later_appends() {
        let path = tmp_path("compact.wal");
        let kept = window(0, 1000);
        let later = window(5000, 6000);
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            let churn: Vec<Record> = (0..10).map(|_| window(0, 500)).collect();
            write_all(&mut wal, &churn);
            let before = fs::metadata(&path).unwrap().len();

            Wal::write_compact_file(wal.path(), std::slice::from_ref(&kept)).unwrap();
            wal.swap_compact_file().unwrap();
            assert!(fs::metadata(&path).unwrap().len() < before);
            assert_eq!(wal.appends_since_compact(), 0);
            write_all(&mut wal, std::slice::from_ref(&later));
        }
        assert_eq!(Wal::recover(&path).unwrap().1, vec![kept, later]);
    }
}
