use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_WAL_FRAME_BYTES;
use crate::model::Event;

/// Bytes a frame adds around its payload: length prefix and CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf`, or report a clean end of log if the file ends first.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next intact frame and its size on disk. `None` at end of log or
/// at the first torn/corrupt frame.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_WAL_FRAME_BYTES {
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
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, len as u64 + FRAME_OVERHEAD)))
}

/// Every intact event up to the first damaged frame, and the byte offset where
/// that intact prefix ends.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut good_len = 0;
    while let Some((event, size)) = decode_next(&mut reader)? {
        events.push(event);
        good_len += size;
    }
    Ok((events, good_len))
}

/// Append-only write-ahead log, one file per organization.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is cut off when the log is opened, so
///   later appends never land behind it.
/// - A batch that fails to append or flush is rolled back to the last durable length.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by successful flushes.
    durable_len: u64,
    /// Appends buffered since the last flush.
    pending: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path` and return the events it holds.
    /// Anything after the first damaged frame is truncated away.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, good_len) = read_log(path)?;
        let file = Self::open_append(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > good_len {
            warn!(
                "WAL {}: discarding {} bytes after the last intact record",
                path.display(),
                on_disk - good_len
            );
            file.set_len(good_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len: good_len,
            pending: 0,
            appends_since_compact: 0,
        };
        Ok((wal, events))
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.pending += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.durable_len = file.metadata()?.len();
        self.appends_since_compact += self.pending;
        self.pending = 0;
        Ok(())
    }

    /// Throw away everything appended since the last successful flush, both
    /// the buffered bytes and any that already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(Self::open_append(&self.path)?);
        // into_parts hands back the buffer instead of flushing it on drop.
        let (_stale, _unflushed) = std::mem::replace(&mut self.writer, fresh).into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.pending = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write the compacted log to a temp file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.pending = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the log from disk, returning every event up to the first damaged frame.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_log(path).map(|(events, _)| events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("shelf_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn append(wal: &mut Wal, event: &Event) {
        wal.append_buffered(event).unwrap();
        wal.flush_sync().unwrap();
    }

    fn asset_created() -> Event {
        Event::AssetCreated {
            id: Ulid::new(),
            title: "Camera".into(),
            available_to_book: true,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let booking = Ulid::new();
        let events = vec![
            asset_created(),
            Event::BookingSaved {
                id: booking,
                name: "Shoot".into(),
                span: Span::new(1000, 2000),
                custodian: crate::model::Custodian::TeamMember(Ulid::new()),
            },
            Event::BookingReserved { id: booking },
        ];

        {
            let mut wal = Wal::open(&path).unwrap().0;
            for e in &events {
                append(&mut wal, e);
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = asset_created();
        {
            let mut wal = Wal::open(&path).unwrap().0;
            append(&mut wal, &event);
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    fn write_raw_frame(path: &Path, event: &Event, crc: Option<u32>) {
        let payload = bincode::serialize(event).unwrap();
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&payload).unwrap();
        f.write_all(&crc.unwrap_or_else(|| crc32fast::hash(&payload)).to_le_bytes())
            .unwrap();
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = asset_created();
        {
            let mut wal = Wal::open(&path).unwrap().0;
            append(&mut wal, &good);
        }
        write_raw_frame(&path, &Event::BookingCancelled { id: Ulid::new() }, Some(0xDEADBEEF));
        // A valid frame after the damage must not be resurrected.
        write_raw_frame(&path, &asset_created(), None);

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn open_cuts_torn_tail_before_appending() {
        let path = tmp_path("torn_then_append.wal");
        let first = asset_created();
        {
            let mut wal = Wal::open(&path).unwrap().0;
            append(&mut wal, &first);
        }
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[50u8, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let second = asset_created();
        {
            let (mut wal, events) = Wal::open(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
            append(&mut wal, &second);
        }

        let (_, events) = Wal::open(&path).unwrap();
        assert_eq!(events, vec![first, second]);
    }

    #[test]
    fn open_cuts_everything_after_bad_crc() {
        let path = tmp_path("bad_crc_then_append.wal");
        let good = asset_created();
        {
            let mut wal = Wal::open(&path).unwrap().0;
            append(&mut wal, &good);
        }
        write_raw_frame(&path, &Event::BookingCancelled { id: Ulid::new() }, Some(0xDEADBEEF));
        write_raw_frame(&path, &asset_created(), None);

        let later = asset_created();
        {
            let mut wal = Wal::open(&path).unwrap().0;
            append(&mut wal, &later);
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good, later]);
    }

    #[test]
    fn oversized_frame_is_rejected_and_rolled_back() {
        let path = tmp_path("rollback.wal");
        let kept = asset_created();
        let mut wal = Wal::open(&path).unwrap().0;
        append(&mut wal, &kept);
        let durable = fs::metadata(&path).unwrap().len();

        let huge = Event::AssetCreated {
            id: Ulid::new(),
            title: "x".repeat(MAX_WAL_FRAME_BYTES + 1),
            available_to_book: true,
        };
        wal.append_buffered(&asset_created()).unwrap();
        assert!(wal.append_buffered(&huge).is_err());
        wal.rollback().unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), durable);
        assert_eq!(wal.appends_since_compact(), 1);
        let after = asset_created();
        append(&mut wal, &after);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
    }

    #[test]
    fn rollback_removes_bytes_that_reached_the_file() {
        let path = tmp_path("rollback_flushed.wal");
        let kept = asset_created();
        let mut wal = Wal::open(&path).unwrap().0;
        append(&mut wal, &kept);

        // Larger than the BufWriter capacity, so it goes straight to the file.
        let big = Event::AssetCreated {
            id: Ulid::new(),
            title: "y".repeat(64 * 1024),
            available_to_book: true,
        };
        wal.append_buffered(&big).unwrap();
        wal.rollback().unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let booking = Ulid::new();
        let mut wal = Wal::open(&path).unwrap().0;
        for _ in 0..20 {
            append(&mut wal, &Event::BookingReserved { id: booking });
        }
        assert_eq!(wal.appends_since_compact(), 20);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![asset_created()];
        Wal::write_compact_file(wal.path(), &snapshot).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = Event::BookingArchived { id: booking };
        append(&mut wal, &later);

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
        assert!(!Wal::compact_tmp_path(&path).exists());
    }

    #[test]
    fn buffered_appends_are_invisible_until_flushed() {
        let path = tmp_path("buffered.wal");
        let mut wal = Wal::open(&path).unwrap().0;
        let events: Vec<Event> = (0..5).map(|_| asset_created()).collect();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());

        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
