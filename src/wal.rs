use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// File header: magic plus a format version byte.
const MAGIC: &[u8; 4] = b"VSTW";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;

/// Larger length prefixes are treated as a torn write, not an allocation request.
const MAX_RECORD_BYTES: usize = 1 << 20;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])
}

fn check_header(reader: &mut impl Read, path: &Path) -> io::Result<bool> {
    let mut header = [0u8; HEADER_LEN as usize];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        // Empty or cut off before the header finished: nothing was ever committed.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    if &header[..4] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a visitd log", path.display()),
        ));
    }
    if header[4] != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: unsupported log version {}", path.display(), header[4]),
        ));
    }
    Ok(true)
}

/// Record layout: `[u32 le: len][bincode: Event][u32 le: crc32 of payload]`.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n as usize <= MAX_RECORD_BYTES)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "event too large for the log"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Record {
    /// An intact event and the number of bytes it occupied on disk.
    Event(Event, u64),
    End,
    /// Partial, oversized, or checksum-failing record: a crash mid-write.
    Torn,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    let mut first = [0u8; 1];
    if !read_exact_or_eof(reader, &mut first)? {
        return Ok(Record::End);
    }
    len_buf[0] = first[0];
    if !read_exact_or_eof(reader, &mut len_buf[1..])? {
        return Ok(Record::Torn);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(Record::Torn);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut payload)? || !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(Record::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Torn);
    }
    let size = (len + 8) as u64;
    Ok(bincode::deserialize::<Event>(&payload).map_or(Record::Torn, |e| Record::Event(e, size)))
}

/// What a replay recovered.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// A damaged trailing record was dropped; everything before it is intact.
    pub torn_tail: bool,
    /// Byte offset just past the last intact record. Zero when the file is
    /// missing or has no complete header.
    pub valid_len: u64,
}

/// Append-only log of reservation and blackout events.
///
/// Appends go through `append_buffered` and become durable on the next
/// `flush_sync`, which lets one fsync cover a whole group of commits.
/// Pending records stay in memory until then, so a failed group can be
/// dropped with `discard_pending` without touching the file.
pub struct Wal {
    file: File,
    path: PathBuf,
    pending: Vec<u8>,
    pending_records: u64,
    /// Header plus every record that made it through `flush_sync`.
    durable_len: u64,
    /// A failed flush left bytes past `durable_len` that could not be cut off yet.
    needs_truncate: bool,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, cut off any torn tail, and open it for
    /// appending right after the last intact record.
    pub fn recover(path: &Path) -> io::Result<(Self, Replay)> {
        let replay = Self::replay(path)?;
        let wal = Self::open_at(path, replay.valid_len)?;
        Ok((wal, replay))
    }

    #[cfg(test)]
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    fn open_at(path: &Path, valid_len: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        let durable_len = if valid_len < HEADER_LEN {
            // Missing, empty, or a header cut short by a crash: nothing was committed.
            file.set_len(0)?;
            write_header(&mut file)?;
            file.sync_all()?;
            HEADER_LEN
        } else {
            if len > valid_len {
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            valid_len
        };
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_records: 0,
            durable_len,
            needs_truncate: false,
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage one record. A record that fails to encode leaves nothing behind.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.pending, event)?;
        self.pending_records += 1;
        Ok(())
    }

    /// Drop every record staged since the last successful flush.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_records = 0;
    }

    /// Write and fsync the staged records. On failure the staged records
    /// are discarded and the file is cut back to its last durable length.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.needs_truncate
            && let Err(e) = self.truncate_to_durable()
        {
            self.discard_pending();
            return Err(e);
        }
        let result = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_all());
        match result {
            Ok(()) => {
                self.durable_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_records;
                self.discard_pending();
                Ok(())
            }
            Err(e) => {
                self.discard_pending();
                self.needs_truncate = true;
                // Retried on the next flush if this fails too.
                let _ = self.truncate_to_durable();
                Err(e)
            }
        }
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        self.file.set_len(self.durable_len)?;
        self.file.sync_all()?;
        self.needs_truncate = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot of `events` beside the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        write_header(&mut writer)?;
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.needs_truncate = false;
        self.discard_pending();
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read back every intact event. A missing file is an empty log; a file
    /// with someone else's header is an error rather than silently ignored.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        if !check_header(&mut reader, path)? {
            return Ok(replay);
        }
        replay.valid_len = HEADER_LEN;
        loop {
            match read_record(&mut reader)? {
                Record::Event(event, size) => {
                    replay.events.push(event);
                    replay.valid_len += size;
                }
                Record::End => break,
                Record::Torn => {
                    replay.torn_tail = true;
                    break;
                }
            }
        }
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("visitd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(h: u32) -> Event {
        Event::ReservationCreated {
            reservation: reservation(
                "villa-42",
                SlotDateTime::new(date(2025, 10, 13), slot(h, 0)),
                ReservationStatus::Pending,
            ),
        }
    }

    fn status_changed(id: Ulid, status: ReservationStatus) -> Event {
        Event::ReservationStatusChanged {
            id,
            property_id: "villa-42".into(),
            status,
            updated_at: 2_000,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            created(9),
            Event::BlackoutAdded {
                entry: BlackoutEntry {
                    date: date(2025, 12, 25),
                    slot: None,
                    reason: Some("holiday".into()),
                    created_at: 1_000,
                },
            },
            Event::BlackoutRemoved {
                key: BlackoutKey {
                    date: date(2025, 12, 25),
                    slot: None,
                },
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert!(!replay.torn_tail);
    }

    #[test]
    fn reopen_keeps_single_header() {
        let path = tmp_path("reopen.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(9)).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(10)).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events.len(), 2);
    }

    #[test]
    fn torn_tail_is_dropped_and_reported() {
        let path = tmp_path("torn.wal");
        let event = created(9);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event]);
        assert!(replay.torn_tail);
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(9)).unwrap();
        }
        {
            let payload = bincode::serialize(&created(10)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events.len(), 1);
        assert!(replay.torn_tail);
    }

    #[test]
    fn missing_or_empty_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().events.is_empty());

        File::create(&path).unwrap();
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(!replay.torn_tail);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP\x01\x02\x03").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn compact_shrinks_log_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let base = created(9);
        let Event::ReservationCreated { reservation } = &base else {
            unreachable!()
        };
        let id = reservation.id;

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&base).unwrap();
        for _ in 0..10 {
            wal.append(&status_changed(id, ReservationStatus::Confirmed)).unwrap();
            wal.append(&status_changed(id, ReservationStatus::Pending)).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&base)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should be smaller: {after} < {before}");

        let cancelled = status_changed(id, ReservationStatus::Cancelled);
        wal.append(&cancelled).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![base, cancelled]);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (9..14).map(created).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let first = created(9);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 3]).unwrap();
        }

        let second = created(10);
        {
            let (mut wal, replay) = Wal::recover(&path).unwrap();
            assert!(replay.torn_tail);
            assert_eq!(replay.valid_len, intact_len);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
            wal.append(&second).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first, second]);
        assert!(!replay.torn_tail);
    }

    #[test]
    fn recover_rewrites_short_header() {
        let path = tmp_path("short_header.wal");
        fs::write(&path, b"VS").unwrap();
        let (mut wal, replay) = Wal::recover(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
        wal.append(&created(9)).unwrap();
        assert_eq!(Wal::replay(&path).unwrap().events.len(), 1);
    }

    #[test]
    fn discarded_records_never_reach_the_file() {
        let path = tmp_path("discard.wal");
        let kept = created(9);
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&created(11)).unwrap();
        wal.append_buffered(&created(12)).unwrap();
        wal.discard_pending();
        wal.append_buffered(&kept).unwrap();
        wal.flush_sync().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap().events, vec![kept]);
    }
}
