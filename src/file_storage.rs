//! Durable [`Storage`] backed by files in a data directory.
//!
//! Layout:
//!
//! ```text
//! <dir>/events.log              header + batch envelopes of event records
//! <dir>/snapshots.log           header + one framed record per snapshot
//! <dir>/checkpoints/<name>.json latest checkpoint of each projection
//! ```
//!
//! Event and snapshot logs are append-only and fsynced on every write. Opening a store
//! recovers each log: a torn trailing write is truncated with a warning, while corruption
//! followed by valid data is reported as [`Error::CorruptRecord`] and the open fails.
//! Checkpoints are replaced atomically by writing a temporary file and renaming it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::{self, DecodeOutcome};
use crate::error::Error;
use crate::storage::{ProjectionCheckpoint, Storage};
use crate::types::{StoredEvent, StreamSnapshot};

/// File name of the event log inside the data directory.
const EVENT_LOG_FILE: &str = "events.log";

/// File name of the snapshot log inside the data directory.
const SNAPSHOT_LOG_FILE: &str = "snapshots.log";

/// Directory holding projection checkpoint files.
const CHECKPOINT_DIR: &str = "checkpoints";

/// Location of one event record inside the event log file.
#[derive(Debug, Clone, Copy)]
struct RecordSlot {
    offset: u64,
    len: u32,
}

/// File-backed [`Storage`].
///
/// Keeps only the byte offset of every event record in memory; event bodies are read
/// back from the log file on demand.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    events: File,
    snapshots: File,
    /// `slots[p - 1]` locates the record for global position `p`.
    slots: Vec<RecordSlot>,
}

/// Check whether a valid batch header exists in `data` after byte offset `start`.
///
/// A decodable batch header past a corrupt region means the corruption is not at the
/// tail of the file.
fn has_valid_batch_after(data: &[u8], start: usize) -> bool {
    for probe in (start + 1)..data.len() {
        if let Ok(DecodeOutcome::Complete { .. }) = codec::decode_batch_header(&data[probe..]) {
            return true;
        }
    }
    false
}

/// Truncate a log file to `len` bytes and fsync it.
fn truncate_file(path: &Path, len: usize) -> Result<(), Error> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    file.set_len(len as u64)?;
    file.sync_all()?;
    Ok(())
}

/// Open an existing log file or create it with the given header.
///
/// Returns the opened file and, for an existing file, its full contents.
fn open_or_create(path: &Path, magic: [u8; 4]) -> Result<(File, Option<Vec<u8>>), Error> {
    if !path.exists() {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&codec::encode_header(magic))?;
        file.sync_all()?;
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
        return Ok((file, None));
    }

    let data = std::fs::read(path)?;
    if data.len() < codec::HEADER_SIZE {
        return Err(Error::InvalidHeader(format!(
            "{}: file too short for header: {} bytes",
            path.display(),
            data.len()
        )));
    }
    let header: &[u8; codec::HEADER_SIZE] = data[..codec::HEADER_SIZE]
        .try_into()
        .expect("slice is exactly HEADER_SIZE bytes");
    codec::decode_header(header, magic)?;

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    Ok((file, Some(data)))
}

/// Recover the record slots from the contents of an event log.
///
/// Returns the slots of every event in a complete, CRC-valid batch, and the byte
/// offset to truncate to if a torn tail was found.
fn recover_events(data: &[u8]) -> Result<(Vec<RecordSlot>, Option<usize>), Error> {
    let mut slots = Vec::new();
    let mut offset = codec::HEADER_SIZE;

    while offset < data.len() {
        let batch_start = offset;

        let header = match codec::decode_batch_header(&data[offset..]) {
            Ok(DecodeOutcome::Complete { value, consumed }) => {
                offset += consumed;
                value
            }
            Ok(DecodeOutcome::Incomplete) => return Ok((slots, Some(batch_start))),
            Err(Error::CorruptRecord { .. }) => {
                if has_valid_batch_after(data, batch_start) {
                    return Err(Error::CorruptRecord {
                        position: slots.len() as u64 + 1,
                        detail: "mid-file corruption: valid batch follows corrupt data"
                            .to_string(),
                    });
                }
                return Ok((slots, Some(batch_start)));
            }
            Err(e) => return Err(e),
        };

        let mut batch_slots = Vec::with_capacity(header.record_count as usize);
        for i in 0..header.record_count {
            match codec::decode_record(&data[offset..]) {
                Ok(DecodeOutcome::Complete { value, consumed }) => {
                    let expected = header.first_position + u64::from(i);
                    if value.position != expected || expected != (slots.len() + batch_slots.len()) as u64 + 1 {
                        return Err(Error::CorruptRecord {
                            position: value.position,
                            detail: format!("out-of-order record: expected position {expected}"),
                        });
                    }
                    batch_slots.push(RecordSlot {
                        offset: offset as u64,
                        len: consumed as u32,
                    });
                    offset += consumed;
                }
                Ok(DecodeOutcome::Incomplete) | Err(Error::CorruptRecord { .. }) => {
                    return Ok((slots, Some(batch_start)));
                }
                Err(e) => return Err(e),
            }
        }

        let footer = match codec::decode_batch_footer(&data[offset..]) {
            Ok(DecodeOutcome::Complete { value, consumed }) => {
                offset += consumed;
                value
            }
            Ok(DecodeOutcome::Incomplete) | Err(Error::CorruptRecord { .. }) => {
                return Ok((slots, Some(batch_start)));
            }
            Err(e) => return Err(e),
        };

        let computed = crc32fast::hash(&data[batch_start..offset - codec::BATCH_FOOTER_SIZE]);
        if footer.batch_crc != computed {
            return Ok((slots, Some(batch_start)));
        }

        slots.extend(batch_slots);
    }

    Ok((slots, None))
}

/// Decode every snapshot in a snapshot log's contents.
///
/// Returns the snapshots and the byte offset to truncate to if a torn tail was found.
fn recover_snapshots(data: &[u8]) -> Result<(Vec<StreamSnapshot>, Option<usize>), Error> {
    let mut snapshots = Vec::new();
    let mut offset = codec::HEADER_SIZE;

    while offset < data.len() {
        match codec::decode_snapshot(&data[offset..]) {
            Ok(DecodeOutcome::Complete { value, consumed }) => {
                offset += consumed;
                snapshots.push(value);
            }
            Ok(DecodeOutcome::Incomplete) => return Ok((snapshots, Some(offset))),
            Err(Error::CorruptRecord { detail, .. }) => {
                // A corrupt frame is only a torn tail if it is the last thing in the file.
                let frame_len = u32::from_le_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ]) as usize;
                if offset + 4 + frame_len < data.len() {
                    return Err(Error::CorruptRecord {
                        position: snapshots.len() as u64 + 1,
                        detail: format!("snapshot log mid-file corruption: {detail}"),
                    });
                }
                return Ok((snapshots, Some(offset)));
            }
            Err(e) => return Err(e),
        }
    }

    Ok((snapshots, None))
}

/// Check that a projection name is safe to use as a file name.
fn checkpoint_file_name(name: &str) -> Result<String, Error> {
    let safe = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.".contains(c));
    if !safe {
        return Err(Error::Validation(format!(
            "projection name {name:?} cannot be used as a checkpoint file name"
        )));
    }
    Ok(format!("{name}.json"))
}

impl FileStorage {
    /// Open or create a file store in `dir`.
    ///
    /// Creates the directory and both log files if needed. Existing logs are validated
    /// and recovered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if files cannot be created or read,
    /// [`Error::InvalidHeader`] if a log has a bad header, and
    /// [`Error::CorruptRecord`] if mid-file corruption is detected.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join(CHECKPOINT_DIR))?;

        let events_path = dir.join(EVENT_LOG_FILE);
        let (events, data) = open_or_create(&events_path, codec::EVENT_LOG_MAGIC)?;
        let mut slots = Vec::new();
        if let Some(data) = data {
            let (recovered, truncate_to) = recover_events(&data)?;
            if let Some(len) = truncate_to {
                tracing::warn!(
                    path = %events_path.display(),
                    offset = len,
                    valid_events = recovered.len(),
                    "truncating torn tail of event log"
                );
                truncate_file(&events_path, len)?;
            }
            slots = recovered;
        }

        let snapshots_path = dir.join(SNAPSHOT_LOG_FILE);
        let (snapshots, data) = open_or_create(&snapshots_path, codec::SNAPSHOT_LOG_MAGIC)?;
        if let Some(data) = data {
            let (recovered, truncate_to) = recover_snapshots(&data)?;
            if let Some(len) = truncate_to {
                tracing::warn!(
                    path = %snapshots_path.display(),
                    offset = len,
                    valid_snapshots = recovered.len(),
                    "truncating torn tail of snapshot log"
                );
                truncate_file(&snapshots_path, len)?;
            }
        }

        tracing::info!(dir = %dir.display(), events = slots.len(), "file storage opened");

        Ok(Self {
            dir,
            events,
            snapshots,
            slots,
        })
    }

    /// Number of events in the log.
    pub fn event_count(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Current byte length of the event log file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the metadata syscall fails.
    pub fn log_file_len(&self) -> Result<u64, Error> {
        Ok(self.events.metadata()?.len())
    }

    fn checkpoint_path(&self, name: &str) -> Result<PathBuf, Error> {
        Ok(self.dir.join(CHECKPOINT_DIR).join(checkpoint_file_name(name)?))
    }
}

impl Storage for FileStorage {
    fn append(&mut self, events: &[StoredEvent]) -> Result<(), Error> {
        if events.is_empty() {
            return Ok(());
        }
        let expected = self.slots.len() as u64 + 1;
        if events[0].position != expected {
            return Err(Error::CorruptRecord {
                position: events[0].position,
                detail: format!("non-contiguous append: expected position {expected}"),
            });
        }

        let batch = codec::encode_batch(events)?;

        let batch_offset = self.events.seek(SeekFrom::End(0))?;
        self.events.write_all(&batch)?;
        self.events.sync_all()?;

        // Record offsets only after the batch is durable.
        let mut offset = batch_offset + codec::BATCH_HEADER_SIZE as u64;
        for event in events {
            let len = codec::encode_record(event)?.len() as u32;
            self.slots.push(RecordSlot { offset, len });
            offset += u64::from(len);
        }
        Ok(())
    }

    fn read_range(&self, from_position: u64, max_count: usize) -> Result<Vec<StoredEvent>, Error> {
        let len = self.slots.len();
        let start = (from_position.max(1) - 1).min(len as u64) as usize;
        let end = start.saturating_add(max_count).min(len);
        if start >= end {
            return Ok(Vec::new());
        }

        // Records of one range may span batch envelopes, so read the whole byte span
        // and decode each record at its own offset.
        let span_start = self.slots[start].offset;
        let last = self.slots[end - 1];
        let span_len = (last.offset + u64::from(last.len) - span_start) as usize;
        let mut buf = vec![0u8; span_len];
        let mut file = &self.events;
        file.seek(SeekFrom::Start(span_start))?;
        file.read_exact(&mut buf)?;

        let mut events = Vec::with_capacity(end - start);
        for (i, slot) in self.slots[start..end].iter().enumerate() {
            let at = (slot.offset - span_start) as usize;
            let event = match codec::decode_record(&buf[at..at + slot.len as usize])? {
                DecodeOutcome::Complete { value, .. } => value,
                DecodeOutcome::Incomplete => {
                    return Err(Error::CorruptRecord {
                        position: (start + i) as u64 + 1,
                        detail: "record shorter than its index entry".to_string(),
                    });
                }
            };
            event.verify_checksum()?;
            events.push(event);
        }
        Ok(events)
    }

    fn write_snapshot(&mut self, snapshot: &StreamSnapshot) -> Result<(), Error> {
        let record = codec::encode_snapshot(snapshot);
        self.snapshots.seek(SeekFrom::End(0))?;
        self.snapshots.write_all(&record)?;
        self.snapshots.sync_all()?;
        Ok(())
    }

    fn read_snapshots(&self) -> Result<Vec<StreamSnapshot>, Error> {
        let data = std::fs::read(self.dir.join(SNAPSHOT_LOG_FILE))?;
        let (snapshots, _) = recover_snapshots(&data)?;
        Ok(snapshots)
    }

    fn write_checkpoint(&mut self, checkpoint: &ProjectionCheckpoint) -> Result<(), Error> {
        let path = self.checkpoint_path(&checkpoint.name)?;
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn read_checkpoint(&self, name: &str) -> Result<Option<ProjectionCheckpoint>, Error> {
        let path = self.checkpoint_path(name)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventCategory, EventMetadata, EventStatus, identity_checksum};
    use bytes::Bytes;
    use serde_json::json;
    use uuid::Uuid;

    fn make_event(position: u64, stream_id: &str, version: u64) -> StoredEvent {
        let id = Uuid::new_v4();
        StoredEvent {
            id,
            stream_id: stream_id.to_string(),
            stream_type: "alert".to_string(),
            event_type: "AlertCreated".to_string(),
            category: EventCategory::Domain,
            version,
            data: json!({"n": position}),
            metadata: EventMetadata::default(),
            timestamp: 1_000 + position,
            status: EventStatus::Committed,
            correlation_id: None,
            causation_id: None,
            position,
            checksum: identity_checksum(&id, stream_id, version, position, "AlertCreated"),
        }
    }

    fn events_path(dir: &Path) -> PathBuf {
        dir.join(EVENT_LOG_FILE)
    }

    #[test]
    fn open_creates_files_with_headers() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let storage = FileStorage::open(dir.path()).expect("open should succeed");
        assert_eq!(storage.event_count(), 0);
        assert_eq!(
            storage.log_file_len().expect("len"),
            codec::HEADER_SIZE as u64
        );
        let data = std::fs::read(dir.path().join(SNAPSHOT_LOG_FILE)).expect("read");
        assert_eq!(&data[0..4], b"CRSN");
        assert!(dir.path().join(CHECKPOINT_DIR).is_dir());
    }

    #[test]
    fn appended_batches_survive_reopen() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        {
            let mut storage = FileStorage::open(dir.path()).expect("open");
            storage
                .append(&[make_event(1, "alert-1", 1), make_event(2, "alert-1", 2)])
                .expect("append");
            storage
                .append(&[make_event(3, "triage-9", 1)])
                .expect("append");
        }

        let storage = FileStorage::open(dir.path()).expect("reopen");
        assert_eq!(storage.event_count(), 3);
        let events = storage.read_range(1, 10).expect("read");
        let positions: Vec<u64> = events.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(events[2].stream_id, "triage-9");
        assert_eq!(events[1].data, json!({"n": 2}));
    }

    #[test]
    fn read_range_spans_batches_and_clamps() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let mut storage = FileStorage::open(dir.path()).expect("open");
        for p in 1..=5 {
            storage
                .append(&[make_event(p, "alert-1", p)])
                .expect("append");
        }
        let middle = storage.read_range(2, 3).expect("read");
        assert_eq!(
            middle.iter().map(|e| e.position).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(storage.read_range(0, 1).expect("read")[0].position, 1);
        assert!(storage.read_range(6, 10).expect("read").is_empty());
        assert_eq!(storage.read_range(5, 100).expect("read").len(), 1);
    }

    #[test]
    fn non_contiguous_append_is_rejected() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let mut storage = FileStorage::open(dir.path()).expect("open");
        assert!(matches!(
            storage.append(&[make_event(2, "alert-1", 1)]),
            Err(Error::CorruptRecord { .. })
        ));
    }

    #[test]
    fn recovery_truncates_torn_trailing_batch() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let good_len = {
            let mut storage = FileStorage::open(dir.path()).expect("open");
            storage
                .append(&[make_event(1, "alert-1", 1)])
                .expect("append");
            let good_len = storage.log_file_len().expect("len");
            storage
                .append(&[make_event(2, "alert-1", 2), make_event(3, "alert-1", 3)])
                .expect("append");
            good_len
        };

        // Chop the last batch in half to simulate a crash mid-write.
        let path = events_path(dir.path());
        let full_len = std::fs::metadata(&path).expect("metadata").len();
        let file = OpenOptions::new().write(true).open(&path).expect("open");
        file.set_len(good_len + (full_len - good_len) / 2)
            .expect("set_len");
        drop(file);

        let storage = FileStorage::open(dir.path()).expect("recovery should succeed");
        assert_eq!(storage.event_count(), 1);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), good_len);

        // The log accepts new appends at the recovered position.
        let mut storage = storage;
        storage
            .append(&[make_event(2, "alert-1", 2)])
            .expect("append after recovery");
        assert_eq!(storage.read_range(1, 10).expect("read").len(), 2);
    }

    #[test]
    fn recovery_truncates_trailing_garbage() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        {
            let mut storage = FileStorage::open(dir.path()).expect("open");
            storage
                .append(&[make_event(1, "alert-1", 1)])
                .expect("append");
        }
        let path = events_path(dir.path());
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(&[0xAB; 11]).expect("write garbage");
        drop(file);

        let storage = FileStorage::open(dir.path()).expect("recovery should succeed");
        assert_eq!(storage.event_count(), 1);
    }

    #[test]
    fn recovery_rejects_mid_file_corruption() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        {
            let mut storage = FileStorage::open(dir.path()).expect("open");
            storage
                .append(&[make_event(1, "alert-1", 1)])
                .expect("append");
            storage
                .append(&[make_event(2, "alert-1", 2)])
                .expect("append");
        }
        let path = events_path(dir.path());
        let mut data = std::fs::read(&path).expect("read");
        // Break the first batch header magic; the second batch is still intact.
        data[codec::HEADER_SIZE] ^= 0xFF;
        std::fs::write(&path, &data).expect("write");

        match FileStorage::open(dir.path()) {
            Err(Error::CorruptRecord { detail, .. }) => {
                assert!(detail.contains("mid-file"), "got: {detail}")
            }
            other => panic!("expected CorruptRecord, got: {other:?}"),
        }
    }

    #[test]
    fn open_rejects_wrong_magic() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        std::fs::write(events_path(dir.path()), b"NOPE\x01\x00\x00\x00").expect("write");
        assert!(matches!(
            FileStorage::open(dir.path()),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn open_rejects_file_shorter_than_header() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        std::fs::write(events_path(dir.path()), b"CRL").expect("write");
        assert!(matches!(
            FileStorage::open(dir.path()),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn snapshots_survive_reopen_in_creation_order() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        {
            let mut storage = FileStorage::open(dir.path()).expect("open");
            storage
                .write_snapshot(&StreamSnapshot::new("alert-1", 1, Bytes::from_static(b"a")))
                .expect("write");
            storage
                .write_snapshot(&StreamSnapshot::new("alert-1", 2, Bytes::from_static(b"bb")))
                .expect("write");
        }
        let storage = FileStorage::open(dir.path()).expect("reopen");
        let snapshots = storage.read_snapshots().expect("read");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].version, 1);
        assert_eq!(snapshots[1].state, Bytes::from_static(b"bb"));
    }

    #[test]
    fn snapshot_with_bad_state_checksum_is_still_read() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let mut storage = FileStorage::open(dir.path()).expect("open");
        let mut tampered = StreamSnapshot::new("alert-1", 1, Bytes::from_static(b"a"));
        tampered.checksum ^= 1;
        storage.write_snapshot(&tampered).expect("write");

        let snapshots = storage.read_snapshots().expect("read");
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].verify_checksum().is_err());
    }

    #[test]
    fn snapshot_log_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        {
            let mut storage = FileStorage::open(dir.path()).expect("open");
            storage
                .write_snapshot(&StreamSnapshot::new("alert-1", 1, Bytes::from_static(b"a")))
                .expect("write");
        }
        let path = dir.path().join(SNAPSHOT_LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(&[0x30, 0x00, 0x00, 0x00, 0x01]).expect("write");
        drop(file);

        let storage = FileStorage::open(dir.path()).expect("recovery should succeed");
        assert_eq!(storage.read_snapshots().expect("read").len(), 1);
    }

    #[test]
    fn checkpoint_write_replaces_and_reads_back() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let mut storage = FileStorage::open(dir.path()).expect("open");
        let mut checkpoint = ProjectionCheckpoint {
            name: "open-alerts".to_string(),
            position: 4,
            state: json!({"open": 1}),
            events_processed: 4,
            written_at: 10,
        };
        storage.write_checkpoint(&checkpoint).expect("write");
        checkpoint.position = 9;
        storage.write_checkpoint(&checkpoint).expect("write");

        let loaded = storage
            .read_checkpoint("open-alerts")
            .expect("read")
            .expect("checkpoint exists");
        assert_eq!(loaded, checkpoint);
        assert!(storage.read_checkpoint("unknown").expect("read").is_none());
        assert!(!dir
            .path()
            .join(CHECKPOINT_DIR)
            .join("open-alerts.json.tmp")
            .exists());
    }

    #[test]
    fn checkpoint_rejects_path_like_names() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let storage = FileStorage::open(dir.path()).expect("open");
        for bad in ["../escape", ".hidden", "a/b", ""] {
            assert!(
                matches!(storage.read_checkpoint(bad), Err(Error::Validation(_))),
                "name {bad:?} should be rejected"
            );
        }
    }
}
