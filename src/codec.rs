//! Binary codec for the crisislog durable log files.
//!
//! This module handles serialization and deserialization of file headers, batch
//! envelopes, event records and snapshot records. It is pure data transformation -- no
//! file I/O, no async, no index management.
//!
//! Every file starts with a fixed 8-byte header (magic number + format version). Each
//! record is a length-prefixed, CRC32-checksummed frame:
//!
//! ```text
//! record_length: u32 LE   (bytes that follow, checksum included)
//! body:          [u8]     (record-kind specific)
//! crc32:         u32 LE   (over body)
//! ```
//!
//! Event record bodies carry the positional fields in fixed binary form followed by a
//! JSON document with the remaining fields. Event records are grouped into batch
//! envelopes (header + records + footer) so that a multi-event append is recovered
//! all-or-nothing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::types::{EventCategory, EventMetadata, EventStatus, StoredEvent, StreamSnapshot};

/// Magic bytes identifying an event log file (ASCII "CRLG").
pub(crate) const EVENT_LOG_MAGIC: [u8; 4] = [0x43, 0x52, 0x4C, 0x47];

/// Magic bytes identifying a snapshot log file (ASCII "CRSN").
pub(crate) const SNAPSHOT_LOG_MAGIC: [u8; 4] = [0x43, 0x52, 0x53, 0x4E];

/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;

/// Size of a file header in bytes (magic + format version).
pub(crate) const HEADER_SIZE: usize = 8;

/// Magic bytes identifying a batch header (ASCII "CRBH").
pub(crate) const BATCH_HEADER_MAGIC: [u8; 4] = [0x43, 0x52, 0x42, 0x48];

/// Magic bytes identifying a batch footer (ASCII "CRBF").
pub(crate) const BATCH_FOOTER_MAGIC: [u8; 4] = [0x43, 0x52, 0x42, 0x46];

/// Size of a batch header on disk in bytes (magic 4 + count 4 + first_position 8).
pub(crate) const BATCH_HEADER_SIZE: usize = 16;

/// Size of a batch footer on disk in bytes (magic 4 + crc 4).
pub(crate) const BATCH_FOOTER_SIZE: usize = 8;

/// Size of the length prefix field in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed-size prefix of an event record body:
/// position(8) + version(8) + timestamp(8) + event_id(16) + identity_checksum(4) = 44.
const EVENT_FIXED_SIZE: usize = 8 + 8 + 8 + 16 + 4;

/// Result of attempting to decode a value from a byte buffer.
///
/// Distinguishes between a successfully decoded value and a buffer that does not contain
/// enough bytes to form a complete frame. A truncated trailing frame is expected after an
/// unclean shutdown, whereas a checksum mismatch in the middle of a file indicates
/// corruption.
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    /// A full value was successfully decoded from the buffer.
    Complete {
        /// The decoded value.
        value: T,
        /// Total number of bytes consumed from the buffer.
        consumed: usize,
    },
    /// The buffer does not contain enough bytes to form a complete frame.
    Incomplete,
}

/// Header of a batch envelope on disk.
#[derive(Debug, PartialEq)]
pub struct BatchHeader {
    /// Number of event records in this batch.
    pub record_count: u32,
    /// Global position of the first event record in the batch.
    pub first_position: u64,
}

/// Footer of a batch envelope on disk.
///
/// Its presence at the expected offset signals that the batch was fully written before
/// any crash.
#[derive(Debug, PartialEq)]
pub struct BatchFooter {
    /// CRC32 checksum of batch header || record bytes.
    pub batch_crc: u32,
}

/// JSON part of an event record, borrowed for encoding.
#[derive(Serialize)]
struct EventBodyRef<'a> {
    stream_id: &'a str,
    stream_type: &'a str,
    event_type: &'a str,
    category: &'a EventCategory,
    data: &'a serde_json::Value,
    metadata: &'a EventMetadata,
    status: EventStatus,
    correlation_id: &'a Option<String>,
    causation_id: &'a Option<String>,
}

/// JSON part of an event record, owned for decoding.
#[derive(Deserialize)]
struct EventBody {
    stream_id: String,
    stream_type: String,
    event_type: String,
    category: EventCategory,
    data: serde_json::Value,
    metadata: EventMetadata,
    status: EventStatus,
    correlation_id: Option<String>,
    causation_id: Option<String>,
}

/// Encode a file header for the given magic.
///
/// # Arguments
///
/// * `magic` - [`EVENT_LOG_MAGIC`] or [`SNAPSHOT_LOG_MAGIC`].
pub fn encode_header(magic: [u8; 4]) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&magic);
    buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf
}

/// Decode and validate a file header against the expected magic.
///
/// # Returns
///
/// The format version on success.
///
/// # Errors
///
/// Returns [`Error::InvalidHeader`] if the magic number is wrong or the format version is
/// unsupported.
pub fn decode_header(buf: &[u8; HEADER_SIZE], magic: [u8; 4]) -> Result<u32, Error> {
    if buf[0..4] != magic {
        return Err(Error::InvalidHeader(format!(
            "wrong magic bytes: expected {}",
            String::from_utf8_lossy(&magic)
        )));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != FORMAT_VERSION {
        return Err(Error::InvalidHeader(format!(
            "unsupported format version: {version}"
        )));
    }
    Ok(version)
}

/// Wrap a record body in a length prefix and trailing CRC32.
fn frame(body: &[u8]) -> Vec<u8> {
    let record_length = body.len() + 4;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + record_length);
    buf.extend_from_slice(&(record_length as u32).to_le_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    buf
}

/// Unwrap one frame from the start of `buf`, verifying its CRC32.
fn unframe(buf: &[u8]) -> Result<DecodeOutcome<&[u8]>, Error> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }
    let record_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = LENGTH_PREFIX_SIZE + record_length;
    if buf.len() < total {
        return Ok(DecodeOutcome::Incomplete);
    }
    if record_length < 4 {
        return Err(Error::CorruptRecord {
            position: 0,
            detail: "record body too short for checksum".to_string(),
        });
    }

    let crc_offset = total - 4;
    let body = &buf[LENGTH_PREFIX_SIZE..crc_offset];
    let stored_crc = u32::from_le_bytes([
        buf[crc_offset],
        buf[crc_offset + 1],
        buf[crc_offset + 2],
        buf[crc_offset + 3],
    ]);
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(Error::CorruptRecord {
            position: 0,
            detail: format!(
                "CRC32 mismatch: stored {stored_crc:#010X}, computed {computed_crc:#010X}"
            ),
        });
    }

    Ok(DecodeOutcome::Complete {
        value: body,
        consumed: total,
    })
}

/// Sequential reader over a CRC-verified record body.
struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.offset + n > self.buf.len() {
            return Err(Error::CorruptRecord {
                position: 0,
                detail: "unexpected end of record body".to_string(),
            });
        }
        let start = self.offset;
        self.offset += n;
        Ok(&self.buf[start..self.offset])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn uuid(&mut self) -> Result<Uuid, Error> {
        let b = self.take(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(b);
        Ok(Uuid::from_bytes(arr))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.offset..];
        self.offset = self.buf.len();
        rest
    }
}

/// Encode a [`StoredEvent`] into a framed binary record.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the JSON part cannot be encoded.
pub fn encode_record(event: &StoredEvent) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(&EventBodyRef {
        stream_id: &event.stream_id,
        stream_type: &event.stream_type,
        event_type: &event.event_type,
        category: &event.category,
        data: &event.data,
        metadata: &event.metadata,
        status: event.status,
        correlation_id: &event.correlation_id,
        causation_id: &event.causation_id,
    })?;

    let mut body = Vec::with_capacity(EVENT_FIXED_SIZE + json.len());
    body.extend_from_slice(&event.position.to_le_bytes());
    body.extend_from_slice(&event.version.to_le_bytes());
    body.extend_from_slice(&event.timestamp.to_le_bytes());
    body.extend_from_slice(event.id.as_bytes());
    body.extend_from_slice(&event.checksum.to_le_bytes());
    body.extend_from_slice(&json);
    Ok(frame(&body))
}

/// Decode a single event record from the start of a byte buffer.
///
/// # Returns
///
/// [`DecodeOutcome::Complete`] with the event and bytes consumed, or
/// [`DecodeOutcome::Incomplete`] if the buffer ends mid-record.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] if the frame CRC does not match or the body is
/// malformed.
pub fn decode_record(buf: &[u8]) -> Result<DecodeOutcome<StoredEvent>, Error> {
    let (body, consumed) = match unframe(buf)? {
        DecodeOutcome::Complete { value, consumed } => (value, consumed),
        DecodeOutcome::Incomplete => return Ok(DecodeOutcome::Incomplete),
    };

    let mut cursor = Cursor::new(body);
    let position = cursor.u64()?;
    let version = cursor.u64()?;
    let timestamp = cursor.u64()?;
    let id = cursor.uuid()?;
    let checksum = cursor.u32()?;
    let json: EventBody =
        serde_json::from_slice(cursor.rest()).map_err(|e| Error::CorruptRecord {
            position,
            detail: format!("malformed event body: {e}"),
        })?;

    Ok(DecodeOutcome::Complete {
        value: StoredEvent {
            id,
            stream_id: json.stream_id,
            stream_type: json.stream_type,
            event_type: json.event_type,
            category: json.category,
            version,
            data: json.data,
            metadata: json.metadata,
            timestamp,
            status: json.status,
            correlation_id: json.correlation_id,
            causation_id: json.causation_id,
            position,
            checksum,
        },
        consumed,
    })
}

/// Encode a [`StreamSnapshot`] into a framed binary record.
///
/// Body layout: version(8) + created_at(8) + id(16) + checksum(4) + stream_id_len(2) +
/// stream_id + state_len(4) + state.
pub fn encode_snapshot(snapshot: &StreamSnapshot) -> Vec<u8> {
    let sid = snapshot.stream_id.as_bytes();
    let mut body = Vec::with_capacity(8 + 8 + 16 + 4 + 2 + sid.len() + 4 + snapshot.state.len());
    body.extend_from_slice(&snapshot.version.to_le_bytes());
    body.extend_from_slice(&snapshot.created_at.to_le_bytes());
    body.extend_from_slice(snapshot.id.as_bytes());
    body.extend_from_slice(&snapshot.checksum.to_le_bytes());
    body.extend_from_slice(&(sid.len() as u16).to_le_bytes());
    body.extend_from_slice(sid);
    body.extend_from_slice(&(snapshot.state.len() as u32).to_le_bytes());
    body.extend_from_slice(&snapshot.state);
    frame(&body)
}

/// Decode a single snapshot record from the start of a byte buffer.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] if the frame CRC does not match or the body is
/// malformed.
pub fn decode_snapshot(buf: &[u8]) -> Result<DecodeOutcome<StreamSnapshot>, Error> {
    let (body, consumed) = match unframe(buf)? {
        DecodeOutcome::Complete { value, consumed } => (value, consumed),
        DecodeOutcome::Incomplete => return Ok(DecodeOutcome::Incomplete),
    };

    let mut cursor = Cursor::new(body);
    let version = cursor.u64()?;
    let created_at = cursor.u64()?;
    let id = cursor.uuid()?;
    let checksum = cursor.u32()?;
    let sid_len = cursor.u16()? as usize;
    let stream_id = std::str::from_utf8(cursor.take(sid_len)?).map_err(|e| {
        Error::CorruptRecord {
            position: version,
            detail: format!("invalid UTF-8 in snapshot stream id: {e}"),
        }
    })?;
    let state_len = cursor.u32()? as usize;
    let state = Bytes::copy_from_slice(cursor.take(state_len)?);

    Ok(DecodeOutcome::Complete {
        value: StreamSnapshot {
            id,
            stream_id: stream_id.to_string(),
            version,
            size: state.len(),
            state,
            checksum,
            created_at,
        },
        consumed,
    })
}

/// Encode a batch header as a fixed 16-byte array.
pub fn encode_batch_header(record_count: u32, first_position: u64) -> [u8; BATCH_HEADER_SIZE] {
    let mut buf = [0u8; BATCH_HEADER_SIZE];
    buf[0..4].copy_from_slice(&BATCH_HEADER_MAGIC);
    buf[4..8].copy_from_slice(&record_count.to_le_bytes());
    buf[8..16].copy_from_slice(&first_position.to_le_bytes());
    buf
}

/// Decode a batch header from the start of a byte buffer.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] if the batch header magic bytes are wrong.
pub fn decode_batch_header(buf: &[u8]) -> Result<DecodeOutcome<BatchHeader>, Error> {
    if buf.len() < BATCH_HEADER_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }
    if buf[0..4] != BATCH_HEADER_MAGIC {
        return Err(Error::CorruptRecord {
            position: 0,
            detail: "wrong batch header magic bytes".to_string(),
        });
    }
    let record_count = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let mut pos = [0u8; 8];
    pos.copy_from_slice(&buf[8..16]);
    Ok(DecodeOutcome::Complete {
        value: BatchHeader {
            record_count,
            first_position: u64::from_le_bytes(pos),
        },
        consumed: BATCH_HEADER_SIZE,
    })
}

/// Encode a batch footer as a fixed 8-byte array.
pub fn encode_batch_footer(batch_crc: u32) -> [u8; BATCH_FOOTER_SIZE] {
    let mut buf = [0u8; BATCH_FOOTER_SIZE];
    buf[0..4].copy_from_slice(&BATCH_FOOTER_MAGIC);
    buf[4..8].copy_from_slice(&batch_crc.to_le_bytes());
    buf
}

/// Decode a batch footer from the start of a byte buffer.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] if the batch footer magic bytes are wrong.
pub fn decode_batch_footer(buf: &[u8]) -> Result<DecodeOutcome<BatchFooter>, Error> {
    if buf.len() < BATCH_FOOTER_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }
    if buf[0..4] != BATCH_FOOTER_MAGIC {
        return Err(Error::CorruptRecord {
            position: 0,
            detail: "wrong batch footer magic bytes".to_string(),
        });
    }
    let batch_crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok(DecodeOutcome::Complete {
        value: BatchFooter { batch_crc },
        consumed: BATCH_FOOTER_SIZE,
    })
}

/// Encode a full batch envelope (header || records || footer) for `events`.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if any event cannot be encoded.
pub fn encode_batch(events: &[StoredEvent]) -> Result<Vec<u8>, Error> {
    let first_position = events.first().map(|e| e.position).unwrap_or(0);
    let header = encode_batch_header(events.len() as u32, first_position);

    let mut records = Vec::new();
    for event in events {
        records.extend_from_slice(&encode_record(event)?);
    }

    // CRC32 covers the header bytes concatenated with all record bytes.
    let batch_crc = {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(&records);
        hasher.finalize()
    };

    let mut buf = Vec::with_capacity(BATCH_HEADER_SIZE + records.len() + BATCH_FOOTER_SIZE);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&records);
    buf.extend_from_slice(&encode_batch_footer(batch_crc));
    Ok(buf)
}
