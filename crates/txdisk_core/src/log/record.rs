//! Log entry types and serialization.
//!
//! Each entry is framed as:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload | crc32 (4) |
//! ```
//!
//! All integers are little-endian and the CRC covers header and payload.

use crate::error::{TxError, TxResult};
use crate::events::{EventMask, FileStateChangeEvent};
use crate::path::ResourcePath;
use crate::types::TransactionIdentifier;

/// Magic bytes identifying a log entry.
pub const LOG_MAGIC: [u8; 4] = *b"TXLG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub const HEADER_SIZE: usize = 11;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

/// Type of log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntryType {
    /// The transaction's effects are durable and it voted to commit.
    Prepare = 1,
    /// The commit decision.
    Commit = 2,
    /// The rollback decision for a prepared transaction.
    Rollback = 3,
    /// Events raised by a committing transaction.
    EventEnqueue = 4,
    /// An event consumed by a dequeue branch.
    EventDequeue = 5,
    /// Progress marker while applying committed effects.
    Checkpoint = 6,
    /// The transaction is finished and owns no log space.
    Completed = 7,
}

impl EntryType {
    /// Converts a byte to an entry type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Prepare),
            2 => Some(Self::Commit),
            3 => Some(Self::Rollback),
            4 => Some(Self::EventEnqueue),
            5 => Some(Self::EventDequeue),
            6 => Some(Self::Checkpoint),
            7 => Some(Self::Completed),
            _ => None,
        }
    }

    /// Converts the entry type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Upper-case name used by inspection tools.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Prepare => "PREPARE",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::EventEnqueue => "EVENT_ENQUEUE",
            Self::EventDequeue => "EVENT_DEQUEUE",
            Self::Checkpoint => "CHECKPOINT",
            Self::Completed => "COMPLETED",
        }
    }
}

/// A change to the managed tree, replayable any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Create an empty file, truncating one that exists.
    CreateFile {
        /// Target path.
        path: ResourcePath,
    },
    /// Create a directory if missing.
    CreateDir {
        /// Target path.
        path: ResourcePath,
    },
    /// Remove a file or directory tree if present.
    Delete {
        /// Target path.
        path: ResourcePath,
    },
    /// Rename a file or directory.
    Move {
        /// Current path.
        source: ResourcePath,
        /// New path.
        destination: ResourcePath,
    },
    /// Write bytes at an offset.
    Write {
        /// Target file.
        path: ResourcePath,
        /// Position of the first byte.
        offset: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Shrink a file.
    Truncate {
        /// Target file.
        path: ResourcePath,
        /// New length.
        length: u64,
    },
}

impl Effect {
    const CREATE_FILE: u8 = 1;
    const CREATE_DIR: u8 = 2;
    const DELETE: u8 = 3;
    const MOVE: u8 = 4;
    const WRITE: u8 = 5;
    const TRUNCATE: u8 = 6;

    /// Paths whose resource locks the effect depends on.
    #[must_use]
    pub fn paths(&self) -> Vec<&ResourcePath> {
        match self {
            Self::CreateFile { path }
            | Self::CreateDir { path }
            | Self::Delete { path }
            | Self::Write { path, .. }
            | Self::Truncate { path, .. } => vec![path],
            Self::Move {
                source,
                destination,
            } => vec![source, destination],
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> TxResult<()> {
        match self {
            Self::CreateFile { path } => {
                buf.push(Self::CREATE_FILE);
                put_path(buf, path)?;
            }
            Self::CreateDir { path } => {
                buf.push(Self::CREATE_DIR);
                put_path(buf, path)?;
            }
            Self::Delete { path } => {
                buf.push(Self::DELETE);
                put_path(buf, path)?;
            }
            Self::Move {
                source,
                destination,
            } => {
                buf.push(Self::MOVE);
                put_path(buf, source)?;
                put_path(buf, destination)?;
            }
            Self::Write { path, offset, data } => {
                buf.push(Self::WRITE);
                put_path(buf, path)?;
                buf.extend_from_slice(&offset.to_le_bytes());
                let len = u32::try_from(data.len()).map_err(|_| {
                    TxError::invalid_argument(format!("write of {} bytes is too large to log", data.len()))
                })?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(data);
            }
            Self::Truncate { path, length } => {
                buf.push(Self::TRUNCATE);
                put_path(buf, path)?;
                buf.extend_from_slice(&length.to_le_bytes());
            }
        }
        Ok(())
    }

    fn decode(reader: &mut PayloadReader<'_>) -> TxResult<Self> {
        let tag = reader.u8()?;
        Ok(match tag {
            Self::CREATE_FILE => Self::CreateFile { path: reader.path()? },
            Self::CREATE_DIR => Self::CreateDir { path: reader.path()? },
            Self::DELETE => Self::Delete { path: reader.path()? },
            Self::MOVE => Self::Move {
                source: reader.path()?,
                destination: reader.path()?,
            },
            Self::WRITE => {
                let path = reader.path()?;
                let offset = reader.u64()?;
                let len = reader.u32()? as usize;
                let data = reader.bytes(len)?.to_vec();
                Self::Write { path, offset, data }
            }
            Self::TRUNCATE => Self::Truncate {
                path: reader.path()?,
                length: reader.u64()?,
            },
            other => return Err(reader.corrupt(format!("unknown effect tag {other}"))),
        })
    }
}

/// An event together with its queue id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    /// Engine-wide event id.
    pub id: u64,
    /// The event.
    pub event: FileStateChangeEvent,
}

/// One entry in the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Prepare vote carrying all effects.
    Prepare {
        /// Transaction.
        ident: TransactionIdentifier,
        /// Effects to apply on commit.
        effects: Vec<Effect>,
    },
    /// Commit decision. One-phase commits carry their effects here;
    /// a commit after prepare carries none.
    Commit {
        /// Transaction.
        ident: TransactionIdentifier,
        /// Effects for one-phase commits.
        effects: Vec<Effect>,
    },
    /// Rollback decision after prepare.
    Rollback {
        /// Transaction.
        ident: TransactionIdentifier,
    },
    /// Events raised by the transaction, live once it commits.
    EventEnqueue {
        /// Raising transaction.
        ident: TransactionIdentifier,
        /// Events with their ids.
        events: Vec<QueuedEvent>,
    },
    /// Dequeue vote of a delivery branch.
    EventDequeue {
        /// Delivery branch.
        ident: TransactionIdentifier,
        /// Consumed event.
        event_id: u64,
    },
    /// Every effect before `applied` is on disk.
    Checkpoint {
        /// Transaction.
        ident: TransactionIdentifier,
        /// Number of effects fully applied.
        applied: u32,
    },
    /// Terminal marker.
    Completed {
        /// Transaction.
        ident: TransactionIdentifier,
    },
}

impl LogEntry {
    /// Maximum payload size representable in the length field.
    pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

    /// Returns the entry type.
    #[must_use]
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Prepare { .. } => EntryType::Prepare,
            Self::Commit { .. } => EntryType::Commit,
            Self::Rollback { .. } => EntryType::Rollback,
            Self::EventEnqueue { .. } => EntryType::EventEnqueue,
            Self::EventDequeue { .. } => EntryType::EventDequeue,
            Self::Checkpoint { .. } => EntryType::Checkpoint,
            Self::Completed { .. } => EntryType::Completed,
        }
    }

    /// Returns the transaction the entry belongs to.
    #[must_use]
    pub fn ident(&self) -> &TransactionIdentifier {
        match self {
            Self::Prepare { ident, .. }
            | Self::Commit { ident, .. }
            | Self::Rollback { ident }
            | Self::EventEnqueue { ident, .. }
            | Self::EventDequeue { ident, .. }
            | Self::Checkpoint { ident, .. }
            | Self::Completed { ident } => ident,
        }
    }

    /// Serializes the payload (without framing).
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidArgument`] if a path or write is too large
    /// for its length field.
    pub fn encode_payload(&self) -> TxResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.ident().encode_into(&mut buf);

        match self {
            Self::Prepare { effects, .. } | Self::Commit { effects, .. } => {
                put_count(&mut buf, effects.len())?;
                for effect in effects {
                    effect.encode_into(&mut buf)?;
                }
            }
            Self::EventEnqueue { events, .. } => {
                put_count(&mut buf, events.len())?;
                for queued in events {
                    buf.extend_from_slice(&queued.id.to_le_bytes());
                    put_path(&mut buf, &queued.event.path)?;
                    buf.push(u8::from(queued.event.is_directory));
                    buf.push(queued.event.event_type.bits());
                }
            }
            Self::EventDequeue { event_id, .. } => {
                buf.extend_from_slice(&event_id.to_le_bytes());
            }
            Self::Checkpoint { applied, .. } => {
                buf.extend_from_slice(&applied.to_le_bytes());
            }
            Self::Rollback { .. } | Self::Completed { .. } => {}
        }

        if buf.len() > Self::MAX_PAYLOAD_SIZE {
            return Err(TxError::invalid_argument(format!(
                "log entry payload of {} bytes exceeds the frame limit",
                buf.len()
            )));
        }
        Ok(buf)
    }

    /// Deserializes an entry from its type and payload.
    ///
    /// `segment` and `offset` locate the entry for error messages.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::LogCorruption`] on malformed or trailing bytes.
    pub fn decode_payload(
        entry_type: EntryType,
        payload: &[u8],
        segment: u64,
        offset: u64,
    ) -> TxResult<Self> {
        let mut reader = PayloadReader {
            payload,
            cursor: 0,
            segment,
            offset,
        };
        let (ident, used) = TransactionIdentifier::decode_prefix(payload)
            .map_err(|_| reader.corrupt("malformed transaction identifier"))?;
        reader.cursor = used;

        let entry = match entry_type {
            EntryType::Prepare | EntryType::Commit => {
                let count = reader.u32()?;
                let mut effects = Vec::new();
                for _ in 0..count {
                    effects.push(Effect::decode(&mut reader)?);
                }
                if entry_type == EntryType::Prepare {
                    Self::Prepare { ident, effects }
                } else {
                    Self::Commit { ident, effects }
                }
            }
            EntryType::Rollback => Self::Rollback { ident },
            EntryType::EventEnqueue => {
                let count = reader.u32()?;
                let mut events = Vec::new();
                for _ in 0..count {
                    let id = reader.u64()?;
                    let path = reader.path()?;
                    let is_directory = reader.u8()? != 0;
                    let event_type = EventMask::from_bits(reader.u8()?);
                    events.push(QueuedEvent {
                        id,
                        event: FileStateChangeEvent::new(path, is_directory, event_type),
                    });
                }
                Self::EventEnqueue { ident, events }
            }
            EntryType::EventDequeue => Self::EventDequeue {
                ident,
                event_id: reader.u64()?,
            },
            EntryType::Checkpoint => Self::Checkpoint {
                ident,
                applied: reader.u32()?,
            },
            EntryType::Completed => Self::Completed { ident },
        };

        if reader.cursor != payload.len() {
            return Err(reader.corrupt(format!(
                "trailing bytes in {} entry: expected {} bytes, got {}",
                entry_type.name(),
                reader.cursor,
                payload.len()
            )));
        }
        Ok(entry)
    }

    /// Serializes the full frame.
    ///
    /// # Errors
    ///
    /// Propagates [`encode_payload`](Self::encode_payload) errors.
    pub fn encode_frame(&self) -> TxResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&LOG_MAGIC);
        frame.extend_from_slice(&LOG_VERSION.to_le_bytes());
        frame.push(self.entry_type().as_byte());
        // bounded by MAX_PAYLOAD_SIZE in encode_payload
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

fn put_count(buf: &mut Vec<u8>, count: usize) -> TxResult<()> {
    let count = u32::try_from(count).map_err(|_| TxError::invalid_argument("too many items in one log entry"))?;
    buf.extend_from_slice(&count.to_le_bytes());
    Ok(())
}

fn put_path(buf: &mut Vec<u8>, path: &ResourcePath) -> TxResult<()> {
    let bytes = path.as_str().as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| TxError::invalid_argument(format!("path too long to log: {path}")))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
    segment: u64,
    offset: u64,
}

impl<'a> PayloadReader<'a> {
    fn corrupt(&self, message: impl Into<String>) -> TxError {
        TxError::log_corruption(self.segment, self.offset, message)
    }

    fn bytes(&mut self, len: usize) -> TxResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| self.corrupt("unexpected end of payload"))?;
        let slice = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn u8(&mut self) -> TxResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> TxResult<u16> {
        let raw: [u8; 2] = self.bytes(2)?.try_into().map_err(|_| self.corrupt("invalid u16"))?;
        Ok(u16::from_le_bytes(raw))
    }

    fn u32(&mut self) -> TxResult<u32> {
        let raw: [u8; 4] = self.bytes(4)?.try_into().map_err(|_| self.corrupt("invalid u32"))?;
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> TxResult<u64> {
        let raw: [u8; 8] = self.bytes(8)?.try_into().map_err(|_| self.corrupt("invalid u64"))?;
        Ok(u64::from_le_bytes(raw))
    }

    fn path(&mut self) -> TxResult<ResourcePath> {
        let len = usize::from(self.u16()?);
        let raw = self.bytes(len)?;
        let text = std::str::from_utf8(raw).map_err(|_| self.corrupt("path is not UTF-8"))?;
        ResourcePath::parse(text).map_err(|_| self.corrupt(format!("invalid path {text:?}")))
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Xid;
    use proptest::prelude::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn roundtrip(entry: &LogEntry) -> LogEntry {
        let payload = entry.encode_payload().unwrap();
        LogEntry::decode_payload(entry.entry_type(), &payload, 0, 0).unwrap()
    }

    #[test]
    fn entry_type_bytes() {
        for t in [
            EntryType::Prepare,
            EntryType::Commit,
            EntryType::Rollback,
            EntryType::EventEnqueue,
            EntryType::EventDequeue,
            EntryType::Checkpoint,
            EntryType::Completed,
        ] {
            assert_eq!(EntryType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(EntryType::from_byte(0), None);
        assert_eq!(EntryType::from_byte(8), None);
    }

    #[test]
    fn prepare_with_every_effect() {
        let entry = LogEntry::Prepare {
            ident: TransactionIdentifier::Global(Xid::new(1, b"g".to_vec(), b"b".to_vec())),
            effects: vec![
                Effect::CreateDir { path: p("/d") },
                Effect::CreateFile { path: p("/d/f") },
                Effect::Write {
                    path: p("/d/f"),
                    offset: 0,
                    data: b"hello".to_vec(),
                },
                Effect::Truncate {
                    path: p("/d/f"),
                    length: 2,
                },
                Effect::Move {
                    source: p("/d/f"),
                    destination: p("/d/g"),
                },
                Effect::Delete { path: p("/d") },
            ],
        };
        assert_eq!(roundtrip(&entry), entry);
    }

    #[test]
    fn event_entries() {
        let enqueue = LogEntry::EventEnqueue {
            ident: TransactionIdentifier::Local(3),
            events: vec![QueuedEvent {
                id: 11,
                event: FileStateChangeEvent::new(p("/a"), false, EventMask::CREATED | EventMask::MODIFIED),
            }],
        };
        assert_eq!(roundtrip(&enqueue), enqueue);

        let dequeue = LogEntry::EventDequeue {
            ident: TransactionIdentifier::Local(4),
            event_id: 11,
        };
        assert_eq!(roundtrip(&dequeue), dequeue);
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let entry = LogEntry::Completed {
            ident: TransactionIdentifier::Local(1),
        };
        let mut payload = entry.encode_payload().unwrap();
        payload.push(0);
        let err = LogEntry::decode_payload(EntryType::Completed, &payload, 2, 40).unwrap_err();
        assert!(matches!(err, TxError::LogCorruption { segment: 2, offset: 40, .. }));
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let entry = LogEntry::Checkpoint {
            ident: TransactionIdentifier::Local(1),
            applied: 3,
        };
        let payload = entry.encode_payload().unwrap();
        assert!(LogEntry::decode_payload(EntryType::Checkpoint, &payload[..payload.len() - 1], 0, 0).is_err());
    }

    #[test]
    fn frame_layout() {
        let entry = LogEntry::Rollback {
            ident: TransactionIdentifier::Local(9),
        };
        let frame = entry.encode_frame().unwrap();
        assert_eq!(&frame[0..4], &LOG_MAGIC);
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), LOG_VERSION);
        assert_eq!(frame[6], EntryType::Rollback.as_byte());
        let len = u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]) as usize;
        assert_eq!(frame.len(), HEADER_SIZE + len + CRC_SIZE);
        let crc = u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());
        assert_eq!(crc, compute_crc32(&frame[..frame.len() - 4]));
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    proptest! {
        #[test]
        fn write_effects_survive_encoding(offset in any::<u64>(), data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let entry = LogEntry::Commit {
                ident: TransactionIdentifier::Local(1),
                effects: vec![Effect::Write { path: p("/f"), offset, data }],
            };
            prop_assert_eq!(roundtrip(&entry), entry);
        }

        #[test]
        fn random_payloads_never_panic(kind in 1u8..8, bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let entry_type = EntryType::from_byte(kind).unwrap();
            let _ = LogEntry::decode_payload(entry_type, &bytes, 0, 0);
        }
    }
}
