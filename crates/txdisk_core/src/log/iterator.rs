//! Streaming iteration over log segments.
//!
//! Entries are read through a bounded buffer so recovery never loads a
//! whole segment into memory. A frame cut short by a crash ends the
//! segment; a bad magic, unknown type or checksum mismatch is corruption.

use super::record::{compute_crc32, EntryType, LogEntry, CRC_SIZE, HEADER_SIZE, LOG_MAGIC, LOG_VERSION};
use super::LogPosition;
use crate::error::{TxError, TxResult};
use std::sync::Arc;
use txdisk_storage::{SegmentStore, StorageBackend};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Reads the entries of one segment in order.
pub struct SegmentIterator {
    segment: u64,
    backend: Box<dyn StorageBackend>,
    total_size: u64,
    current_offset: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    buffer_len: usize,
    finished: bool,
}

impl SegmentIterator {
    /// Starts reading `backend`, which holds segment number `segment`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(segment: u64, backend: Box<dyn StorageBackend>) -> TxResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            segment,
            backend,
            total_size,
            current_offset: 0,
            buffer: vec![0u8; READ_BUFFER_SIZE],
            buffer_pos: 0,
            buffer_len: 0,
            finished: false,
        })
    }

    /// Offset just past the last entry returned.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.current_offset
    }

    /// Size of the segment when iteration began.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Makes `min_bytes` available from the current position. Returns
    /// false when the segment ends first.
    fn ensure_buffered(&mut self, min_bytes: usize) -> TxResult<bool> {
        let available = self.buffer_len - self.buffer_pos;
        if available >= min_bytes {
            return Ok(true);
        }

        let unread = self.total_size - self.current_offset - available as u64;
        let needed = (min_bytes - available) as u64;
        if unread < needed {
            return Ok(false);
        }

        if self.buffer_pos > 0 && available > 0 {
            self.buffer.copy_within(self.buffer_pos..self.buffer_len, 0);
        }
        self.buffer_len = available;
        self.buffer_pos = 0;

        if min_bytes > self.buffer.len() {
            self.buffer.resize(min_bytes.next_power_of_two(), 0);
        }

        let room = (self.buffer.len() - self.buffer_len) as u64;
        let to_read = room.min(unread) as usize;
        if to_read > 0 {
            let read_offset = self.current_offset + self.buffer_len as u64;
            let data = self.backend.read_at(read_offset, to_read)?;
            self.buffer[self.buffer_len..self.buffer_len + data.len()].copy_from_slice(&data);
            self.buffer_len += data.len();
        }

        Ok(self.buffer_len - self.buffer_pos >= min_bytes)
    }

    fn corrupt(&self, message: impl Into<String>) -> TxError {
        TxError::log_corruption(self.segment, self.current_offset, message)
    }

    fn read_next(&mut self) -> TxResult<Option<(LogPosition, LogEntry)>> {
        if !self.ensure_buffered(HEADER_SIZE)? {
            return Ok(None);
        }

        let header = &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE];
        if header[0..4] != LOG_MAGIC {
            return Err(self.corrupt("invalid magic"));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > LOG_VERSION {
            return Err(self.corrupt(format!("unsupported version {version}")));
        }
        let type_byte = header[6];
        let entry_type = EntryType::from_byte(type_byte)
            .ok_or_else(|| self.corrupt(format!("unknown entry type {type_byte}")))?;
        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if !self.ensure_buffered(total_len)? {
            return Ok(None);
        }

        let payload_start = self.buffer_pos + HEADER_SIZE;
        let payload_end = payload_start + payload_len;
        let crc_bytes: [u8; 4] = self.buffer[payload_end..payload_end + CRC_SIZE]
            .try_into()
            .map_err(|_| self.corrupt("invalid checksum field"))?;
        let stored_crc = u32::from_le_bytes(crc_bytes);
        let computed_crc = compute_crc32(&self.buffer[self.buffer_pos..payload_end]);
        if stored_crc != computed_crc {
            return Err(self.corrupt(format!(
                "checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
            )));
        }

        let position = LogPosition {
            segment: self.segment,
            offset: self.current_offset,
        };
        let entry = LogEntry::decode_payload(
            entry_type,
            &self.buffer[payload_start..payload_end],
            position.segment,
            position.offset,
        )?;

        self.buffer_pos += total_len;
        self.current_offset += total_len as u64;
        Ok(Some((position, entry)))
    }
}

impl Iterator for SegmentIterator {
    type Item = TxResult<(LogPosition, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterates over every segment of a store, oldest first.
pub struct LogScanner {
    store: Arc<dyn SegmentStore>,
    pending: std::vec::IntoIter<u64>,
    current: Option<SegmentIterator>,
    torn_tails: Vec<(u64, u64)>,
}

impl LogScanner {
    /// Lists the segments of `store` and prepares to read them.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    pub fn new(store: Arc<dyn SegmentStore>) -> TxResult<Self> {
        let segments = store.list()?;
        Ok(Self {
            store,
            pending: segments.into_iter(),
            current: None,
            torn_tails: Vec::new(),
        })
    }

    /// Segments that ended in an incomplete frame, with the offset of the
    /// last complete entry boundary.
    #[must_use]
    pub fn torn_tails(&self) -> &[(u64, u64)] {
        &self.torn_tails
    }

    fn finish_current(&mut self) {
        if let Some(iter) = self.current.take() {
            if iter.valid_len() < iter.total_size() {
                self.torn_tails.push((iter.segment, iter.valid_len()));
            }
        }
    }
}

impl Iterator for LogScanner {
    type Item = TxResult<(LogPosition, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = self.current.as_mut() {
                match iter.next() {
                    Some(Ok(item)) => return Some(Ok(item)),
                    Some(Err(e)) => {
                        self.current = None;
                        self.pending = Vec::new().into_iter();
                        return Some(Err(e));
                    }
                    None => self.finish_current(),
                }
            }
            let segment = self.pending.next()?;
            let opened = self
                .store
                .open(segment)
                .map_err(TxError::from)
                .and_then(|backend| SegmentIterator::new(segment, backend));
            match opened {
                Ok(iter) => self.current = Some(iter),
                Err(e) => {
                    self.pending = Vec::new().into_iter();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionIdentifier;
    use txdisk_storage::{InMemoryBackend, MemorySegmentStore};

    fn completed(n: u64) -> LogEntry {
        LogEntry::Completed {
            ident: TransactionIdentifier::Local(n),
        }
    }

    fn frames(entries: &[LogEntry]) -> Vec<u8> {
        entries.iter().flat_map(|e| e.encode_frame().unwrap()).collect()
    }

    fn read_all(bytes: Vec<u8>) -> Vec<TxResult<(LogPosition, LogEntry)>> {
        SegmentIterator::new(0, Box::new(InMemoryBackend::with_data(bytes)))
            .unwrap()
            .collect()
    }

    #[test]
    fn empty_segment() {
        assert!(read_all(Vec::new()).is_empty());
    }

    #[test]
    fn entries_with_positions() {
        let first = completed(1).encode_frame().unwrap();
        let bytes = frames(&[completed(1), completed(2)]);
        let items: Vec<_> = read_all(bytes).into_iter().map(Result::unwrap).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0.offset, 0);
        assert_eq!(items[1].0.offset, first.len() as u64);
        assert_eq!(items[1].1, completed(2));
    }

    #[test]
    fn torn_tail_ends_iteration() {
        let mut bytes = frames(&[completed(1), completed(2)]);
        bytes.truncate(bytes.len() - 3);
        let items = read_all(bytes);
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[test]
    fn flipped_bit_is_corruption() {
        let mut bytes = frames(&[completed(1)]);
        bytes[HEADER_SIZE] ^= 0x01;
        let items = read_all(bytes);
        assert!(matches!(items[0], Err(TxError::LogCorruption { .. })));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = frames(&[completed(1)]);
        bytes[0] = b'X';
        assert!(matches!(read_all(bytes)[0], Err(TxError::LogCorruption { .. })));
    }

    #[test]
    fn large_entry_grows_buffer() {
        let entry = LogEntry::Commit {
            ident: TransactionIdentifier::Local(1),
            effects: vec![crate::log::Effect::Write {
                path: crate::path::ResourcePath::parse("/big").unwrap(),
                offset: 0,
                data: vec![7u8; READ_BUFFER_SIZE * 2],
            }],
        };
        let items = read_all(frames(&[entry.clone(), completed(1)]));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().1, entry);
    }

    #[test]
    fn scanner_walks_segments_in_order() {
        let store = MemorySegmentStore::new();
        store.insert(3, frames(&[completed(3)]));
        store.insert(1, frames(&[completed(1), completed(2)]));
        let mut torn = frames(&[completed(4)]);
        torn.truncate(5);
        store.insert(4, torn);

        let mut scanner = LogScanner::new(Arc::new(store)).unwrap();
        let seen: Vec<_> = scanner
            .by_ref()
            .map(|r| r.unwrap())
            .map(|(pos, entry)| (pos.segment, entry))
            .collect();
        assert_eq!(seen, vec![(1, completed(1)), (1, completed(2)), (3, completed(3))]);
        assert_eq!(scanner.torn_tails(), &[(4, 0)]);
    }
}
