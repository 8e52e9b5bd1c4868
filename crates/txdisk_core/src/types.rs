//! Core identifier types.

use crate::error::{TxError, TxResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal sequence number of a transaction within one engine run.
///
/// Sequence numbers are assigned in start order and never reused while
/// the engine runs. Deadlock victim selection picks the highest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// A global transaction branch identifier supplied by an external
/// transaction manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    /// Format identifier chosen by the transaction manager.
    pub format_id: i32,
    /// Global transaction id.
    pub global_id: Vec<u8>,
    /// Branch qualifier.
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Longest accepted global id or branch qualifier, in bytes.
    pub const MAX_PART_LEN: usize = 64;

    /// Creates a branch id.
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch_qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    /// Returns true if both parts fit the protocol limits.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.global_id.len() <= Self::MAX_PART_LEN && self.branch_qualifier.len() <= Self::MAX_PART_LEN
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid:{}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in &self.branch_qualifier {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The stable identity of a transaction, as recorded in the log.
///
/// Local transactions get a number that keeps increasing across restarts;
/// distributed branches are identified by their [`Xid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionIdentifier {
    /// A transaction started through a local session.
    Local(u64),
    /// A branch of a global transaction.
    Global(Xid),
}

impl TransactionIdentifier {
    const LOCAL_TAG: u8 = 0;
    const GLOBAL_TAG: u8 = 1;

    /// Returns the branch id for global transactions.
    #[must_use]
    pub fn xid(&self) -> Option<&Xid> {
        match self {
            Self::Global(xid) => Some(xid),
            Self::Local(_) => None,
        }
    }

    /// Appends the binary form to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Local(n) => {
                buf.push(Self::LOCAL_TAG);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Self::Global(xid) => {
                buf.push(Self::GLOBAL_TAG);
                buf.extend_from_slice(&xid.format_id.to_le_bytes());
                buf.push(xid.global_id.len() as u8);
                buf.extend_from_slice(&xid.global_id);
                buf.push(xid.branch_qualifier.len() as u8);
                buf.extend_from_slice(&xid.branch_qualifier);
            }
        }
    }

    /// Returns the opaque binary form handed to administrators.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes an identifier from the front of `bytes`, returning it and
    /// the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidArgument`] if the bytes are not a valid
    /// identifier.
    pub fn decode_prefix(bytes: &[u8]) -> TxResult<(Self, usize)> {
        let bad = || TxError::invalid_argument("malformed transaction identifier");
        let tag = *bytes.first().ok_or_else(bad)?;
        match tag {
            Self::LOCAL_TAG => {
                let raw: [u8; 8] = bytes.get(1..9).ok_or_else(bad)?.try_into().map_err(|_| bad())?;
                Ok((Self::Local(u64::from_le_bytes(raw)), 9))
            }
            Self::GLOBAL_TAG => {
                let raw: [u8; 4] = bytes.get(1..5).ok_or_else(bad)?.try_into().map_err(|_| bad())?;
                let mut cursor = 5;
                let gtrid_len = usize::from(*bytes.get(cursor).ok_or_else(bad)?);
                cursor += 1;
                let global_id = bytes.get(cursor..cursor + gtrid_len).ok_or_else(bad)?.to_vec();
                cursor += gtrid_len;
                let bqual_len = usize::from(*bytes.get(cursor).ok_or_else(bad)?);
                cursor += 1;
                let branch_qualifier = bytes.get(cursor..cursor + bqual_len).ok_or_else(bad)?.to_vec();
                cursor += bqual_len;
                Ok((
                    Self::Global(Xid {
                        format_id: i32::from_le_bytes(raw),
                        global_id,
                        branch_qualifier,
                    }),
                    cursor,
                ))
            }
            _ => Err(bad()),
        }
    }

    /// Decodes an identifier that occupies all of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidArgument`] on malformed input or trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> TxResult<Self> {
        let (id, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(TxError::invalid_argument("trailing bytes after transaction identifier"));
        }
        Ok(id)
    }
}

impl fmt::Display for TransactionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(n) => write!(f, "local:{n}"),
            Self::Global(xid) => xid.fmt(f),
        }
    }
}

impl From<Xid> for TransactionIdentifier {
    fn from(xid: Xid) -> Self {
        Self::Global(xid)
    }
}

/// Lock modes on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Many readers.
    Shared,
    /// One writer, no readers.
    Exclusive,
}

impl LockMode {
    /// Maps the `exclusive` flag of read operations to a mode.
    #[must_use]
    pub const fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            Self::Exclusive
        } else {
            Self::Shared
        }
    }
}

/// Why the engine rolled a transaction back on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollbackCause {
    /// The transaction was chosen to break a deadlock.
    DeadlockVictim,
    /// The transaction outlived its timeout.
    Timeout,
}

impl fmt::Display for RollbackCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlockVictim => f.write_str("deadlock victim"),
            Self::Timeout => f.write_str("transaction timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_ordering_and_display() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
        assert_eq!(TransactionId::new(7).to_string(), "txn:7");
    }

    #[test]
    fn identifier_bytes_roundtrip() {
        let local = TransactionIdentifier::Local(42);
        assert_eq!(TransactionIdentifier::from_bytes(&local.to_bytes()).unwrap(), local);

        let global = TransactionIdentifier::Global(Xid::new(7, b"gtrid".to_vec(), b"b1".to_vec()));
        assert_eq!(TransactionIdentifier::from_bytes(&global.to_bytes()).unwrap(), global);
    }

    #[test]
    fn identifier_rejects_trailing_and_truncated_bytes() {
        let mut bytes = TransactionIdentifier::Local(1).to_bytes();
        bytes.push(0);
        assert!(TransactionIdentifier::from_bytes(&bytes).is_err());

        let global = TransactionIdentifier::Global(Xid::new(1, b"abc".to_vec(), b"d".to_vec())).to_bytes();
        assert!(TransactionIdentifier::from_bytes(&global[..global.len() - 1]).is_err());
        assert!(TransactionIdentifier::from_bytes(&[9]).is_err());
    }

    #[test]
    fn xid_display_is_hex() {
        let xid = Xid::new(3, vec![0xab, 0x01], vec![0xff]);
        assert_eq!(xid.to_string(), "xid:3:ab01:ff");
        assert!(xid.is_well_formed());
        assert!(!Xid::new(0, vec![0; 65], vec![]).is_well_formed());
    }

    #[test]
    fn lock_mode_from_flag() {
        assert_eq!(LockMode::from_exclusive(true), LockMode::Exclusive);
        assert_eq!(LockMode::from_exclusive(false), LockMode::Shared);
    }
}
