//! The sort view of indexed transactions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 32-byte transaction id referenced by inputs. Malleable under segwit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Txid(pub [u8; 32]);

/// 32-byte witness transaction id. Globally unique for sort purposes:
/// two witness variants of the same [Txid] carry distinct wtxids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Wtxid(pub [u8; 32]);

impl Txid {
    pub const ZERO: Txid = Txid([0u8; 32]);
}

macro_rules! impl_hash_fmt {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({})"), hex::encode(self.0))
            }
        }
    };
}

impl_hash_fmt!(Txid);
impl_hash_fmt!(Wtxid);

/// A transaction as seen by the block sorter.
///
/// `input_refs` holds the raw prevout txid buffers exactly as produced by the
/// block parser: an empty or all-zero buffer marks the coinbase input, buffers
/// of any other length than 32 are malformed input records and are skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortableTransaction {
    pub txid: Txid,
    pub wtxid: Wtxid,
    pub priority_fee: u64,
    pub input_refs: Vec<Bytes>,
}

impl SortableTransaction {
    pub fn new(txid: Txid, wtxid: Wtxid, priority_fee: u64, input_refs: Vec<Bytes>) -> Self {
        Self { txid, wtxid, priority_fee, input_refs }
    }

    /// Digest over the wtxid, used as the indexing key and the sort tiebreak.
    pub fn indexing_hash(&self) -> [u8; 32] {
        Sha256::digest(self.wtxid.0).into()
    }

    /// Whether any input references the empty (or all-zero) parent txid.
    pub fn is_coinbase(&self) -> bool {
        self.input_refs.iter().any(|r| r.is_empty() || (r.len() == 32 && r.iter().all(|b| *b == 0)))
    }

    /// The well-formed, non-coinbase parent txids referenced by inputs.
    pub fn parent_txids(&self) -> impl Iterator<Item = Txid> + '_ {
        self.input_refs.iter().filter_map(|r| {
            if r.len() != 32 || r.iter().all(|b| *b == 0) {
                return None;
            }
            let mut id = [0u8; 32];
            id.copy_from_slice(r);
            Some(Txid(id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn coinbase_detection() {
        let coinbase = SortableTransaction::new(
            Txid(id(1)),
            Wtxid(id(1)),
            0,
            vec![Bytes::from_static(&[0u8; 32])],
        );
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.parent_txids().count(), 0);

        let plain = SortableTransaction::new(
            Txid(id(2)),
            Wtxid(id(2)),
            10,
            vec![Bytes::copy_from_slice(&id(1))],
        );
        assert!(!plain.is_coinbase());
        assert_eq!(plain.parent_txids().collect::<Vec<_>>(), vec![Txid(id(1))]);
    }

    #[test]
    fn malformed_input_refs_are_skipped() {
        let tx = SortableTransaction::new(
            Txid(id(3)),
            Wtxid(id(3)),
            1,
            vec![Bytes::from_static(b"short"), Bytes::new()],
        );
        assert_eq!(tx.parent_txids().count(), 0);
        // the empty buffer still marks the coinbase input
        assert!(tx.is_coinbase());
    }
}
