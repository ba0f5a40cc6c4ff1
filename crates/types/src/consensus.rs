//! Process-wide consensus height.
//!
//! The RPC fan-out poll loop is the single writer; every other subsystem reads
//! through [OpnetConsensus::block_height]. Readers observe a monotonically
//! non-decreasing value. A sequence counter guards the write path so tests can
//! assert monotonicity without racing the poll loop.

use std::sync::atomic::{AtomicU64, Ordering};

static BLOCK_HEIGHT: AtomicU64 = AtomicU64::new(0);
static WRITE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Accessor for the advertised chain state.
pub struct OpnetConsensus;

impl OpnetConsensus {
    /// The current block height as last observed by the RPC poll loop.
    pub fn block_height() -> u64 {
        BLOCK_HEIGHT.load(Ordering::Acquire)
    }

    /// The OP_NET consensus height: advertised height + 1, used to gate
    /// protocol versioning.
    pub fn consensus_height() -> u64 {
        Self::block_height().saturating_add(1)
    }

    /// Record a newly observed height.
    ///
    /// Writes are monotonic: a stale observation never lowers the stored
    /// value. Only the RPC fan-out poll loop calls this.
    pub fn set_block_height(height: u64) {
        BLOCK_HEIGHT.fetch_max(height, Ordering::AcqRel);
        WRITE_SEQUENCE.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of writes that have been applied.
    pub fn write_sequence() -> u64 {
        WRITE_SEQUENCE.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_is_monotonic() {
        let seq = OpnetConsensus::write_sequence();
        OpnetConsensus::set_block_height(100);
        let observed = OpnetConsensus::block_height();
        assert!(observed >= 100);

        // A stale poll result must not rewind the height.
        OpnetConsensus::set_block_height(50);
        assert!(OpnetConsensus::block_height() >= observed);
        assert!(OpnetConsensus::write_sequence() >= seq + 2);
    }

    #[test]
    fn consensus_height_is_advertised_plus_one() {
        OpnetConsensus::set_block_height(7);
        assert_eq!(OpnetConsensus::consensus_height(), OpnetConsensus::block_height() + 1);
    }
}
