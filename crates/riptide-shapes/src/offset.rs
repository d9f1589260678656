// Log offsets order every entry in a shape's append-only log.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in a shape's log: the WAL position the change came from plus the
/// index of the operation within its transaction. Ordering is lexicographic,
/// so deriving `Ord` over the field order is exactly the total order the log
/// is keyed by.
///
/// ```
/// use riptide_shapes::LogOffset;
///
/// let snapshot_end = LogOffset::ZERO;
/// let first_change = LogOffset::new(1000, 0);
/// assert!(snapshot_end < first_change);
/// assert!(first_change < LogOffset::new(1000, 1));
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogOffset {
    pub lsn: u64,
    pub op_index: u64,
}

impl LogOffset {
    /// The minimum offset. Marks the snapshot itself; every replicated
    /// change carries an offset strictly greater than this.
    pub const ZERO: LogOffset = LogOffset { lsn: 0, op_index: 0 };

    pub fn new(lsn: u64, op_index: u64) -> Self {
        Self { lsn, op_index }
    }
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.lsn, self.op_index)
    }
}
