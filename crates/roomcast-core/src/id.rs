//! Process-unique connection identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter backing [`ConnectionId::next`]. Starts at 1 so that 0 never
/// shows up in logs as a real connection.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier assigned to a connection when it is accepted.
///
/// Ids come from a process-wide monotonic counter and are never reused,
/// so a stale `Remove` for a departed connection can never hit a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next unused id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
