//! Append-only log of filesystem mutations for observers.

use crate::path::RelativePath;
use std::sync::Mutex;
use tracing::debug;

/// A single recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalChange {
    Created(RelativePath),
    Removed(RelativePath),
    Renamed {
        from: RelativePath,
        to: RelativePath,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalDelta {
    /// Monotonically increasing sequence number, starting at 1.
    pub sequence: u64,
    pub change: JournalChange,
}

/// The mutation journal. The core only appends; observers read snapshots.
#[derive(Default)]
pub struct Journal {
    inner: Mutex<JournalState>,
}

#[derive(Default)]
struct JournalState {
    next_sequence: u64,
    deltas: Vec<JournalDelta>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_delta(&self, change: JournalChange) {
        let mut state = self.inner.lock().unwrap();
        state.next_sequence += 1;
        let delta = JournalDelta {
            sequence: state.next_sequence,
            change,
        };
        debug!(sequence = delta.sequence, change = ?delta.change, "journal delta");
        state.deltas.push(delta);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of every delta recorded so far, in sequence order.
    pub fn snapshot(&self) -> Vec<JournalDelta> {
        self.inner.lock().unwrap().deltas.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_monotonic() {
        let journal = Journal::new();
        journal.add_delta(JournalChange::Created("a".parse().unwrap()));
        journal.add_delta(JournalChange::Removed("a".parse().unwrap()));
        journal.add_delta(JournalChange::Renamed {
            from: "b".parse().unwrap(),
            to: "c/d".parse().unwrap(),
        });

        let deltas = journal.snapshot();
        assert_eq!(deltas.len(), 3);
        assert_eq!(
            deltas.iter().map(|d| d.sequence).collect::<Vec<_>>(),
            [1, 2, 3]
        );
        assert!(matches!(deltas[2].change, JournalChange::Renamed { .. }));
    }
}
