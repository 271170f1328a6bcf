use std::sync::atomic::{AtomicU64, Ordering};

/// Owns the producer-side sequence counter for idempotent sends.
///
/// The counter only moves forward once the server accepted (or
/// deduplicated) a send, so a transport-level retry reuses the same
/// sequence number and lands in the same slot server-side. Recovery after
/// a restart seeds the counter through `new`; `set_sequence_number` exists
/// for operators that need to rewind it by hand.
#[derive(Debug)]
pub struct SequenceNumManager {
    seq_num: AtomicU64,
}

impl SequenceNumManager {
    pub fn new(initial_sequence_number: u64) -> Self {
        Self {
            seq_num: AtomicU64::new(initial_sequence_number),
        }
    }

    pub fn get_sequence_number(&self) -> u64 {
        self.seq_num.load(Ordering::SeqCst)
    }

    /// The sequence number the next send should carry.
    pub fn next_candidate(&self) -> u64 {
        self.get_sequence_number() + 1
    }

    /// Record that the server accepted `sequence_number`. A duplicate reply
    /// for an already-accepted number never moves the counter backwards.
    pub fn mark_accepted(&self, sequence_number: u64) {
        self.seq_num.fetch_max(sequence_number, Ordering::SeqCst);
    }

    pub fn set_sequence_number(&self, sequence_number: u64) {
        self.seq_num.store(sequence_number, Ordering::SeqCst);
    }
}
