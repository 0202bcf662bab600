use std::collections::VecDeque;

use crate::message::constants::{NO_PRODUCER_EPOCH, NO_SEQUENCE, NO_TIMESTAMP};
use crate::message::RecordBatch;

/// Batches retained per producer for duplicate detection.
pub const NUM_BATCHES_TO_RETAIN: usize = 5;

/// Descriptor of one appended batch. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMetadata {
    pub last_seq: i32,
    pub last_offset: i64,
    pub offset_delta: i32,
    pub timestamp: i64,
}

impl BatchMetadata {
    pub fn new(last_seq: i32, last_offset: i64, offset_delta: i32, timestamp: i64) -> Self {
        Self {
            last_seq,
            last_offset,
            offset_delta,
            timestamp,
        }
    }

    pub fn first_seq(&self) -> i32 {
        decrement_sequence(self.last_seq, self.offset_delta)
    }

    pub fn first_offset(&self) -> i64 {
        self.last_offset - self.offset_delta as i64
    }
}

/// Steps a sequence back by `decrement` on the signed 32-bit ring.
fn decrement_sequence(sequence: i32, decrement: i32) -> i32 {
    if sequence < decrement {
        i32::MAX - (decrement - sequence) + 1
    } else {
        sequence - decrement
    }
}

/// Per-producer state: the last few appended batches plus the current
/// epoch and in-flight transaction.
///
/// The batch history is ordered with the lowest sequence at the front
/// and the highest at the back. At most [`NUM_BATCHES_TO_RETAIN`]
/// batches are retained; the front is evicted to make room.
#[derive(Debug, Clone)]
pub struct ProducerStateEntry {
    pub producer_id: i64,
    pub batch_metadata: VecDeque<BatchMetadata>,
    pub producer_epoch: i16,
    pub coordinator_epoch: i32,
    pub last_timestamp: i64,
    pub current_txn_first_offset: Option<i64>,
}

impl ProducerStateEntry {
    pub fn empty(producer_id: i64) -> Self {
        Self {
            producer_id,
            batch_metadata: VecDeque::new(),
            producer_epoch: NO_PRODUCER_EPOCH,
            coordinator_epoch: -1,
            last_timestamp: NO_TIMESTAMP,
            current_txn_first_offset: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batch_metadata.is_empty()
    }

    pub fn first_seq(&self) -> i32 {
        self.batch_metadata
            .front()
            .map_or(NO_SEQUENCE, |b| b.first_seq())
    }

    pub fn first_data_offset(&self) -> i64 {
        self.batch_metadata.front().map_or(-1, |b| b.first_offset())
    }

    pub fn last_seq(&self) -> i32 {
        self.batch_metadata
            .back()
            .map_or(NO_SEQUENCE, |b| b.last_seq)
    }

    pub fn last_data_offset(&self) -> i64 {
        self.batch_metadata.back().map_or(-1, |b| b.last_offset)
    }

    pub fn last_offset_delta(&self) -> i32 {
        self.batch_metadata.back().map_or(0, |b| b.offset_delta)
    }

    pub fn add_batch(
        &mut self,
        producer_epoch: i16,
        last_seq: i32,
        last_offset: i64,
        offset_delta: i32,
        timestamp: i64,
    ) {
        self.maybe_update_producer_epoch(producer_epoch);
        self.add_batch_metadata(BatchMetadata::new(last_seq, last_offset, offset_delta, timestamp));
        self.last_timestamp = timestamp;
    }

    /// Bumps the stored epoch, clearing the batch history. Returns
    /// whether the epoch changed.
    pub fn maybe_update_producer_epoch(&mut self, producer_epoch: i16) -> bool {
        if self.producer_epoch != producer_epoch {
            self.batch_metadata.clear();
            self.producer_epoch = producer_epoch;
            true
        } else {
            false
        }
    }

    fn add_batch_metadata(&mut self, batch: BatchMetadata) {
        if self.batch_metadata.len() == NUM_BATCHES_TO_RETAIN {
            self.batch_metadata.pop_front();
        }
        self.batch_metadata.push_back(batch);
    }

    /// Merges a staged entry produced by one append into this one.
    pub fn update(&mut self, mut next_entry: ProducerStateEntry) {
        self.maybe_update_producer_epoch(next_entry.producer_epoch);
        while let Some(batch) = next_entry.batch_metadata.pop_front() {
            self.add_batch_metadata(batch);
        }
        self.current_txn_first_offset = next_entry.current_txn_first_offset;
        self.last_timestamp = next_entry.last_timestamp;
    }

    /// Returns the retained batch whose epoch and sequence range exactly
    /// match `batch`, if any. A hit means the batch was already appended
    /// and the broker can answer the producer without re-appending.
    pub fn find_duplicate_batch(&self, batch: &RecordBatch) -> Option<BatchMetadata> {
        if batch.producer_epoch() != self.producer_epoch {
            return None;
        }
        self.batch_with_sequence_range(batch.base_sequence(), batch.last_sequence())
    }

    fn batch_with_sequence_range(&self, first_seq: i32, last_seq: i32) -> Option<BatchMetadata> {
        self.batch_metadata
            .iter()
            .find(|b| first_seq == b.first_seq() && last_seq == b.last_seq)
            .copied()
    }
}
