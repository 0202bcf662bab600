use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::message::constants::{NO_PRODUCER_EPOCH, NO_SEQUENCE};
use crate::message::{ControlRecordType, EndTransactionMarker, RecordBatch, TopicPartition};
use crate::txn_state::entry::{BatchMetadata, ProducerStateEntry};
use crate::{AppError, AppResult};

/// Where an append comes from. Client appends get full sequence
/// validation; coordinator markers and log replay do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOrigin {
    Coordinator,
    Client,
    Log,
}

/// One ongoing transaction, keyed in the manager's index by its first
/// offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnMetadata {
    pub producer_id: i64,
    pub first_offset: i64,
    pub last_offset: i64,
}

impl TxnMetadata {
    pub fn new(producer_id: i64, first_offset: i64) -> Self {
        Self {
            producer_id,
            first_offset,
            last_offset: -1,
        }
    }
}

/// A decided transaction, produced by analysis and consumed by
/// `complete_txn` once the marker is durably appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTxn {
    pub producer_id: i64,
    pub first_offset: i64,
    pub last_offset: i64,
    pub is_aborted: bool,
}

/// Persisted descriptor of one aborted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedTxn {
    pub producer_id: i64,
    pub first_offset: i64,
    pub last_offset: i64,
    pub last_stable_offset: i64,
}

impl AbortedTxn {
    const CURRENT_VERSION: i16 = 0;
    /// version (2) + four i64 fields
    pub const TOTAL_SIZE: usize = 34;

    pub fn new(
        producer_id: i64,
        first_offset: i64,
        last_offset: i64,
        last_stable_offset: i64,
    ) -> Self {
        Self {
            producer_id,
            first_offset,
            last_offset,
            last_stable_offset,
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buffer = BytesMut::with_capacity(Self::TOTAL_SIZE);
        buffer.put_i16(Self::CURRENT_VERSION);
        buffer.put_i64(self.producer_id);
        buffer.put_i64(self.first_offset);
        buffer.put_i64(self.last_offset);
        buffer.put_i64(self.last_stable_offset);
        buffer
    }
}

/// Aborted-transaction element of a fetch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchAbortedTxn {
    pub producer_id: i64,
    pub first_offset: i64,
}

/// Staged delta for one producer, computed from an incoming batch
/// sequence before anything is committed to the manager.
///
/// `updated_entry` starts from the current entry's epoch, coordinator
/// epoch, timestamp and open transaction, but with an empty batch
/// history; only batches staged by this append land in it.
#[derive(Debug)]
pub struct ProducerAppendInfo {
    topic_partition: TopicPartition,
    pub producer_id: i64,
    current_entry: ProducerStateEntry,
    origin: AppendOrigin,
    transactions: Vec<TxnMetadata>,
    updated_entry: ProducerStateEntry,
}

impl ProducerAppendInfo {
    pub fn new(
        topic_partition: TopicPartition,
        producer_id: i64,
        current_entry: ProducerStateEntry,
        origin: AppendOrigin,
    ) -> Self {
        let updated_entry = Self::initial_updated_entry(producer_id, &current_entry);
        Self {
            topic_partition,
            producer_id,
            current_entry,
            origin,
            transactions: Vec::new(),
            updated_entry,
        }
    }

    fn initial_updated_entry(
        producer_id: i64,
        current_entry: &ProducerStateEntry,
    ) -> ProducerStateEntry {
        let mut updated = ProducerStateEntry::empty(producer_id);
        updated.producer_epoch = current_entry.producer_epoch;
        updated.coordinator_epoch = current_entry.coordinator_epoch;
        updated.last_timestamp = current_entry.last_timestamp;
        updated.current_txn_first_offset = current_entry.current_txn_first_offset;
        updated
    }

    /// Stages one batch. Control batches may decide a transaction; data
    /// batches are validated and added to the staged history.
    ///
    /// `first_offset` overrides the batch base offset when the log
    /// assigns offsets after validation.
    pub fn append(
        &mut self,
        batch: &RecordBatch,
        first_offset: Option<i64>,
    ) -> AppResult<Option<CompletedTxn>> {
        if batch.is_control_batch() {
            let records = batch.records()?;
            match records.first() {
                Some(record) => {
                    let marker = EndTransactionMarker::deserialize(record)?;
                    self.append_end_txn_marker(
                        marker,
                        batch.producer_epoch(),
                        batch.base_offset(),
                        batch.record_timestamp(record),
                    )
                }
                // An empty control batch means the entire transaction
                // has been cleaned from the log, so no need to append.
                None => Ok(None),
            }
        } else {
            self.append_data_batch(
                batch.producer_epoch(),
                batch.base_sequence(),
                batch.last_sequence(),
                batch.max_timestamp(),
                first_offset.unwrap_or_else(|| batch.base_offset()),
                batch.last_offset(),
                batch.is_transactional(),
            )?;
            Ok(None)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_data_batch(
        &mut self,
        epoch: i16,
        first_seq: i32,
        last_seq: i32,
        last_timestamp: i64,
        first_offset: i64,
        last_offset: i64,
        is_transactional: bool,
    ) -> AppResult<()> {
        debug!(
            "append data batch epoch: {}, first_seq: {}, last_seq: {}, first_offset: {}, last_offset: {}",
            epoch, first_seq, last_seq, first_offset, last_offset
        );
        self.maybe_validate_data_batch(epoch, first_seq)?;
        self.updated_entry.add_batch(
            epoch,
            last_seq,
            last_offset,
            (last_offset - first_offset) as i32,
            last_timestamp,
        );

        match self.updated_entry.current_txn_first_offset {
            Some(_) if !is_transactional => {
                // Received a non-transactional message while a transaction is active
                Err(AppError::InvalidTxnState(format!(
                    "expected transactional write from producer {} at offset {} in partition {}",
                    self.producer_id, first_offset, self.topic_partition
                )))
            }
            None if is_transactional => {
                self.updated_entry.current_txn_first_offset = Some(first_offset);
                self.transactions
                    .push(TxnMetadata::new(self.producer_id, first_offset));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn maybe_validate_data_batch(&self, producer_epoch: i16, first_seq: i32) -> AppResult<()> {
        self.check_producer_epoch(producer_epoch)?;
        if self.origin == AppendOrigin::Client {
            self.check_sequence(producer_epoch, first_seq)?;
        }
        Ok(())
    }

    fn check_producer_epoch(&self, producer_epoch: i16) -> AppResult<()> {
        if producer_epoch < self.updated_entry.producer_epoch {
            return Err(AppError::InvalidProducerEpoch(format!(
                "producer's epoch in {} is {}, which is smaller than the last seen epoch {}",
                self.topic_partition, producer_epoch, self.current_entry.producer_epoch
            )));
        }
        Ok(())
    }

    fn check_sequence(&self, producer_epoch: i16, append_first_seq: i32) -> AppResult<()> {
        debug!(
            "append data batch check_sequence producer_epoch: {}, append_first_seq: {}",
            producer_epoch, append_first_seq
        );
        if producer_epoch != self.updated_entry.producer_epoch {
            if append_first_seq != 0 && self.updated_entry.producer_epoch != NO_PRODUCER_EPOCH {
                return Err(AppError::OutOfOrderSequence(format!(
                    "invalid sequence number for new epoch in partition {}: {} (request epoch), {} (seq. number)",
                    self.topic_partition, producer_epoch, append_first_seq
                )));
            }
            return Ok(());
        }

        let current_last_seq = if !self.updated_entry.is_empty() {
            self.updated_entry.last_seq()
        } else if producer_epoch == self.current_entry.producer_epoch {
            self.current_entry.last_seq()
        } else {
            NO_SEQUENCE
        };

        // If there is no current producer epoch (possibly because all
        // producer records have been deleted due to retention) accept
        // writes with any sequence number
        if self.current_entry.producer_epoch != NO_PRODUCER_EPOCH
            && !in_sequence(current_last_seq, append_first_seq)
        {
            return Err(AppError::OutOfOrderSequence(format!(
                "out of order sequence number for producer {} in partition {}: {} (incoming seq. number), {} (current end sequence number)",
                self.producer_id, self.topic_partition, append_first_seq, current_last_seq
            )));
        }
        Ok(())
    }

    /// Applies an end-transaction marker. Emits a `CompletedTxn` only
    /// for non-empty transactions: a marker without any associated data
    /// has no impact on the last stable offset and does not need to be
    /// reflected in the transaction index.
    pub fn append_end_txn_marker(
        &mut self,
        marker: EndTransactionMarker,
        producer_epoch: i16,
        offset: i64,
        timestamp: i64,
    ) -> AppResult<Option<CompletedTxn>> {
        self.check_producer_epoch(producer_epoch)?;

        let completed_txn = self.updated_entry.current_txn_first_offset.map(|first_offset| {
            CompletedTxn {
                producer_id: self.producer_id,
                first_offset,
                last_offset: offset,
                is_aborted: marker.control_type == ControlRecordType::Abort,
            }
        });

        self.updated_entry.maybe_update_producer_epoch(producer_epoch);
        self.updated_entry.current_txn_first_offset = None;
        self.updated_entry.last_timestamp = timestamp;
        Ok(completed_txn)
    }

    /// Rewrites the single staged batch against a log-assigned offset
    /// range and re-derives the started transaction, if any.
    pub fn reset_offset(&mut self, base_offset: i64, is_transactional: bool) -> AppResult<()> {
        debug!("append data batch reset offset: {}", base_offset);
        let producer_epoch = self.updated_entry.producer_epoch;
        let batch = match self.updated_entry.batch_metadata.pop_front() {
            Some(batch) => batch,
            None => return Ok(()),
        };
        self.updated_entry = Self::initial_updated_entry(self.producer_id, &self.current_entry);
        self.transactions.clear();
        self.append_data_batch(
            producer_epoch,
            batch.first_seq(),
            batch.last_seq,
            batch.timestamp,
            base_offset,
            base_offset + batch.offset_delta as i64,
            is_transactional,
        )
    }

    pub fn to_entry(self) -> (ProducerStateEntry, Vec<TxnMetadata>) {
        (self.updated_entry, self.transactions)
    }

    pub fn updated_entry(&self) -> &ProducerStateEntry {
        &self.updated_entry
    }

    pub fn started_transactions(&self) -> &[TxnMetadata] {
        &self.transactions
    }
}

/// `next_seq` follows `last_seq` iff it is the direct successor on the
/// sequence ring.
fn in_sequence(last_seq: i32, next_seq: i32) -> bool {
    next_seq as i64 == last_seq as i64 + 1 || (next_seq == 0 && last_seq == i32::MAX)
}

/// Result of analyzing one incoming batch sequence: staged per-producer
/// deltas, transactions decided by control markers, and an optional
/// already-appended duplicate.
#[derive(Debug, Default)]
pub struct AnalyzeResult {
    pub append_info_map: HashMap<i64, ProducerAppendInfo>,
    pub completed_txns: Vec<CompletedTxn>,
    pub duplicate: Option<BatchMetadata>,
}

impl AnalyzeResult {
    pub fn new(
        append_info_map: HashMap<i64, ProducerAppendInfo>,
        completed_txns: Vec<CompletedTxn>,
        duplicate: Option<BatchMetadata>,
    ) -> Self {
        Self {
            append_info_map,
            completed_txns,
            duplicate,
        }
    }

    pub fn first_append_info(&self) -> Option<&ProducerAppendInfo> {
        self.append_info_map.values().next()
    }
}
