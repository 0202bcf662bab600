use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::atomic::AtomicCell;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::message::constants::NO_PRODUCER_ID;
use crate::message::{MemoryRecords, RecordBatch, TopicPartition};
use crate::storage::{RecordDecoder, SnapshotReader, SnapshotWriter};
use crate::txn_state::append_info::{
    AbortedTxn, AnalyzeResult, AppendOrigin, CompletedTxn, FetchAbortedTxn, ProducerAppendInfo,
    TxnMetadata,
};
use crate::txn_state::entry::ProducerStateEntry;
use crate::txn_state::recovery::RecoveryConfig;
use crate::{AppError, AppResult};

/// Recovery lifecycle of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Init,
    Recovering,
    Ready,
    RecoverError,
}

/// Ongoing transactions ordered by first offset, plus the aborted index.
/// Kept under one lock so LSO computation sees both consistently.
#[derive(Debug, Default)]
pub(crate) struct TxnIndex {
    pub(crate) ongoing: BTreeMap<i64, TxnMetadata>,
    pub(crate) aborted: Vec<AbortedTxn>,
}

/// Per-partition producer state: who wrote what last, which
/// transactions are still open, and which were aborted.
///
/// Writes go through a two-phase protocol: `analyze_and_validate_producer_state`
/// stages per-producer deltas without touching the manager, and only
/// after the log append succeeds does the caller commit them with
/// `update` and `complete_txn`.
pub struct ProducerStateManager {
    pub(crate) topic_partition: TopicPartition,
    max_producer_id_expiration_ms: u32,
    pub(crate) producers: DashMap<i64, ProducerStateEntry>,
    pub(crate) txns: Mutex<TxnIndex>,
    pub(crate) last_map_offset: AtomicCell<i64>,
    pub(crate) state: AtomicCell<ManagerState>,
    pub(crate) recovery_config: RecoveryConfig,
    pub(crate) decoder: Arc<dyn RecordDecoder>,
    pub(crate) snapshot_writer: Arc<dyn SnapshotWriter>,
    pub(crate) snapshot_reader: Arc<dyn SnapshotReader>,
    pub(crate) snapshot_gate: tokio::sync::Mutex<()>,
}

impl ProducerStateManager {
    pub fn new(
        topic_partition: TopicPartition,
        max_producer_id_expiration_ms: u32,
        recovery_config: RecoveryConfig,
        decoder: Arc<dyn RecordDecoder>,
        snapshot_writer: Arc<dyn SnapshotWriter>,
        snapshot_reader: Arc<dyn SnapshotReader>,
    ) -> Self {
        Self {
            topic_partition,
            max_producer_id_expiration_ms,
            producers: DashMap::new(),
            txns: Mutex::new(TxnIndex::default()),
            last_map_offset: AtomicCell::new(0),
            state: AtomicCell::new(ManagerState::Init),
            recovery_config,
            decoder,
            snapshot_writer,
            snapshot_reader,
            snapshot_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state.load()
    }

    pub(crate) fn check_ready(&self) -> AppResult<()> {
        let state = self.state.load();
        if state != ManagerState::Ready {
            return Err(AppError::IllegalState(format!(
                "producer state manager for {} is {:?}, not ready",
                self.topic_partition, state
            )));
        }
        Ok(())
    }

    /// Seeds a staged delta for `producer_id` from its current entry.
    pub fn prepare_update(&self, producer_id: i64, origin: AppendOrigin) -> ProducerAppendInfo {
        let current_entry = self
            .last_entry(producer_id)
            .unwrap_or_else(|| ProducerStateEntry::empty(producer_id));
        ProducerAppendInfo::new(
            self.topic_partition.clone(),
            producer_id,
            current_entry,
            origin,
        )
    }

    /// Validates an incoming batch sequence against producer state
    /// without mutating the manager.
    ///
    /// If any batch turns out to be a duplicate of one already
    /// appended, analysis short-circuits and returns its metadata so
    /// the broker can answer the producer without re-appending.
    pub fn analyze_and_validate_producer_state(
        &self,
        records: MemoryRecords,
        first_offset: Option<i64>,
        origin: AppendOrigin,
    ) -> AppResult<AnalyzeResult> {
        self.check_ready()?;
        let mut updated_producers: HashMap<i64, ProducerAppendInfo> = HashMap::new();
        let mut completed_txns = Vec::new();

        for batch in records {
            if !batch.has_producer_id() {
                continue;
            }
            // A client produce request carries up to 5 batches which could
            // have been duplicated.
            if let Some(last_entry) = self.last_entry(batch.producer_id()) {
                if let Some(duplicate) = last_entry.find_duplicate_batch(&batch) {
                    return Ok(AnalyzeResult::new(
                        updated_producers,
                        completed_txns,
                        Some(duplicate),
                    ));
                }
            }
            if let Some(completed_txn) =
                self.update_producers(&batch, &mut updated_producers, first_offset, origin)?
            {
                completed_txns.push(completed_txn);
            }
        }
        Ok(AnalyzeResult::new(updated_producers, completed_txns, None))
    }

    pub(crate) fn update_producers(
        &self,
        batch: &RecordBatch,
        producers: &mut HashMap<i64, ProducerAppendInfo>,
        first_offset: Option<i64>,
        origin: AppendOrigin,
    ) -> AppResult<Option<CompletedTxn>> {
        let producer_id = batch.producer_id();
        let append_info = producers
            .entry(producer_id)
            .or_insert_with(|| self.prepare_update(producer_id, origin));
        append_info.append(batch, first_offset)
    }

    /// Commits one staged delta into the producer map and registers any
    /// transactions it started.
    pub fn update(&self, append_info: ProducerAppendInfo) -> AppResult<()> {
        self.check_ready()?;
        self.apply_update(append_info)
    }

    pub(crate) fn apply_update(&self, append_info: ProducerAppendInfo) -> AppResult<()> {
        if append_info.producer_id == NO_PRODUCER_ID {
            return Err(AppError::IllegalState(format!(
                "invalid producer id {} passed to update for partition {}",
                append_info.producer_id, self.topic_partition
            )));
        }
        debug!(
            "updated producer {} state in partition {}",
            append_info.producer_id, self.topic_partition
        );

        let producer_id = append_info.producer_id;
        let (updated_entry, started_transactions) = append_info.to_entry();
        match self.producers.entry(producer_id) {
            MapEntry::Occupied(mut occupied) => {
                occupied.get_mut().update(updated_entry);
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(updated_entry);
            }
        }

        let mut txns = self.txns.lock();
        for txn in started_transactions {
            txns.ongoing.insert(txn.first_offset, txn);
        }
        Ok(())
    }

    /// Marks a decided transaction complete, recording it in the
    /// aborted index if it was aborted.
    pub fn complete_txn(&self, completed_txn: &CompletedTxn) -> AppResult<()> {
        self.check_ready()?;
        self.apply_complete_txn(completed_txn)
    }

    pub(crate) fn apply_complete_txn(&self, completed_txn: &CompletedTxn) -> AppResult<()> {
        let mut txns = self.txns.lock();
        let mut txn_metadata = txns
            .ongoing
            .remove(&completed_txn.first_offset)
            .ok_or_else(|| {
                AppError::IllegalState(format!(
                    "attempted to complete transaction {:?} on partition {} which was not started",
                    completed_txn, self.topic_partition
                ))
            })?;
        txn_metadata.last_offset = completed_txn.last_offset;

        if completed_txn.is_aborted {
            let last_stable_offset = Self::last_stable_offset_of(&txns, completed_txn);
            txns.aborted.push(AbortedTxn::new(
                completed_txn.producer_id,
                completed_txn.first_offset,
                completed_txn.last_offset,
                last_stable_offset,
            ));
        }
        Ok(())
    }

    /// Computes the last stable offset a completed transaction would
    /// leave behind, without marking it complete. The LSO cannot move
    /// past the earliest transaction still open for another producer.
    pub fn last_stable_offset(&self, completed_txn: &CompletedTxn) -> i64 {
        Self::last_stable_offset_of(&self.txns.lock(), completed_txn)
    }

    fn last_stable_offset_of(txns: &TxnIndex, completed_txn: &CompletedTxn) -> i64 {
        for txn_metadata in txns.ongoing.values() {
            if txn_metadata.producer_id != completed_txn.producer_id {
                return txn_metadata.first_offset;
            }
        }
        completed_txn.last_offset + 1
    }

    /// First offset of the earliest still-open transaction, if any.
    pub fn first_undecided_offset(&self) -> Option<i64> {
        self.txns
            .lock()
            .ongoing
            .values()
            .next()
            .map(|txn| txn.first_offset)
    }

    /// Aborted transactions overlapping the fetch range, in completion
    /// order.
    pub fn get_aborted_index_list(&self, fetch_offset: i64) -> Vec<FetchAbortedTxn> {
        self.txns
            .lock()
            .aborted
            .iter()
            .filter(|aborted| aborted.last_offset >= fetch_offset)
            .map(|aborted| FetchAbortedTxn {
                producer_id: aborted.producer_id,
                first_offset: aborted.first_offset,
            })
            .collect()
    }

    pub(crate) fn is_producer_expired(&self, now_ms: i64, entry: &ProducerStateEntry) -> bool {
        entry.current_txn_first_offset.is_none()
            && now_ms - entry.last_timestamp >= self.max_producer_id_expiration_ms as i64
    }

    /// Expires producer ids idle longer than the configured timeout.
    /// Producers with an open transaction are never expired.
    pub fn remove_expired_producers(&self, now_ms: i64) {
        self.producers
            .retain(|_, entry| !self.is_producer_expired(now_ms, entry));
    }

    /// The last written entry for the given producer id.
    pub fn last_entry(&self, producer_id: i64) -> Option<ProducerStateEntry> {
        self.producers.get(&producer_id).map(|entry| entry.clone())
    }

    /// A copy of the live producer map.
    pub fn active_producers(&self) -> HashMap<i64, ProducerStateEntry> {
        self.producers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn update_map_end_offset(&self, offset: i64) {
        self.last_map_offset.store(offset);
    }

    /// Highest log offset already reflected in the producer map; the
    /// checkpoint point for the next snapshot.
    pub fn map_end_offset(&self) -> i64 {
        self.last_map_offset.load()
    }

    /// Installs one restored entry, re-registering its open transaction
    /// in the ongoing index.
    pub(crate) fn load_producer_entry(&self, entry: ProducerStateEntry) {
        let producer_id = entry.producer_id;
        if let Some(first_offset) = entry.current_txn_first_offset {
            self.txns
                .lock()
                .ongoing
                .insert(first_offset, TxnMetadata::new(producer_id, first_offset));
        }
        self.producers.insert(producer_id, entry);
    }

    /// Clears the producer map and ongoing transactions and resets the
    /// map end offset. The aborted index is intentionally left in
    /// place until restart.
    pub fn truncate(&self) {
        self.producers.clear();
        self.txns.lock().ongoing.clear();
        self.last_map_offset.store(0);
    }

    pub(crate) fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time went backwards")
            .as_millis() as i64
    }
}
