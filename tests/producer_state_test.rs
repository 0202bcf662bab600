//! End-to-end producer state scenarios over in-memory collaborators.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use ledgermq::message::{
    ControlRecordType, EndTransactionMarker, MemoryRecords, RecordBatchBuilder, TopicPartition,
};
use ledgermq::storage::{
    LogCursor, LogEntry, LogStore, MessageId, Position, RecordDecoder, SnapshotMessage,
    SnapshotReader, SnapshotWriter,
};
use ledgermq::txn_state::{
    AnalyzeResult, AppendOrigin, FetchAbortedTxn, ManagerState, ProducerStateManager,
    RecoveryConfig,
};
use ledgermq::AppError;

const EXPIRATION_MS: u32 = 60_000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Entries already hold encoded batches; decoding is concatenation.
struct PassThroughDecoder;

impl RecordDecoder for PassThroughDecoder {
    fn decode(
        &self,
        entries: Vec<LogEntry>,
        _magic: i8,
    ) -> Result<MemoryRecords, AppError> {
        let mut buffer = BytesMut::new();
        for entry in entries {
            buffer.extend_from_slice(&entry.data);
        }
        Ok(MemoryRecords::new(buffer))
    }
}

#[derive(Default)]
struct InMemorySnapshotTopic {
    messages: Mutex<Vec<Bytes>>,
}

impl InMemorySnapshotTopic {
    fn corrupt_last_message(&self, at: usize) {
        let mut messages = self.messages.lock();
        let last = messages.last().expect("no snapshot written");
        let mut corrupted = last.to_vec();
        corrupted[at] ^= 0x01;
        *messages.last_mut().unwrap() = Bytes::from(corrupted);
    }

    fn last_message_len(&self) -> usize {
        self.messages.lock().last().expect("no snapshot written").len()
    }
}

#[async_trait]
impl SnapshotWriter for InMemorySnapshotTopic {
    async fn write(&self, payload: Bytes) -> Result<MessageId, AppError> {
        let mut messages = self.messages.lock();
        messages.push(payload);
        Ok(MessageId {
            ledger_id: 0,
            entry_id: messages.len() as i64 - 1,
        })
    }
}

#[async_trait]
impl SnapshotReader for InMemorySnapshotTopic {
    async fn read_last_valid_message(&self) -> Result<Option<SnapshotMessage>, AppError> {
        let messages = self.messages.lock();
        Ok(messages.last().map(|payload| SnapshotMessage {
            message_id: MessageId {
                ledger_id: 0,
                entry_id: messages.len() as i64 - 1,
            },
            payload: payload.clone(),
        }))
    }
}

#[derive(Default)]
struct InMemoryLogStore {
    batches: Mutex<Vec<(i64, Bytes)>>,
}

impl InMemoryLogStore {
    fn push_records(&self, records: MemoryRecords) {
        let mut batches = self.batches.lock();
        for batch in records {
            batches.push((batch.base_offset(), Bytes::copy_from_slice(batch.as_bytes())));
        }
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn find_position(&self, offset: i64) -> Result<Position, AppError> {
        let batches = self.batches.lock();
        let index = batches
            .iter()
            .position(|(first_offset, _)| *first_offset >= offset)
            .unwrap_or(batches.len());
        Ok(Position {
            ledger_id: 0,
            entry_id: index as i64,
        })
    }

    fn new_non_durable_cursor(
        &self,
        position: Position,
        _cursor_name: &str,
    ) -> Result<Box<dyn LogCursor>, AppError> {
        let entries = self
            .batches
            .lock()
            .iter()
            .enumerate()
            .skip(position.entry_id as usize)
            .map(|(index, (_, data))| LogEntry {
                position: Position {
                    ledger_id: 0,
                    entry_id: index as i64,
                },
                data: data.clone(),
            })
            .collect();
        Ok(Box::new(InMemoryCursor { entries, next: 0 }))
    }
}

struct InMemoryCursor {
    entries: Vec<LogEntry>,
    next: usize,
}

#[async_trait]
impl LogCursor for InMemoryCursor {
    async fn read_entries(&mut self, max_entries: usize) -> Result<Vec<LogEntry>, AppError> {
        if self.next >= self.entries.len() {
            return Err(AppError::NoMoreEntriesToRead);
        }
        let end = (self.next + max_entries).min(self.entries.len());
        let slice = self.entries[self.next..end].to_vec();
        self.next = end;
        Ok(slice)
    }
}

fn new_manager(snapshot_topic: Arc<InMemorySnapshotTopic>) -> ProducerStateManager {
    ProducerStateManager::new(
        TopicPartition::new("orders", 0),
        EXPIRATION_MS,
        RecoveryConfig::default(),
        Arc::new(PassThroughDecoder),
        snapshot_topic.clone(),
        snapshot_topic,
    )
}

async fn ready_manager() -> ProducerStateManager {
    let manager = new_manager(Arc::new(InMemorySnapshotTopic::default()));
    manager.recover(&InMemoryLogStore::default()).await.unwrap();
    manager
}

fn data_batch(
    producer_id: i64,
    epoch: i16,
    base_seq: i32,
    base_offset: i64,
    last_offset: i64,
) -> MemoryRecords {
    let mut builder = RecordBatchBuilder::default();
    builder.producer_info(producer_id, epoch, base_seq);
    for offset in base_offset..=last_offset {
        builder.append_record(offset, now_ms(), "k", "v", None);
    }
    MemoryRecords::from_batches([builder.build()])
}

fn txn_batch(
    producer_id: i64,
    epoch: i16,
    base_seq: i32,
    base_offset: i64,
    last_offset: i64,
) -> MemoryRecords {
    let mut builder = RecordBatchBuilder::default();
    builder.producer_info(producer_id, epoch, base_seq);
    builder.transactional();
    for offset in base_offset..=last_offset {
        builder.append_record(offset, now_ms(), "k", "v", None);
    }
    MemoryRecords::from_batches([builder.build()])
}

fn marker_batch(
    producer_id: i64,
    epoch: i16,
    offset: i64,
    control_type: ControlRecordType,
) -> MemoryRecords {
    MemoryRecords::from_batches([RecordBatchBuilder::end_txn_marker_batch(
        producer_id,
        epoch,
        offset,
        now_ms(),
        EndTransactionMarker::new(control_type, 1),
    )])
}

fn commit(manager: &ProducerStateManager, result: AnalyzeResult) {
    for (_, info) in result.append_info_map {
        manager.update(info).unwrap();
    }
    for txn in &result.completed_txns {
        manager.complete_txn(txn).unwrap();
    }
}

fn analyze_and_commit(manager: &ProducerStateManager, records: MemoryRecords) {
    let result = manager
        .analyze_and_validate_producer_state(records, None, AppendOrigin::Client)
        .unwrap();
    commit(manager, result);
}

#[tokio::test]
async fn test_operations_require_recovery_first() {
    let manager = new_manager(Arc::new(InMemorySnapshotTopic::default()));
    let err = manager
        .analyze_and_validate_producer_state(
            data_batch(7, 0, 0, 100, 104),
            None,
            AppendOrigin::Client,
        )
        .unwrap_err();
    assert!(matches!(err, AppError::IllegalState(_)));
    assert!(manager.take_snapshot().await.is_err());
}

#[tokio::test]
async fn test_single_idempotent_producer() {
    let manager = ready_manager().await;
    analyze_and_commit(&manager, data_batch(7, 0, 0, 100, 104));
    analyze_and_commit(&manager, data_batch(7, 0, 5, 105, 109));

    let entry = manager.last_entry(7).unwrap();
    assert_eq!(entry.last_seq(), 9);
    assert_eq!(entry.last_data_offset(), 109);
    assert_eq!(entry.batch_metadata.len(), 2);
}

#[tokio::test]
async fn test_out_of_order_sequence_rejected() {
    let manager = ready_manager().await;
    analyze_and_commit(&manager, data_batch(7, 0, 0, 100, 104));
    analyze_and_commit(&manager, data_batch(7, 0, 5, 105, 109));

    let err = manager
        .analyze_and_validate_producer_state(
            data_batch(7, 0, 11, 110, 114),
            None,
            AppendOrigin::Client,
        )
        .unwrap_err();
    assert!(matches!(err, AppError::OutOfOrderSequence(_)));

    let entry = manager.last_entry(7).unwrap();
    assert_eq!(entry.last_seq(), 9);
    assert_eq!(entry.last_data_offset(), 109);
}

#[tokio::test]
async fn test_epoch_bump_clears_history() {
    let manager = ready_manager().await;
    analyze_and_commit(&manager, data_batch(7, 0, 0, 100, 104));
    analyze_and_commit(&manager, data_batch(7, 0, 5, 105, 109));

    analyze_and_commit(&manager, data_batch(7, 1, 0, 120, 120));
    let entry = manager.last_entry(7).unwrap();
    assert_eq!(entry.producer_epoch, 1);
    assert_eq!(entry.batch_metadata.len(), 1);
    assert_eq!(entry.last_seq(), 0);
    assert_eq!(entry.last_data_offset(), 120);
}

#[tokio::test]
async fn test_batch_history_bounded_at_five() {
    let manager = ready_manager().await;
    for i in 0..7 {
        analyze_and_commit(&manager, data_batch(7, 0, i, 100 + i as i64, 100 + i as i64));
    }
    let entry = manager.last_entry(7).unwrap();
    assert_eq!(entry.batch_metadata.len(), 5);
    assert_eq!(entry.last_seq(), 6);
}

#[tokio::test]
async fn test_transactional_commit_lifecycle() {
    let manager = ready_manager().await;
    analyze_and_commit(&manager, txn_batch(9, 0, 0, 200, 202));
    assert_eq!(manager.first_undecided_offset(), Some(200));

    let result = manager
        .analyze_and_validate_producer_state(
            marker_batch(9, 0, 210, ControlRecordType::Commit),
            None,
            AppendOrigin::Coordinator,
        )
        .unwrap();
    assert_eq!(result.completed_txns.len(), 1);
    let completed = &result.completed_txns[0];
    assert_eq!(
        (completed.producer_id, completed.first_offset, completed.last_offset, completed.is_aborted),
        (9, 200, 210, false)
    );
    assert_eq!(manager.last_stable_offset(completed), 211);
    commit(&manager, result);

    assert_eq!(manager.first_undecided_offset(), None);
    assert!(manager.get_aborted_index_list(0).is_empty());
}

#[tokio::test]
async fn test_abort_with_concurrent_producer() {
    let manager = ready_manager().await;
    analyze_and_commit(&manager, txn_batch(9, 0, 0, 200, 202));
    analyze_and_commit(&manager, txn_batch(11, 0, 0, 300, 301));

    let result = manager
        .analyze_and_validate_producer_state(
            marker_batch(9, 0, 250, ControlRecordType::Abort),
            None,
            AppendOrigin::Coordinator,
        )
        .unwrap();
    // producer 11's open transaction pins the last stable offset
    assert_eq!(manager.last_stable_offset(&result.completed_txns[0]), 300);
    commit(&manager, result);

    let expected = FetchAbortedTxn {
        producer_id: 9,
        first_offset: 200,
    };
    assert_eq!(manager.get_aborted_index_list(240), vec![expected]);
    assert_eq!(manager.get_aborted_index_list(250), vec![expected]);
    // the aborted range ends at 250, fetches beyond it see nothing
    assert!(manager.get_aborted_index_list(260).is_empty());
    assert_eq!(manager.first_undecided_offset(), Some(300));
}

#[tokio::test]
async fn test_aborted_index_shrinks_as_fetch_offset_grows() {
    let manager = ready_manager().await;
    analyze_and_commit(&manager, txn_batch(9, 0, 0, 200, 202));
    let result = manager
        .analyze_and_validate_producer_state(
            marker_batch(9, 0, 210, ControlRecordType::Abort),
            None,
            AppendOrigin::Coordinator,
        )
        .unwrap();
    commit(&manager, result);

    analyze_and_commit(&manager, txn_batch(9, 0, 3, 300, 302));
    let result = manager
        .analyze_and_validate_producer_state(
            marker_batch(9, 0, 310, ControlRecordType::Abort),
            None,
            AppendOrigin::Coordinator,
        )
        .unwrap();
    commit(&manager, result);

    let at_zero = manager.get_aborted_index_list(0);
    let at_250 = manager.get_aborted_index_list(250);
    let at_320 = manager.get_aborted_index_list(320);
    assert_eq!(at_zero.len(), 2);
    assert_eq!(at_250.len(), 1);
    assert!(at_320.is_empty());
    // monotone shrinking: every element at a higher fetch offset is
    // present at a lower one
    assert!(at_250.iter().all(|t| at_zero.contains(t)));
}

#[tokio::test]
async fn test_duplicate_batch_returns_original_metadata() {
    let manager = ready_manager().await;
    analyze_and_commit(&manager, data_batch(7, 0, 0, 100, 104));

    let result = manager
        .analyze_and_validate_producer_state(
            data_batch(7, 0, 0, 100, 104),
            None,
            AppendOrigin::Client,
        )
        .unwrap();
    let duplicate = result.duplicate.expect("duplicate detected");
    assert_eq!(duplicate.first_seq(), 0);
    assert_eq!(duplicate.last_seq, 4);
    assert_eq!(duplicate.last_offset, 104);
    assert!(result.append_info_map.is_empty());
}

#[tokio::test]
async fn test_snapshot_round_trip_across_restart() {
    let snapshot_topic = Arc::new(InMemorySnapshotTopic::default());
    let store = InMemoryLogStore::default();

    let manager = new_manager(snapshot_topic.clone());
    manager.recover(&store).await.unwrap();
    analyze_and_commit(&manager, data_batch(7, 0, 0, 100, 104));
    analyze_and_commit(&manager, data_batch(7, 0, 5, 105, 109));
    analyze_and_commit(&manager, txn_batch(9, 0, 0, 200, 202));
    manager.update_map_end_offset(500);
    manager.take_snapshot().await.unwrap();

    let restarted = new_manager(snapshot_topic);
    restarted.recover(&store).await.unwrap();
    assert_eq!(restarted.map_end_offset(), 500);

    // a restored entry carries at most the last batch of its history
    let entry = restarted.last_entry(7).unwrap();
    assert_eq!(entry.batch_metadata.len(), 1);
    assert_eq!(entry.last_seq(), 9);
    assert_eq!(entry.last_data_offset(), 109);

    // the open transaction is re-registered in the ongoing index
    let entry = restarted.last_entry(9).unwrap();
    assert_eq!(entry.current_txn_first_offset, Some(200));
    assert_eq!(restarted.first_undecided_offset(), Some(200));
}

#[tokio::test]
async fn test_corrupt_snapshot_fails_recovery() {
    let snapshot_topic = Arc::new(InMemorySnapshotTopic::default());
    let store = InMemoryLogStore::default();

    let manager = new_manager(snapshot_topic.clone());
    manager.recover(&store).await.unwrap();
    analyze_and_commit(&manager, data_batch(7, 0, 0, 100, 104));
    manager.update_map_end_offset(105);
    manager.take_snapshot().await.unwrap();

    // flip one byte in the body
    snapshot_topic.corrupt_last_message(snapshot_topic.last_message_len() - 1);

    let restarted = new_manager(snapshot_topic);
    let err = restarted.recover(&store).await.unwrap_err();
    assert!(matches!(err, AppError::SnapshotCorrupt(_)));
    assert_eq!(restarted.state(), ManagerState::RecoverError);
}

#[tokio::test]
async fn test_restart_replays_appends_after_snapshot() {
    let snapshot_topic = Arc::new(InMemorySnapshotTopic::default());
    let store = InMemoryLogStore::default();

    let manager = new_manager(snapshot_topic.clone());
    manager.recover(&store).await.unwrap();
    analyze_and_commit(&manager, data_batch(7, 0, 0, 100, 104));
    manager.update_map_end_offset(105);
    manager.take_snapshot().await.unwrap();

    // appends after the snapshot live only in the log
    let tail = data_batch(7, 0, 5, 105, 109);
    store.push_records(data_batch(7, 0, 5, 105, 109));
    analyze_and_commit(&manager, tail);

    let restarted = new_manager(snapshot_topic);
    restarted.recover(&store).await.unwrap();
    let entry = restarted.last_entry(7).unwrap();
    assert_eq!(entry.last_seq(), 9);
    assert_eq!(entry.last_data_offset(), 109);
}
