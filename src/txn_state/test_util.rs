//! In-memory collaborator fakes shared by the unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::message::{MemoryRecords, RecordBatchBuilder, TopicPartition};
use crate::storage::{
    LogCursor, LogEntry, LogStore, MessageId, Position, RecordDecoder, SnapshotMessage,
    SnapshotReader, SnapshotWriter,
};
use crate::txn_state::manager::{ManagerState, ProducerStateManager};
use crate::txn_state::recovery::RecoveryConfig;
use crate::{AppError, AppResult};

pub(crate) const TEST_EXPIRATION_MS: u32 = 60_000;

/// Entries hold already-encoded batches, so decoding is concatenation.
pub(crate) struct PassThroughDecoder;

impl RecordDecoder for PassThroughDecoder {
    fn decode(&self, entries: Vec<LogEntry>, _magic: i8) -> AppResult<MemoryRecords> {
        let mut buffer = BytesMut::new();
        for entry in entries {
            buffer.extend_from_slice(&entry.data);
        }
        Ok(MemoryRecords::new(buffer))
    }
}

/// Append-only snapshot topic kept in memory.
#[derive(Default)]
pub(crate) struct InMemorySnapshotTopic {
    messages: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl SnapshotWriter for InMemorySnapshotTopic {
    async fn write(&self, payload: Bytes) -> AppResult<MessageId> {
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
    async fn read_last_valid_message(&self) -> AppResult<Option<SnapshotMessage>> {
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

/// One entry per batch, positioned by batch index.
#[derive(Default)]
pub(crate) struct InMemoryLogStore {
    batches: Mutex<Vec<(i64, Bytes)>>,
    pub(crate) fail_first_reads: Mutex<u32>,
}

impl InMemoryLogStore {
    pub(crate) fn push_records(&self, records: MemoryRecords) {
        let mut batches = self.batches.lock();
        for batch in records {
            batches.push((batch.base_offset(), batch.buffer.freeze()));
        }
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn find_position(&self, offset: i64) -> AppResult<Position> {
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
    ) -> AppResult<Box<dyn LogCursor>> {
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
        Ok(Box::new(InMemoryCursor {
            entries,
            next: 0,
            remaining_failures: *self.fail_first_reads.lock(),
        }))
    }
}

struct InMemoryCursor {
    entries: Vec<LogEntry>,
    next: usize,
    remaining_failures: u32,
}

#[async_trait]
impl LogCursor for InMemoryCursor {
    async fn read_entries(&mut self, max_entries: usize) -> AppResult<Vec<LogEntry>> {
        if self.remaining_failures > 0 {
            self.remaining_failures -= 1;
            return Err(AppError::DetailedIoError("injected read failure".to_string()));
        }
        if self.next >= self.entries.len() {
            return Err(AppError::NoMoreEntriesToRead);
        }
        let end = (self.next + max_entries).min(self.entries.len());
        let slice = self.entries[self.next..end].to_vec();
        self.next = end;
        Ok(slice)
    }
}

pub(crate) fn test_manager(snapshot_topic: Arc<InMemorySnapshotTopic>) -> ProducerStateManager {
    ProducerStateManager::new(
        TopicPartition::new("orders", 0),
        TEST_EXPIRATION_MS,
        RecoveryConfig::default(),
        Arc::new(PassThroughDecoder),
        snapshot_topic.clone(),
        snapshot_topic,
    )
}

pub(crate) fn ready_manager() -> ProducerStateManager {
    let manager = test_manager(Arc::new(InMemorySnapshotTopic::default()));
    manager.state.store(ManagerState::Ready);
    manager
}

pub(crate) fn transactional_batch(
    producer_id: i64,
    producer_epoch: i16,
    base_seq: i32,
    base_offset: i64,
    count: i64,
) -> MemoryRecords {
    let mut builder = RecordBatchBuilder::default();
    builder.producer_info(producer_id, producer_epoch, base_seq);
    builder.transactional();
    for i in 0..count {
        builder.append_record(base_offset + i, 1_000 + i, "k", "v", None);
    }
    MemoryRecords::from_batches([builder.build()])
}
