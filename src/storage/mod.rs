//! Interfaces to the ledger storage backing each partition.
//!
//! The producer state core never touches the storage engine directly:
//! it replays the log through a [`LogCursor`] obtained from a
//! [`LogStore`], turns raw entries into batches with a
//! [`RecordDecoder`], and checkpoints itself through the snapshot
//! writer/reader pair of the partition's system topic.

use async_trait::async_trait;
use bytes::Bytes;

use crate::message::MemoryRecords;
use crate::AppResult;

/// Position of one entry inside the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Position {
    pub ledger_id: i64,
    pub entry_id: i64,
}

/// Identity assigned by the ledger to an appended message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageId {
    pub ledger_id: i64,
    pub entry_id: i64,
}

/// One raw entry read from the ledger, not yet decoded.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub position: Position,
    pub data: Bytes,
}

/// The last valid message of the snapshot topic.
#[derive(Debug, Clone)]
pub struct SnapshotMessage {
    pub message_id: MessageId,
    pub payload: Bytes,
}

/// Read access to a partition's backing ledger.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Resolves the ledger position of the first entry with an offset
    /// greater than `offset`.
    async fn find_position(&self, offset: i64) -> AppResult<Position>;

    /// Opens a non-durable cursor at `position`. The cursor does not
    /// survive the process and leaves no state in the ledger.
    fn new_non_durable_cursor(
        &self,
        position: Position,
        cursor_name: &str,
    ) -> AppResult<Box<dyn LogCursor>>;
}

/// Forward reader over ledger entries.
///
/// `read_entries` returns at most `max_entries` entries; an empty result
/// or [`crate::AppError::NoMoreEntriesToRead`] means the tail was
/// reached. Any other error is transient from the caller's perspective.
#[async_trait]
pub trait LogCursor: Send + Sync {
    async fn read_entries(&mut self, max_entries: usize) -> AppResult<Vec<LogEntry>>;
}

/// Turns raw ledger entries into record batches.
pub trait RecordDecoder: Send + Sync {
    fn decode(&self, entries: Vec<LogEntry>, magic: i8) -> AppResult<MemoryRecords>;
}

/// Appender for the partition's producer-state snapshot topic.
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    async fn write(&self, payload: Bytes) -> AppResult<MessageId>;
}

/// Reader for the partition's producer-state snapshot topic.
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    /// Returns the last message whose payload is intact, or `None` when
    /// the topic has never been written.
    async fn read_last_valid_message(&self) -> AppResult<Option<SnapshotMessage>>;
}
