//! Producer state snapshots.
//!
//! Binary layout, big-endian:
//!
//! ```text
//! offset  size  field
//!   0      2    version (= 1)
//!   2      4    crc32c over every byte from offset 6 to the end
//!   6      8    snapshot offset
//!  14      4    entry count
//!  18      *    entries: producer_id (8), epoch (2), last_sequence (4),
//!               last_offset (8), offset_delta (4), timestamp (8),
//!               coordinator_epoch (4), current_txn_first_offset (8, -1 = none)
//! ```

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, info};

use crate::storage::MessageId;
use crate::txn_state::entry::{BatchMetadata, ProducerStateEntry};
use crate::txn_state::manager::ProducerStateManager;
use crate::{AppError, AppResult};

const PRODUCER_SNAPSHOT_VERSION: i16 = 1;
/// First byte covered by the CRC: everything after the CRC field.
const CRC_COVERED_OFFSET: usize = 6;
const ENTRY_SIZE: usize = 8 + 2 + 4 + 8 + 4 + 8 + 4 + 8;

/// One producer entry as persisted: only the last batch of the history
/// survives a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SnapshotEntry {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub last_seq: i32,
    pub last_offset: i64,
    pub offset_delta: i32,
    pub timestamp: i64,
    pub coordinator_epoch: i32,
    pub current_txn_first_offset: i64,
}

impl SnapshotEntry {
    pub(crate) fn from_state_entry(producer_id: i64, entry: &ProducerStateEntry) -> Self {
        Self {
            producer_id,
            producer_epoch: entry.producer_epoch,
            last_seq: entry.last_seq(),
            last_offset: entry.last_data_offset(),
            offset_delta: entry.last_offset_delta(),
            timestamp: entry.last_timestamp,
            coordinator_epoch: entry.coordinator_epoch,
            current_txn_first_offset: entry.current_txn_first_offset.unwrap_or(-1),
        }
    }

    pub(crate) fn into_state_entry(self) -> ProducerStateEntry {
        let mut batch_metadata = VecDeque::new();
        if self.last_offset >= 0 {
            batch_metadata.push_back(BatchMetadata::new(
                self.last_seq,
                self.last_offset,
                self.offset_delta,
                self.timestamp,
            ));
        }
        ProducerStateEntry {
            producer_id: self.producer_id,
            batch_metadata,
            producer_epoch: self.producer_epoch,
            coordinator_epoch: self.coordinator_epoch,
            last_timestamp: self.timestamp,
            current_txn_first_offset: (self.current_txn_first_offset >= 0)
                .then_some(self.current_txn_first_offset),
        }
    }
}

pub(crate) fn encode(snapshot_offset: i64, entries: &[SnapshotEntry]) -> Bytes {
    let mut buffer =
        BytesMut::with_capacity(CRC_COVERED_OFFSET + 8 + 4 + entries.len() * ENTRY_SIZE);
    buffer.put_i16(PRODUCER_SNAPSHOT_VERSION);
    buffer.put_u32(0); // crc, filled below
    buffer.put_i64(snapshot_offset);
    buffer.put_i32(entries.len() as i32);
    for entry in entries {
        buffer.put_i64(entry.producer_id);
        buffer.put_i16(entry.producer_epoch);
        buffer.put_i32(entry.last_seq);
        buffer.put_i64(entry.last_offset);
        buffer.put_i32(entry.offset_delta);
        buffer.put_i64(entry.timestamp);
        buffer.put_i32(entry.coordinator_epoch);
        buffer.put_i64(entry.current_txn_first_offset);
    }

    let crc = crc32c::crc32c(&buffer[CRC_COVERED_OFFSET..]);
    buffer[2..6].copy_from_slice(&crc.to_be_bytes());
    buffer.freeze()
}

pub(crate) fn decode(bytes: &[u8]) -> AppResult<(i64, Vec<SnapshotEntry>)> {
    let mut buf = bytes;
    ensure_remaining(buf, 2 + 4 + 8 + 4)?;
    let version = buf.get_i16();
    if version != PRODUCER_SNAPSHOT_VERSION {
        return Err(AppError::SnapshotCorrupt(format!(
            "snapshot contained an unknown file version {}",
            version
        )));
    }
    let crc = buf.get_u32();
    let computed_crc = crc32c::crc32c(&bytes[CRC_COVERED_OFFSET..]);
    if crc != computed_crc {
        return Err(AppError::SnapshotCorrupt(format!(
            "stored crc {} does not match computed crc {}",
            crc, computed_crc
        )));
    }

    let snapshot_offset = buf.get_i64();
    let entry_count = buf.get_i32();
    if entry_count < 0 {
        return Err(AppError::SnapshotCorrupt(format!(
            "negative entry count {}",
            entry_count
        )));
    }

    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        ensure_remaining(buf, ENTRY_SIZE)?;
        entries.push(SnapshotEntry {
            producer_id: buf.get_i64(),
            producer_epoch: buf.get_i16(),
            last_seq: buf.get_i32(),
            last_offset: buf.get_i64(),
            offset_delta: buf.get_i32(),
            timestamp: buf.get_i64(),
            coordinator_epoch: buf.get_i32(),
            current_txn_first_offset: buf.get_i64(),
        });
    }
    Ok((snapshot_offset, entries))
}

fn ensure_remaining(buf: &[u8], needed: usize) -> AppResult<()> {
    if buf.remaining() < needed {
        return Err(AppError::SnapshotCorrupt(format!(
            "snapshot is truncated: {} bytes remaining, {} needed",
            buf.remaining(),
            needed
        )));
    }
    Ok(())
}

impl ProducerStateManager {
    fn encode_snapshot(&self) -> Bytes {
        let entries: Vec<SnapshotEntry> = self
            .producers
            .iter()
            .map(|entry| SnapshotEntry::from_state_entry(*entry.key(), entry.value()))
            .collect();
        encode(self.map_end_offset(), &entries)
    }

    /// Persists the current producer map at the map end offset. Calls
    /// are serialized; a failed write surfaces to the caller, which may
    /// retry.
    pub async fn take_snapshot(&self) -> AppResult<MessageId> {
        self.check_ready()?;
        let _guard = self.snapshot_gate.lock().await;
        let payload = self.encode_snapshot();
        let message_id = self.snapshot_writer.write(payload).await?;
        info!(
            "took producer state snapshot for {} at offset {}",
            self.topic_partition,
            self.map_end_offset()
        );
        Ok(message_id)
    }

    /// Restores state from the last valid snapshot message, dropping
    /// entries that are already expired. Absence of a snapshot is not
    /// an error.
    pub(crate) async fn load_from_snapshot(&self) -> AppResult<()> {
        let message = self
            .snapshot_reader
            .read_last_valid_message()
            .await
            .map_err(|e| {
                error!(
                    "failed to read snapshot log for {}: {}",
                    self.topic_partition, e
                );
                e
            })?;
        let Some(message) = message else {
            info!("no producer state snapshot for {}", self.topic_partition);
            return Ok(());
        };

        let (snapshot_offset, entries) = decode(&message.payload)?;
        let now_ms = Self::now_ms();
        for entry in entries {
            let entry = entry.into_state_entry();
            if !self.is_producer_expired(now_ms, &entry) {
                self.load_producer_entry(entry);
            }
        }
        self.update_map_end_offset(snapshot_offset);
        info!(
            "finish loading snapshot for {}, map end offset {}",
            self.topic_partition, snapshot_offset
        );
        Ok(())
    }
}
