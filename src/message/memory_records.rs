//! In-memory view over a buffer of concatenated record batches.

use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

use crate::message::constants::LOG_OVERHEAD;
use crate::message::record_batch::RecordBatch;

/// A sequence of record batches backed by one contiguous buffer, as
/// produced by the wire decoder. Iteration yields each batch without
/// copying the underlying bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryRecords {
    pub(crate) buffer: BytesMut,
}

impl std::fmt::Debug for MemoryRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecords")
            .field("buffer length", &self.buffer.len())
            .finish()
    }
}

impl MemoryRecords {
    pub fn new(buffer: BytesMut) -> MemoryRecords {
        MemoryRecords { buffer }
    }

    pub fn empty() -> Self {
        MemoryRecords {
            buffer: BytesMut::new(),
        }
    }

    /// Concatenates already-built batches into one buffer.
    pub fn from_batches(batches: impl IntoIterator<Item = RecordBatch>) -> Self {
        let mut buffer = BytesMut::new();
        for batch in batches {
            buffer.put_slice(batch.buffer.as_ref());
        }
        MemoryRecords { buffer }
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Size of the next batch in the buffer: batch length field plus the
    /// base offset/length prefix it does not count.
    fn next_batch_size(&self) -> Option<usize> {
        if self.buffer.len() < LOG_OVERHEAD {
            return None;
        }
        let mut cursor = Cursor::new(self.buffer.as_ref());
        let _base_offset = cursor.get_i64();
        let length = cursor.get_i32();
        Some(length as usize + LOG_OVERHEAD)
    }
}

impl Iterator for MemoryRecords {
    type Item = RecordBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let batch_size = self.next_batch_size()?;
        if batch_size > self.buffer.len() {
            return None;
        }
        let batch_buffer = self.buffer.split_to(batch_size);
        Some(RecordBatch::new(batch_buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::record_batch::RecordBatchBuilder;

    #[test]
    fn test_memory_records_iteration() {
        let mut first = RecordBatchBuilder::default();
        first.producer_info(7, 0, 0);
        first.append_record(100, 1_000, "k1", "v1", None);

        let mut second = RecordBatchBuilder::default();
        second.producer_info(7, 0, 1);
        second.append_record(101, 1_001, "k2", "v2", None);

        let mut records = MemoryRecords::from_batches([first.build(), second.build()]);

        let batch = records.next().unwrap();
        assert_eq!(batch.base_offset(), 100);
        assert_eq!(batch.base_sequence(), 0);
        let batch = records.next().unwrap();
        assert_eq!(batch.base_offset(), 101);
        assert_eq!(batch.base_sequence(), 1);
        assert!(records.next().is_none());
    }

    #[test]
    fn test_empty_records() {
        let mut records = MemoryRecords::empty();
        assert!(records.is_empty());
        assert!(records.next().is_none());
    }
}
