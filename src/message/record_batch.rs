use bytes::{Buf, BufMut, BytesMut};
use integer_encoding::VarInt;
use std::io::{Cursor, Write};

use crate::message::constants::*;
use crate::message::control_record::EndTransactionMarker;
use crate::message::record::{Record, RecordHeader};
use crate::{AppError, AppResult};

/// One record batch backed by its wire-format buffer (magic 2).
///
/// All header accessors read directly from the buffer, so a batch handed
/// out by [`crate::message::MemoryRecords`] is never re-encoded.
pub struct RecordBatch {
    pub(crate) buffer: BytesMut,
}

impl RecordBatch {
    pub fn new(buffer: BytesMut) -> Self {
        RecordBatch { buffer }
    }

    pub fn base_offset(&self) -> i64 {
        self.get_field(BASE_OFFSET_OFFSET, |c| c.get_i64())
    }

    pub fn last_offset_delta(&self) -> i32 {
        self.get_field(LAST_OFFSET_DELTA_OFFSET, |c| c.get_i32())
    }

    pub fn last_offset(&self) -> i64 {
        self.base_offset() + self.last_offset_delta() as i64
    }

    pub fn base_timestamp(&self) -> i64 {
        self.get_field(FIRST_TIMESTAMP_OFFSET, |c| c.get_i64())
    }

    pub fn max_timestamp(&self) -> i64 {
        self.get_field(MAX_TIMESTAMP_OFFSET, |c| c.get_i64())
    }

    pub fn producer_id(&self) -> i64 {
        self.get_field(PRODUCER_ID_OFFSET, |c| c.get_i64())
    }

    pub fn producer_epoch(&self) -> i16 {
        self.get_field(PRODUCER_EPOCH_OFFSET, |c| c.get_i16())
    }

    pub fn base_sequence(&self) -> i32 {
        self.get_field(BASE_SEQUENCE_OFFSET, |c| c.get_i32())
    }

    /// Last sequence covered by this batch, derived from the base
    /// sequence and the offset delta on the sequence ring.
    pub fn last_sequence(&self) -> i32 {
        let base_sequence = self.base_sequence();
        if base_sequence == NO_SEQUENCE {
            return NO_SEQUENCE;
        }
        increment_sequence(base_sequence, self.last_offset_delta())
    }

    pub fn attributes(&self) -> i16 {
        self.get_field(ATTRIBUTES_OFFSET, |c| c.get_i16())
    }

    pub fn is_transactional(&self) -> bool {
        self.attributes() & TRANSACTIONAL_FLAG_MASK != 0
    }

    pub fn is_control_batch(&self) -> bool {
        self.attributes() & CONTROL_FLAG_MASK != 0
    }

    pub fn has_producer_id(&self) -> bool {
        self.producer_id() > NO_PRODUCER_ID
    }

    pub fn records_count(&self) -> i32 {
        self.get_field(RECORDS_COUNT_OFFSET, |c| c.get_i32())
    }

    /// The batch in its wire format.
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    /// Timestamp of one inner record; deltas are relative to the batch
    /// base timestamp.
    pub fn record_timestamp(&self, record: &Record) -> i64 {
        self.base_timestamp() + record.timestamp_delta
    }

    fn get_field<T>(&self, offset: i32, getter: impl Fn(&mut Cursor<&[u8]>) -> T) -> T {
        let mut cursor = Cursor::new(self.buffer.as_ref());
        cursor.set_position(offset as u64);
        getter(&mut cursor)
    }

    pub fn set_base_offset(&mut self, base_offset: i64) {
        let mut cursor = Cursor::new(self.buffer.as_mut());
        cursor.set_position(BASE_OFFSET_OFFSET as u64);
        cursor
            .write_all(&base_offset.to_be_bytes())
            .expect("batch header shorter than overhead");
    }

    /// Decodes the inner records of this batch.
    pub fn records(&self) -> AppResult<Vec<Record>> {
        if self.buffer.len() < RECORD_BATCH_OVERHEAD as usize {
            return Err(truncated());
        }
        let mut cursor = Cursor::new(self.buffer.as_ref());
        cursor.advance(RECORDS_COUNT_OFFSET as usize);
        let record_count = cursor.get_i32();

        let mut records = Vec::with_capacity(record_count.max(0) as usize);
        for _ in 0..record_count {
            let (_record_length, _) = decode_varint_i32(&mut cursor)?;
            records.push(Self::decode_record_body(&mut cursor)?);
        }
        Ok(records)
    }

    fn decode_record_body(cursor: &mut Cursor<&[u8]>) -> AppResult<Record> {
        if cursor.remaining() < 1 {
            return Err(truncated());
        }
        let attributes = cursor.get_i8();
        let (timestamp_delta, _) = decode_varint_i64(cursor)?;
        let (offset_delta, _) = decode_varint_i64(cursor)?;

        let key = Self::decode_sized_bytes(cursor)?;
        let value = Self::decode_sized_bytes(cursor)?;

        let (headers_count, _) = decode_varint_i32(cursor)?;
        let mut headers = Vec::with_capacity(headers_count.max(0) as usize);
        for _ in 0..headers_count {
            let header_key = Self::decode_sized_bytes(cursor)?
                .ok_or_else(|| AppError::CorruptMessage("record header key is null".to_string()))?;
            let header_key = String::from_utf8(header_key)
                .map_err(|e| AppError::CorruptMessage(format!("record header key: {}", e)))?;
            let header_value = Self::decode_sized_bytes(cursor)?;
            headers.push(RecordHeader {
                header_key,
                header_value,
            });
        }

        Ok(Record {
            attributes,
            timestamp_delta,
            offset_delta: offset_delta as i32,
            key,
            value,
            headers,
        })
    }

    fn decode_sized_bytes(cursor: &mut Cursor<&[u8]>) -> AppResult<Option<Vec<u8>>> {
        let (len, _) = decode_varint_i32(cursor)?;
        if len < 0 {
            return Ok(None);
        }
        if cursor.remaining() < len as usize {
            return Err(truncated());
        }
        Ok(Some(cursor.copy_to_bytes(len as usize).to_vec()))
    }
}

impl std::fmt::Debug for RecordBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBatch")
            .field("base_offset", &self.base_offset())
            .field("last_offset", &self.last_offset())
            .field("producer_id", &self.producer_id())
            .field("producer_epoch", &self.producer_epoch())
            .field("base_sequence", &self.base_sequence())
            .field("transactional", &self.is_transactional())
            .field("control", &self.is_control_batch())
            .field("records_count", &self.records_count())
            .finish()
    }
}

fn truncated() -> AppError {
    AppError::CorruptMessage("record batch body is truncated".to_string())
}

fn decode_varint_i32(cursor: &mut Cursor<&[u8]>) -> AppResult<(i32, usize)> {
    let (value, read) = i32::decode_var(cursor.chunk()).ok_or_else(truncated)?;
    cursor.advance(read);
    Ok((value, read))
}

fn decode_varint_i64(cursor: &mut Cursor<&[u8]>) -> AppResult<(i64, usize)> {
    let (value, read) = i64::decode_var(cursor.chunk()).ok_or_else(truncated)?;
    cursor.advance(read);
    Ok((value, read))
}

/// Advances a sequence by `delta` on the signed 32-bit ring, wrapping
/// the successor of `i32::MAX` to 0.
pub(crate) fn increment_sequence(sequence: i32, delta: i32) -> i32 {
    if sequence > i32::MAX - delta {
        delta - (i32::MAX - sequence) - 1
    } else {
        sequence + delta
    }
}

/// Builds record batches in the wire format, used by the broker's
/// produce path and by tests.
pub struct RecordBatchBuilder {
    buffer: BytesMut,
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    transactional: bool,
    control: bool,
    base_offset: Option<i64>,
    last_offset: i64,
    base_timestamp: Option<i64>,
    max_timestamp: i64,
    record_count: i32,
}

impl Default for RecordBatchBuilder {
    fn default() -> Self {
        let mut builder = RecordBatchBuilder {
            buffer: BytesMut::with_capacity(RECORD_BATCH_OVERHEAD as usize),
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            base_sequence: NO_SEQUENCE,
            transactional: false,
            control: false,
            base_offset: None,
            last_offset: 0,
            base_timestamp: None,
            max_timestamp: NO_TIMESTAMP,
            record_count: 0,
        };
        builder.initialize_buffer();
        builder
    }
}

impl RecordBatchBuilder {
    fn initialize_buffer(&mut self) {
        self.buffer.put_i64(0); // base offset
        self.buffer.put_i32(0); // length
        self.buffer.put_i32(NO_PARTITION_LEADER_EPOCH);
        self.buffer.put_i8(MAGIC);
        self.buffer.put_i32(-1); // crc
        self.buffer.put_i16(0); // attributes
        self.buffer.put_i32(-1); // last offset delta
        self.buffer.put_i64(NO_TIMESTAMP); // first timestamp
        self.buffer.put_i64(NO_TIMESTAMP); // max timestamp
        self.buffer.put_i64(NO_PRODUCER_ID);
        self.buffer.put_i16(NO_PRODUCER_EPOCH);
        self.buffer.put_i32(NO_SEQUENCE);
        self.buffer.put_i32(0); // record count
    }

    pub fn producer_info(&mut self, producer_id: i64, producer_epoch: i16, base_sequence: i32) {
        self.producer_id = producer_id;
        self.producer_epoch = producer_epoch;
        self.base_sequence = base_sequence;
    }

    pub fn transactional(&mut self) {
        self.transactional = true;
    }

    pub fn append_record<T: AsRef<[u8]>>(
        &mut self,
        offset: i64,
        timestamp: i64,
        key: T,
        value: T,
        headers: Option<Vec<RecordHeader>>,
    ) {
        let base_offset = *self.base_offset.get_or_insert(offset);
        let offset_delta = offset - base_offset;
        self.last_offset = offset;

        let base_timestamp = *self.base_timestamp.get_or_insert(timestamp);
        let timestamp_delta = timestamp.saturating_sub(base_timestamp);
        self.max_timestamp = self.max_timestamp.max(timestamp);

        let key = key.as_ref();
        let value = value.as_ref();
        let key_size = Self::sized_bytes_space(key);
        let value_size = Self::sized_bytes_space(value);
        let headers_size = headers
            .as_ref()
            .map_or(0, |hs| hs.iter().map(|h| h.size()).sum::<i32>() as usize);
        let headers_count_size = headers
            .as_ref()
            .map_or(0i32.required_space(), |hs| hs.len().required_space());

        let record_size = 1 // attributes
            + timestamp_delta.required_space()
            + offset_delta.required_space()
            + key_size
            + value_size
            + headers_size
            + headers_count_size;

        self.write_record(record_size, timestamp_delta, offset_delta, key, value, headers);
        self.record_count += 1;
    }

    fn write_record(
        &mut self,
        record_size: usize,
        timestamp_delta: i64,
        offset_delta: i64,
        key: &[u8],
        value: &[u8],
        headers: Option<Vec<RecordHeader>>,
    ) {
        self.buffer
            .put_slice((record_size as i32).encode_var_vec().as_ref());
        self.buffer.put_i8(0); // attributes
        self.buffer
            .put_slice(timestamp_delta.encode_var_vec().as_ref());
        self.buffer
            .put_slice(offset_delta.encode_var_vec().as_ref());

        Self::put_sized_bytes(&mut self.buffer, key);
        Self::put_sized_bytes(&mut self.buffer, value);

        self.buffer.put_slice(
            headers
                .as_ref()
                .map_or(0i32, |hs| hs.len() as i32)
                .encode_var_vec()
                .as_ref(),
        );
        if let Some(headers) = headers {
            for header in headers {
                self.buffer
                    .put_slice(header.header_key.len().encode_var_vec().as_ref());
                self.buffer.put_slice(header.header_key.as_bytes());
                if let Some(header_value) = header.header_value {
                    self.buffer
                        .put_slice(header_value.len().encode_var_vec().as_ref());
                    self.buffer.put_slice(&header_value);
                } else {
                    self.buffer.put_slice((-1).encode_var_vec().as_ref());
                }
            }
        }
    }

    pub fn build(mut self) -> RecordBatch {
        let mut attributes = 0i16;
        if self.transactional {
            attributes |= TRANSACTIONAL_FLAG_MASK;
        }
        if self.control {
            attributes |= CONTROL_FLAG_MASK;
        }

        let base_offset = self.base_offset.unwrap_or(0);
        let base_timestamp = self.base_timestamp.unwrap_or(NO_TIMESTAMP);
        let last_offset_delta = (self.last_offset - base_offset) as i32;

        let mut cursor = Cursor::new(self.buffer.as_mut());
        cursor.set_position(BASE_OFFSET_OFFSET as u64);
        write_be(&mut cursor, &base_offset.to_be_bytes());

        cursor.set_position(LENGTH_OFFSET as u64);
        let length = cursor.remaining() as i32 - 4;
        write_be(&mut cursor, &length.to_be_bytes());

        cursor.set_position(ATTRIBUTES_OFFSET as u64);
        write_be(&mut cursor, &attributes.to_be_bytes());

        cursor.set_position(LAST_OFFSET_DELTA_OFFSET as u64);
        write_be(&mut cursor, &last_offset_delta.to_be_bytes());

        cursor.set_position(FIRST_TIMESTAMP_OFFSET as u64);
        write_be(&mut cursor, &base_timestamp.to_be_bytes());

        cursor.set_position(MAX_TIMESTAMP_OFFSET as u64);
        write_be(&mut cursor, &self.max_timestamp.to_be_bytes());

        cursor.set_position(PRODUCER_ID_OFFSET as u64);
        write_be(&mut cursor, &self.producer_id.to_be_bytes());

        cursor.set_position(PRODUCER_EPOCH_OFFSET as u64);
        write_be(&mut cursor, &self.producer_epoch.to_be_bytes());

        cursor.set_position(BASE_SEQUENCE_OFFSET as u64);
        write_be(&mut cursor, &self.base_sequence.to_be_bytes());

        cursor.set_position(RECORDS_COUNT_OFFSET as u64);
        write_be(&mut cursor, &self.record_count.to_be_bytes());

        cursor.set_position(ATTRIBUTES_OFFSET as u64);
        let crc = crc32c::crc32c(cursor.chunk());
        cursor.set_position(CRC_OFFSET as u64);
        write_be(&mut cursor, &(crc as i32).to_be_bytes());

        RecordBatch::new(self.buffer)
    }

    /// Builds the control batch the coordinator appends when deciding a
    /// transaction: one marker record, control + transactional bits set.
    pub fn end_txn_marker_batch(
        producer_id: i64,
        producer_epoch: i16,
        base_offset: i64,
        timestamp: i64,
        marker: EndTransactionMarker,
    ) -> RecordBatch {
        let mut builder = RecordBatchBuilder::default();
        builder.producer_info(producer_id, producer_epoch, NO_SEQUENCE);
        builder.transactional = true;
        builder.control = true;
        builder.append_record(
            base_offset,
            timestamp,
            marker.serialize_key(),
            marker.serialize_value(),
            None,
        );
        builder.build()
    }

    fn sized_bytes_space(data: &[u8]) -> usize {
        if data.is_empty() {
            (-1).required_space()
        } else {
            data.len().required_space() + data.len()
        }
    }

    fn put_sized_bytes(buffer: &mut BytesMut, data: &[u8]) {
        if data.is_empty() {
            buffer.put_slice((-1).encode_var_vec().as_ref());
        } else {
            buffer.put_slice((data.len() as i32).encode_var_vec().as_ref());
            buffer.put_slice(data);
        }
    }
}

fn write_be(cursor: &mut Cursor<&mut [u8]>, bytes: &[u8]) {
    cursor
        .write_all(bytes)
        .expect("batch header shorter than overhead");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::control_record::ControlRecordType;

    #[test]
    fn test_data_batch_header_fields() {
        let mut builder = RecordBatchBuilder::default();
        builder.producer_info(7, 0, 0);
        for i in 0..5 {
            builder.append_record(100 + i, 1_000 + i, "k", "v", None);
        }
        let batch = builder.build();

        assert_eq!(batch.base_offset(), 100);
        assert_eq!(batch.last_offset(), 104);
        assert_eq!(batch.producer_id(), 7);
        assert_eq!(batch.producer_epoch(), 0);
        assert_eq!(batch.base_sequence(), 0);
        assert_eq!(batch.last_sequence(), 4);
        assert_eq!(batch.max_timestamp(), 1_004);
        assert_eq!(batch.records_count(), 5);
        assert!(!batch.is_transactional());
        assert!(!batch.is_control_batch());
    }

    #[test]
    fn test_transactional_attribute() {
        let mut builder = RecordBatchBuilder::default();
        builder.producer_info(9, 0, 0);
        builder.transactional();
        builder.append_record(200, 1_000, "k", "v", None);
        let batch = builder.build();
        assert!(batch.is_transactional());
        assert!(!batch.is_control_batch());
    }

    #[test]
    fn test_last_sequence_wraps_at_max() {
        let mut builder = RecordBatchBuilder::default();
        builder.producer_info(7, 0, i32::MAX - 1);
        for i in 0..3 {
            builder.append_record(500 + i, 1_000, "k", "v", None);
        }
        let batch = builder.build();
        assert_eq!(batch.base_sequence(), i32::MAX - 1);
        // MAX-1, MAX, 0
        assert_eq!(batch.last_sequence(), 0);
    }

    #[test]
    fn test_end_txn_marker_batch_round_trip() {
        let marker = EndTransactionMarker::new(ControlRecordType::Abort, 2);
        let batch = RecordBatchBuilder::end_txn_marker_batch(9, 1, 250, 2_000, marker);

        assert!(batch.is_control_batch());
        assert!(batch.is_transactional());
        assert_eq!(batch.base_offset(), 250);
        assert_eq!(batch.records_count(), 1);

        let records = batch.records().unwrap();
        assert_eq!(records.len(), 1);
        let decoded = EndTransactionMarker::deserialize(&records[0]).unwrap();
        assert_eq!(decoded, marker);
        assert_eq!(batch.record_timestamp(&records[0]), 2_000);
    }

    #[test]
    fn test_records_round_trip_with_headers() {
        let mut builder = RecordBatchBuilder::default();
        let headers = vec![RecordHeader::new("h1".to_string(), b"hv".as_slice())];
        builder.append_record(0, 1_000, "key", "value", Some(headers));
        let batch = builder.build();

        let records = batch.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some(b"key".as_ref()));
        assert_eq!(records[0].value.as_deref(), Some(b"value".as_ref()));
        assert_eq!(records[0].headers.len(), 1);
        assert_eq!(records[0].headers[0].header_key, "h1");
    }
}
