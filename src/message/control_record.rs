//! Control records written by the transaction coordinator.
//!
//! A control batch carries a single record whose key identifies the
//! control type and whose value carries the marker payload. Layout
//! (big-endian): key = version (i16) + type (i16), value = version (i16)
//! + coordinator epoch (i32).

use bytes::Buf;

use crate::message::record::Record;
use crate::{AppError, AppResult};

const CONTROL_RECORD_KEY_VERSION: i16 = 0;
const END_TXN_MARKER_VALUE_VERSION: i16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecordType {
    Abort,
    Commit,
}

impl ControlRecordType {
    pub fn type_id(&self) -> i16 {
        match self {
            ControlRecordType::Abort => 0,
            ControlRecordType::Commit => 1,
        }
    }

    fn from_type_id(type_id: i16) -> Option<Self> {
        match type_id {
            0 => Some(ControlRecordType::Abort),
            1 => Some(ControlRecordType::Commit),
            _ => None,
        }
    }
}

/// Marker appended by the coordinator when a transaction is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndTransactionMarker {
    pub control_type: ControlRecordType,
    pub coordinator_epoch: i32,
}

impl EndTransactionMarker {
    pub fn new(control_type: ControlRecordType, coordinator_epoch: i32) -> Self {
        Self {
            control_type,
            coordinator_epoch,
        }
    }

    /// Decodes a marker from a control record's key and value.
    pub fn deserialize(record: &Record) -> AppResult<EndTransactionMarker> {
        let key = record.key.as_deref().ok_or_else(|| {
            AppError::CorruptMessage("control record has no key".to_string())
        })?;
        if key.len() < 4 {
            return Err(AppError::CorruptMessage(format!(
                "control record key is {} bytes, expected at least 4",
                key.len()
            )));
        }
        let mut key_buf = key;
        let key_version = key_buf.get_i16();
        if key_version < CONTROL_RECORD_KEY_VERSION {
            return Err(AppError::CorruptMessage(format!(
                "invalid control record key version {}",
                key_version
            )));
        }
        let type_id = key_buf.get_i16();
        let control_type = ControlRecordType::from_type_id(type_id).ok_or_else(|| {
            AppError::CorruptMessage(format!("unknown control record type {}", type_id))
        })?;

        let value = record.value.as_deref().ok_or_else(|| {
            AppError::CorruptMessage("end transaction marker has no value".to_string())
        })?;
        if value.len() < 6 {
            return Err(AppError::CorruptMessage(format!(
                "end transaction marker value is {} bytes, expected at least 6",
                value.len()
            )));
        }
        let mut value_buf = value;
        let value_version = value_buf.get_i16();
        if value_version < END_TXN_MARKER_VALUE_VERSION {
            return Err(AppError::CorruptMessage(format!(
                "invalid end transaction marker version {}",
                value_version
            )));
        }
        let coordinator_epoch = value_buf.get_i32();

        Ok(EndTransactionMarker {
            control_type,
            coordinator_epoch,
        })
    }

    pub fn serialize_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(4);
        key.extend_from_slice(&CONTROL_RECORD_KEY_VERSION.to_be_bytes());
        key.extend_from_slice(&self.control_type.type_id().to_be_bytes());
        key
    }

    pub fn serialize_value(&self) -> Vec<u8> {
        let mut value = Vec::with_capacity(6);
        value.extend_from_slice(&END_TXN_MARKER_VALUE_VERSION.to_be_bytes());
        value.extend_from_slice(&self.coordinator_epoch.to_be_bytes());
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_record(key: Option<Vec<u8>>, value: Option<Vec<u8>>) -> Record {
        Record {
            attributes: 0,
            timestamp_delta: 0,
            offset_delta: 0,
            key,
            value,
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_marker_round_trip() {
        let marker = EndTransactionMarker::new(ControlRecordType::Commit, 7);
        let record = control_record(
            Some(marker.serialize_key()),
            Some(marker.serialize_value()),
        );
        let decoded = EndTransactionMarker::deserialize(&record).unwrap();
        assert_eq!(decoded, marker);
    }

    #[test]
    fn test_abort_marker_type_id() {
        let marker = EndTransactionMarker::new(ControlRecordType::Abort, 0);
        let record = control_record(
            Some(marker.serialize_key()),
            Some(marker.serialize_value()),
        );
        let decoded = EndTransactionMarker::deserialize(&record).unwrap();
        assert_eq!(decoded.control_type, ControlRecordType::Abort);
    }

    #[test]
    fn test_unknown_control_type_rejected() {
        let mut key = Vec::new();
        key.extend_from_slice(&0i16.to_be_bytes());
        key.extend_from_slice(&9i16.to_be_bytes());
        let record = control_record(Some(key), Some(vec![0, 0, 0, 0, 0, 0]));
        assert!(EndTransactionMarker::deserialize(&record).is_err());
    }

    #[test]
    fn test_missing_key_rejected() {
        let record = control_record(None, Some(vec![0, 0, 0, 0, 0, 0]));
        assert!(EndTransactionMarker::deserialize(&record).is_err());
    }
}
