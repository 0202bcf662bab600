// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Record batch format constants.
//!
//! Field offsets of the on-wire batch layout (magic 2):
//! base offset (8), length (4), partition leader epoch (4), magic (1),
//! CRC (4), attributes (2), last offset delta (4), first timestamp (8),
//! max timestamp (8), producer id (8), producer epoch (2),
//! base sequence (4), record count (4), records (variable).

pub const BASE_OFFSET_OFFSET: i32 = 0;
pub const BASE_OFFSET_LENGTH: i32 = 8;
pub const LENGTH_OFFSET: i32 = BASE_OFFSET_OFFSET + BASE_OFFSET_LENGTH;
pub const LENGTH_LENGTH: i32 = 4;
pub const PARTITION_LEADER_EPOCH_OFFSET: i32 = LENGTH_OFFSET + LENGTH_LENGTH;
pub const PARTITION_LEADER_EPOCH_LENGTH: i32 = 4;
pub const MAGIC_OFFSET: i32 = PARTITION_LEADER_EPOCH_OFFSET + PARTITION_LEADER_EPOCH_LENGTH;
pub const MAGIC_LENGTH: i32 = 1;
pub const CRC_OFFSET: i32 = MAGIC_OFFSET + MAGIC_LENGTH;
pub const CRC_LENGTH: i32 = 4;
pub const ATTRIBUTES_OFFSET: i32 = CRC_OFFSET + CRC_LENGTH;
pub const ATTRIBUTE_LENGTH: i32 = 2;
pub const LAST_OFFSET_DELTA_OFFSET: i32 = ATTRIBUTES_OFFSET + ATTRIBUTE_LENGTH;
pub const LAST_OFFSET_DELTA_LENGTH: i32 = 4;
pub const FIRST_TIMESTAMP_OFFSET: i32 = LAST_OFFSET_DELTA_OFFSET + LAST_OFFSET_DELTA_LENGTH;
pub const FIRST_TIMESTAMP_LENGTH: i32 = 8;
pub const MAX_TIMESTAMP_OFFSET: i32 = FIRST_TIMESTAMP_OFFSET + FIRST_TIMESTAMP_LENGTH;
pub const MAX_TIMESTAMP_LENGTH: i32 = 8;
pub const PRODUCER_ID_OFFSET: i32 = MAX_TIMESTAMP_OFFSET + MAX_TIMESTAMP_LENGTH;
pub const PRODUCER_ID_LENGTH: i32 = 8;
pub const PRODUCER_EPOCH_OFFSET: i32 = PRODUCER_ID_OFFSET + PRODUCER_ID_LENGTH;
pub const PRODUCER_EPOCH_LENGTH: i32 = 2;
pub const BASE_SEQUENCE_OFFSET: i32 = PRODUCER_EPOCH_OFFSET + PRODUCER_EPOCH_LENGTH;
pub const BASE_SEQUENCE_LENGTH: i32 = 4;
pub const RECORDS_COUNT_OFFSET: i32 = BASE_SEQUENCE_OFFSET + BASE_SEQUENCE_LENGTH;
pub const RECORDS_COUNT_LENGTH: i32 = 4;
pub const RECORDS_OFFSET: i32 = RECORDS_COUNT_OFFSET + RECORDS_COUNT_LENGTH;
pub const RECORD_BATCH_OVERHEAD: i32 = RECORDS_OFFSET;

/// Bytes preceding each batch in a multi-batch buffer: offset (8) + size (4).
pub const LOG_OVERHEAD: usize = 12;

// Attribute bits
pub const TRANSACTIONAL_FLAG_MASK: i16 = 0x10;
pub const CONTROL_FLAG_MASK: i16 = 0x20;

// Special values and defaults

/// Magic value for the current message format version
pub const MAGIC: i8 = 2;
/// Special value indicating no producer ID
pub const NO_PRODUCER_ID: i64 = -1;
/// Special value indicating no producer epoch
pub const NO_PRODUCER_EPOCH: i16 = -1;
/// Special value indicating no sequence number
pub const NO_SEQUENCE: i32 = -1;
/// Special value indicating no timestamp
pub const NO_TIMESTAMP: i64 = -1;
/// Special value indicating no partition leader epoch
pub const NO_PARTITION_LEADER_EPOCH: i32 = -1;
