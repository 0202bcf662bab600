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

//! Record model shared with the broker: batches, inner records, control
//! markers, and partition identity.

pub mod constants;
mod control_record;
mod memory_records;
mod record;
mod record_batch;
mod topic_partition;

pub use control_record::{ControlRecordType, EndTransactionMarker};
pub use memory_records::MemoryRecords;
pub use record::{Record, RecordHeader};
pub use record_batch::{RecordBatch, RecordBatchBuilder};
pub use topic_partition::TopicPartition;
