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

//! Per-partition producer state on the write path.
//!
//! For each producer id the manager tracks the last appended batches
//! and any in-flight transaction, so the broker can reject duplicated
//! or out-of-order writes, compute the last stable offset for
//! `read_committed` fetches, and serve the aborted-transaction index.
//! State survives restarts through snapshots plus log replay.

mod append_info;
mod entry;
mod manager;
mod recovery;
mod snapshot;
#[cfg(test)]
mod test_util;

pub use append_info::{
    AbortedTxn, AnalyzeResult, AppendOrigin, CompletedTxn, FetchAbortedTxn, ProducerAppendInfo,
    TxnMetadata,
};
pub use entry::{BatchMetadata, ProducerStateEntry, NUM_BATCHES_TO_RETAIN};
pub use manager::{ManagerState, ProducerStateManager};
pub use recovery::RecoveryConfig;
