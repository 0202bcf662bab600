pub mod message;
pub mod service;
pub mod storage;
pub mod txn_state;

pub use service::{
    global_config,
    setup_local_tracing,
    setup_tracing,
    AppError,
    AppResult,
    BrokerConfig,
    GLOBAL_CONFIG,
};
pub use message::{MemoryRecords, RecordBatch, TopicPartition};
pub use txn_state::ProducerStateManager;
