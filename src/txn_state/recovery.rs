//! Replaying the partition log into producer state after a snapshot
//! load.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{error, info};

use crate::message::constants::MAGIC;
use crate::service::TxnConfig;
use crate::storage::{LogCursor, LogEntry, LogStore};
use crate::txn_state::append_info::{AppendOrigin, CompletedTxn, ProducerAppendInfo};
use crate::txn_state::manager::{ManagerState, ProducerStateManager};
use crate::{AppError, AppResult};

const RECOVER_CURSOR_NAME: &str = "producer-state-recover";
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Knobs for the replay loop.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Max entries requested from the cursor per read.
    pub cache_queue_size: usize,
    /// Transient read failures tolerated before recovery is abandoned.
    pub max_error_count: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cache_queue_size: 100,
            max_error_count: 10,
        }
    }
}

impl From<&TxnConfig> for RecoveryConfig {
    fn from(config: &TxnConfig) -> Self {
        Self {
            cache_queue_size: config.recovery_cache_queue_size,
            max_error_count: config.recovery_max_error_count,
        }
    }
}

impl ProducerStateManager {
    /// Brings the manager to `Ready` by loading the last snapshot and
    /// replaying the log from the snapshot offset to the tail.
    ///
    /// `Ready` and `RecoverError` are terminal: recovering again is an
    /// immediate success or failure respectively.
    pub async fn recover(&self, log_store: &dyn LogStore) -> AppResult<()> {
        match self.state.load() {
            ManagerState::Ready => return Ok(()),
            ManagerState::RecoverError => {
                return Err(AppError::RecoveryFailed(format!(
                    "producer state for {} previously failed to recover",
                    self.topic_partition
                )))
            }
            ManagerState::Init | ManagerState::Recovering => {}
        }
        self.state.store(ManagerState::Recovering);
        info!("start recovering producer state for {}", self.topic_partition);

        match self.run_recovery(log_store).await {
            Ok(()) => {
                self.state.store(ManagerState::Ready);
                info!("finish recovering producer state for {}", self.topic_partition);
                Ok(())
            }
            Err(e) => {
                self.state.store(ManagerState::RecoverError);
                error!(
                    "failed to recover producer state for {}: {}",
                    self.topic_partition, e
                );
                Err(e)
            }
        }
    }

    async fn run_recovery(&self, log_store: &dyn LogStore) -> AppResult<()> {
        self.load_from_snapshot().await?;
        let position = log_store.find_position(self.map_end_offset()).await?;
        let cursor = log_store.new_non_durable_cursor(position, RECOVER_CURSOR_NAME)?;
        ProducerStateLogRecovery::new(self, cursor, self.recovery_config.clone())
            .recover()
            .await
    }
}

/// Drives the recovery cursor forward, replaying each drained slice of
/// entries into the manager.
struct ProducerStateLogRecovery<'a> {
    manager: &'a ProducerStateManager,
    cursor: Box<dyn LogCursor>,
    config: RecoveryConfig,
    error_count: u32,
}

impl<'a> ProducerStateLogRecovery<'a> {
    fn new(
        manager: &'a ProducerStateManager,
        cursor: Box<dyn LogCursor>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            manager,
            cursor,
            config,
            error_count: 0,
        }
    }

    async fn recover(mut self) -> AppResult<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.cursor.read_entries(self.config.cache_queue_size).await {
                Ok(entries) if entries.is_empty() => {
                    info!(
                        "can't read more entries, finish recovering {}",
                        self.manager.topic_partition
                    );
                    break;
                }
                Ok(entries) => {
                    self.replay_entries(entries)?;
                    backoff = INITIAL_BACKOFF;
                }
                Err(AppError::NoMoreEntriesToRead) => {
                    info!(
                        "no more entries to read, finish recovering {}",
                        self.manager.topic_partition
                    );
                    break;
                }
                Err(e) => {
                    self.check_error_count(&e)?;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        Ok(())
    }

    /// Analyzes one drained slice into a transient map, then commits
    /// every staged delta and completed transaction.
    fn replay_entries(&mut self, entries: Vec<LogEntry>) -> AppResult<()> {
        let records = self.manager.decoder.decode(entries, MAGIC)?;
        let mut append_info_map: HashMap<i64, ProducerAppendInfo> = HashMap::new();
        let mut completed_txns: Vec<CompletedTxn> = Vec::new();
        for batch in records {
            if !batch.has_producer_id() {
                continue;
            }
            if let Some(completed_txn) = self.manager.update_producers(
                &batch,
                &mut append_info_map,
                None,
                AppendOrigin::Log,
            )? {
                completed_txns.push(completed_txn);
            }
        }
        for (_, append_info) in append_info_map {
            self.manager.apply_update(append_info)?;
        }
        for completed_txn in &completed_txns {
            self.manager.apply_complete_txn(completed_txn)?;
        }
        Ok(())
    }

    fn check_error_count(&mut self, error: &AppError) -> AppResult<()> {
        if self.error_count < self.config.max_error_count {
            self.error_count += 1;
            error!(
                "[{}] recover error count {}: {}",
                self.manager.topic_partition, self.error_count, error
            );
            Ok(())
        } else {
            error!("[{}] failed to recover", self.manager.topic_partition);
            Err(AppError::RecoveryFailed(format!(
                "recovery of {} gave up after {} errors, last: {}",
                self.manager.topic_partition, self.error_count, error
            )))
        }
    }
}
