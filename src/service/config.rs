extern crate config as rs_config;

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::AppResult;
use crate::AppError::InvalidValue;

pub static GLOBAL_CONFIG: OnceCell<BrokerConfig> = OnceCell::new();

pub fn global_config() -> &'static BrokerConfig {
    GLOBAL_CONFIG.get().unwrap()
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    pub id: i32,
}

/// Producer/transaction state settings for one broker.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TxnConfig {
    /// How long an idle producer id is retained before being expired, in ms.
    #[serde(default = "TxnConfig::default_producer_id_expiration_ms")]
    pub producer_id_expiration_ms: u32,
    /// Max entries requested from the recovery cursor per read.
    #[serde(default = "TxnConfig::default_recovery_cache_queue_size")]
    pub recovery_cache_queue_size: usize,
    /// Transient read failures tolerated before recovery is abandoned.
    #[serde(default = "TxnConfig::default_recovery_max_error_count")]
    pub recovery_max_error_count: u32,
}

impl TxnConfig {
    fn default_producer_id_expiration_ms() -> u32 {
        86_400_000
    }
    fn default_recovery_cache_queue_size() -> usize {
        100
    }
    fn default_recovery_max_error_count() -> u32 {
        10
    }
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            producer_id_expiration_ms: Self::default_producer_id_expiration_ms(),
            recovery_cache_queue_size: Self::default_recovery_cache_queue_size(),
            recovery_max_error_count: Self::default_recovery_max_error_count(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub txn: TxnConfig,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| InvalidValue("config file path is not valid utf-8".to_string()))?;
        let config = rs_config::Config::builder()
            .add_source(rs_config::File::with_name(path_str))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        Ok(broker_config)
    }
}
