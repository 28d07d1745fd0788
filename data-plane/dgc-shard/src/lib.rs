pub mod error;
pub mod key;
pub mod metrics;
pub mod shard;
mod slot;

use std::time::Duration;

use envconfig::Envconfig;
use dgc_storage::StoreConfig;

pub use error::{FaultKind, ShardError, ShardFault};
pub use metrics::ShardMetrics;
pub use shard::DocumentShard;
pub use slot::SlotState;

#[derive(Envconfig, Clone, Debug)]
pub struct ShardOptions {
    /// Shard identity used in coordinator locks
    #[envconfig(from = "DGC_SHARD_ID")]
    pub shard_id: Option<String>,
    #[envconfig(from = "DGC_BACKEND", default = "memory")]
    pub backend: String,
    #[envconfig(from = "DGC_BACKEND_PATH")]
    pub backend_path: Option<String>,
    /// Comma-separated etcd endpoints; unset means in-process coordination
    #[envconfig(from = "DGC_COORD_ENDPOINTS")]
    pub coord_endpoints: Option<String>,
    /// Grace period after a release-request before unload begins
    #[envconfig(from = "DGC_UNLOAD_DELAY_MS", default = "0")]
    pub unload_delay_ms: u64,
    /// Idle eviction threshold; unset disables idle eviction
    #[envconfig(from = "DGC_DOC_IDLE_TIMEOUT_MS")]
    pub doc_idle_timeout_ms: Option<u64>,
    /// Coordinator lock ttl; also a peer's patience before force-unlock
    #[envconfig(from = "DGC_AUTO_UNLOCK_TIMEOUT_MS", default = "30000")]
    pub auto_unlock_timeout_ms: u64,
    /// Background save cadence
    #[envconfig(from = "DGC_PERSIST_INTERVAL_MS", default = "200")]
    pub persist_interval_ms: u64,
    /// How long `stop` waits for in-flight holds before forcing unload
    #[envconfig(from = "DGC_STOP_GRACE_MS", default = "5000")]
    pub stop_grace_ms: u64,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            shard_id: None,
            backend: "memory".to_string(),
            backend_path: None,
            coord_endpoints: None,
            unload_delay_ms: 0,
            doc_idle_timeout_ms: None,
            auto_unlock_timeout_ms: 30000,
            persist_interval_ms: 200,
            stop_grace_ms: 5000,
        }
    }
}

impl ShardOptions {
    pub fn get_shard_id(&self) -> String {
        self.shard_id
            .clone()
            .unwrap_or_else(|| format!("shard-{:08x}", rand::random::<u32>()))
    }

    pub fn store_config(&self) -> Result<StoreConfig, ShardError> {
        let backend_type =
            self.backend.parse().map_err(ShardError::contract)?;
        Ok(StoreConfig {
            backend_type,
            path: self.backend_path.clone(),
            ..Default::default()
        })
    }

    pub fn unload_delay(&self) -> Duration {
        Duration::from_millis(self.unload_delay_ms)
    }

    pub fn doc_idle_timeout(&self) -> Option<Duration> {
        self.doc_idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn auto_unlock_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_unlock_timeout_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dgc_storage::StoreBackendType;

    #[test]
    fn test_default_options() {
        let options = ShardOptions::default();
        assert_eq!(options.auto_unlock_timeout_ms, 30000);
        assert_eq!(options.persist_interval_ms, 200);
        assert_eq!(options.unload_delay_ms, 0);
        assert!(options.doc_idle_timeout().is_none());

        let config = options.store_config().unwrap();
        assert_eq!(config.backend_type, StoreBackendType::Memory);
    }

    #[test]
    fn test_shard_id_fallback_is_random() {
        let options = ShardOptions::default();
        assert!(options.get_shard_id().starts_with("shard-"));

        let named = ShardOptions {
            shard_id: Some("s1".to_string()),
            ..Default::default()
        };
        assert_eq!(named.get_shard_id(), "s1");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let options = ShardOptions {
            backend: "mongo".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            options.store_config(),
            Err(ShardError::ContractViolation(_))
        ));
    }
}
