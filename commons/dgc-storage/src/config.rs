use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Store backend types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackendType {
    Memory,
    Redb,
}

impl std::fmt::Display for StoreBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redb => write!(f, "redb"),
        }
    }
}

impl std::str::FromStr for StoreBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redb" => Ok(Self::Redb),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Configuration for document store drivers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend_type: StoreBackendType,
    pub path: Option<String>,
    pub sync_writes: bool,
    pub properties: HashMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend_type: StoreBackendType::Memory,
            path: None,
            sync_writes: true,
            properties: HashMap::new(),
        }
    }
}

impl StoreConfig {
    /// Create a memory store configuration
    pub fn memory() -> Self {
        Self {
            backend_type: StoreBackendType::Memory,
            ..Default::default()
        }
    }

    /// Create a redb store configuration
    pub fn redb<P: Into<String>>(path: P) -> Self {
        Self {
            backend_type: StoreBackendType::Redb,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Enable or disable sync writes
    pub fn with_sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Add a custom property
    pub fn with_property<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        match self.backend_type {
            StoreBackendType::Memory => Ok(()),
            StoreBackendType::Redb => {
                if self.path.is_none() {
                    Err("Path is required for redb backend".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}
