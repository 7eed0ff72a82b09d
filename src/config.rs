//! Adapter configuration

use serde::{Deserialize, Serialize};

/// Adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// gRPC listen address
    pub listen_addr: String,
    /// Seconds an abandoned transaction survives in the registry
    pub transaction_ttl_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "[::]:9001".into(),
            transaction_ttl_secs: 60,
        }
    }
}

impl AdapterConfig {
    /// Load from file
    pub fn load(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdapterConfig::default();
        assert_eq!(config.listen_addr, "[::]:9001");
        assert_eq!(config.transaction_ttl_secs, 60);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AdapterConfig =
            serde_json::from_str(r#"{"listen_addr": "127.0.0.1:9444"}"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9444");
        assert_eq!(config.transaction_ttl_secs, 60);
    }
}
