use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
};

use crate::error::GraphError;

/// Tunables of the engine. Every field has a default, so a partial (or missing) configuration
/// document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum trimmed length of a search key
    pub min_search_key_len: usize,
    /// Upper bound on fixpoint resolution passes before the load is treated as non-convergent
    pub max_resolve_passes: usize,
    /// Start the background mentions build as soon as a load completes
    pub rebuild_mentions_on_load: bool,
    /// Search keys shorter than this are not looked for in record text
    pub mention_min_key_len: usize,
    /// Environment variable holding the passphrase used to seal library link credentials
    pub credential_key_env: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_search_key_len: 3,
            max_resolve_passes: 16,
            rebuild_mentions_on_load: true,
            mention_min_key_len: 3,
            credential_key_env: "RECGRAPH_CREDENTIAL_KEY".to_string(),
        }
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<EngineConfig, GraphError>;
    fn set_config(&self, config: &EngineConfig) -> Result<(), GraphError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<EngineConfig, GraphError> {
        tracing::debug!("Attempting to read engine config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(EngineConfig::default());
        }
        let content = read_to_string(&self.path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        if config.max_resolve_passes == 0 {
            return Err(GraphError::Format(format!(
                "{:?}: max_resolve_passes must be at least 1",
                self.path
            )));
        }
        Ok(config)
    }

    fn set_config(&self, config: &EngineConfig) -> Result<(), GraphError> {
        tracing::debug!("Attempting to write engine config to: {:?}", &self.path);
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("engine.toml"));
        assert_eq!(provider.get_config().unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "min_search_key_len = 5\n").unwrap();
        let provider = TomlConfigProvider::new(path);

        let mut config = provider.get_config().unwrap();
        assert_eq!(config.min_search_key_len, 5);
        assert_eq!(config.max_resolve_passes, 16);

        config.rebuild_mentions_on_load = false;
        provider.set_config(&config).unwrap();
        assert_eq!(provider.get_config().unwrap(), config);
    }

    #[test]
    fn test_zero_resolve_passes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "max_resolve_passes = 0\n").unwrap();
        let provider = TomlConfigProvider::new(path);
        assert!(matches!(provider.get_config(), Err(GraphError::Format(_))));
    }
}
