//! TOML-backed configuration for the `ffado-stream-master`/`ffado-stream-slave`
//! demo binaries, mirroring `obsidian-config`/`onyx-config`.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize)]
pub struct FfadoConfig {
    #[serde(default = "defaults::name")]
    pub name: String,
    #[serde(default = "defaults::slot_count")]
    pub slot_count: u32,
    #[serde(default = "defaults::block_size")]
    pub block_size: u32,
    #[serde(default = "defaults::blocking")]
    pub blocking: bool,
    #[serde(default = "defaults::queue_timeout_secs")]
    pub queue_timeout_secs: u64,
}

impl FfadoConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: FfadoConfig = toml::from_str(&raw)?;
        Ok(config)
    }

    pub fn blocking_mode(&self) -> ffado_ring::Blocking {
        if self.blocking {
            ffado_ring::Blocking::Blocking
        } else {
            ffado_ring::Blocking::NonBlocking
        }
    }

    pub fn queue_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.queue_timeout_secs)
    }
}

mod defaults {
    pub fn name() -> String {
        "ffado_stream".into()
    }

    pub fn slot_count() -> u32 {
        16
    }

    pub fn block_size() -> u32 {
        1024
    }

    pub fn blocking() -> bool {
        true
    }

    pub fn queue_timeout_secs() -> u64 {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_an_empty_document() {
        let config: FfadoConfig = toml::from_str("").unwrap();
        assert_eq!(config.name, "ffado_stream");
        assert_eq!(config.slot_count, 16);
        assert_eq!(config.block_size, 1024);
        assert!(config.blocking);
        assert_eq!(config.queue_timeout_secs, 10);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let toml = r#"
            name = "studio_a"
            slot_count = 32
            block_size = 2048
            blocking = false
            queue_timeout_secs = 2
        "#;
        let config: FfadoConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.name, "studio_a");
        assert_eq!(config.slot_count, 32);
        assert_eq!(config.block_size, 2048);
        assert!(!config.blocking);
        assert_eq!(config.queue_timeout_secs, 2);
    }

    #[test]
    fn missing_file_surfaces_a_read_error() {
        assert!(matches!(
            FfadoConfig::load("/nonexistent/ffado-demo.toml".to_string()),
            Err(ConfigError::Read { .. })
        ));
    }
}
