//! Engine configuration loader.
//!
//! Reads `engine.toml` from the data directory (`~/.technique/` unless
//! `TECHNIQUE_DATA_DIR` says otherwise) and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::{Path, PathBuf};

use technique_types::config::EngineConfig;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "engine.toml";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TECHNIQUE_DATA_DIR";

/// Data directory from `TECHNIQUE_DATA_DIR`, falling back to `~/.technique`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".technique")
        }
    }
}

/// Load engine configuration from `{data_dir}/engine.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but cannot be read or parsed, logs a warning and
///   returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn valid_toml_is_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
checkpoint_interval = 3
checkpoint_on_failure = true
step_timeout_secs = 45
max_checkpoints_per_execution = 5
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.checkpoint_interval, Some(3));
        assert!(config.checkpoint_on_failure);
        assert_eq!(config.step_timeout_secs, Some(45));
        assert_eq!(config.max_checkpoints_per_execution, 5);
        assert_eq!(config.max_checkpoints_total, 200);
        assert!(!config.allow_insecure_checkpoint_store);
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "checkpoint_interval = [not valid")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn wrong_field_type_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "continue_on_failure = \"yes\"")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert!(!config.continue_on_failure);
    }

    #[test]
    fn data_dir_is_never_empty() {
        assert!(!default_data_dir().as_os_str().is_empty());
    }
}
