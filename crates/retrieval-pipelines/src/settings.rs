//! Service settings
//!
//! Persisted as `settings.json` in a settings directory. Missing keys take
//! their defaults; a missing file yields all defaults.

use std::path::Path;
use std::time::Duration;

use dataflow_engine::FilterConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::SettingsError;

/// File name inside the settings directory
pub const SETTINGS_FILE: &str = "settings.json";

fn default_query_cache_maxsize() -> usize {
    1_000
}

fn default_query_cache_ttl_secs() -> u64 {
    3_600
}

fn default_similarity_threshold() -> f32 {
    0.7
}

fn default_max_size() -> usize {
    10
}

fn default_node_timeout_secs() -> u64 {
    30
}

/// Tunables for the retrieval services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Entries kept per result cache
    #[serde(default = "default_query_cache_maxsize")]
    pub query_cache_maxsize: usize,
    /// Result lifetime in seconds; 0 disables caching
    #[serde(default = "default_query_cache_ttl_secs")]
    pub query_cache_ttl_secs: u64,
    #[serde(default = "default_similarity_threshold")]
    pub sql_pairs_similarity_threshold: f32,
    #[serde(default = "default_max_size")]
    pub sql_pairs_retrieval_max_size: usize,
    #[serde(default = "default_similarity_threshold")]
    pub instructions_similarity_threshold: f32,
    #[serde(default = "default_max_size")]
    pub instructions_top_k: usize,
    /// Per-node time limit in seconds; 0 means unbounded
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            query_cache_maxsize: default_query_cache_maxsize(),
            query_cache_ttl_secs: default_query_cache_ttl_secs(),
            sql_pairs_similarity_threshold: default_similarity_threshold(),
            sql_pairs_retrieval_max_size: default_max_size(),
            instructions_similarity_threshold: default_similarity_threshold(),
            instructions_top_k: default_max_size(),
            node_timeout_secs: default_node_timeout_secs(),
        }
    }
}

impl Settings {
    /// Load settings from `dir`, falling back to defaults when absent
    pub async fn load(dir: &Path) -> Result<Self, SettingsError> {
        let path = dir.join(SETTINGS_FILE);

        if !fs::try_exists(&path).await? {
            log::info!("No settings at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).await?;
        let settings = Self::from_json(&contents)?;
        log::info!("Settings loaded from {:?}", path);
        Ok(settings)
    }

    /// Parse and validate settings from JSON text
    pub fn from_json(contents: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(contents).map_err(SettingsError::Parse)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings into `dir`, creating it if needed
    pub async fn save(&self, dir: &Path) -> Result<(), SettingsError> {
        self.validate()?;
        fs::create_dir_all(dir).await?;

        let path = dir.join(SETTINGS_FILE);
        let contents = serde_json::to_string_pretty(self).map_err(SettingsError::Serialize)?;
        fs::write(&path, contents).await?;

        log::info!("Settings saved to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.query_cache_maxsize == 0 {
            return Err(SettingsError::Invalid {
                key: "query_cache_maxsize",
                reason: "must be at least 1".to_string(),
            });
        }
        check_threshold("sql_pairs_similarity_threshold", self.sql_pairs_similarity_threshold)?;
        check_threshold(
            "instructions_similarity_threshold",
            self.instructions_similarity_threshold,
        )?;
        check_max_size("sql_pairs_retrieval_max_size", self.sql_pairs_retrieval_max_size)?;
        check_max_size("instructions_top_k", self.instructions_top_k)?;
        Ok(())
    }

    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_secs)
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        (self.node_timeout_secs > 0).then(|| Duration::from_secs(self.node_timeout_secs))
    }

    pub fn sql_pairs_filter(&self) -> FilterConfig {
        FilterConfig {
            threshold: self.sql_pairs_similarity_threshold,
            max_size: self.sql_pairs_retrieval_max_size,
        }
    }

    pub fn instructions_filter(&self) -> FilterConfig {
        FilterConfig {
            threshold: self.instructions_similarity_threshold,
            max_size: self.instructions_top_k,
        }
    }
}

fn check_threshold(key: &'static str, value: f32) -> Result<(), SettingsError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            key,
            reason: format!("{} is outside [0, 1]", value),
        })
    }
}

fn check_max_size(key: &'static str, value: usize) -> Result<(), SettingsError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            key,
            reason: "must be at least 1".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).await.unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.query_cache_maxsize, 1_000);
        assert_eq!(settings.query_cache_ttl(), Duration::from_secs(3_600));
        assert_eq!(settings.node_timeout(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("conf");
        let settings = Settings {
            query_cache_maxsize: 5,
            instructions_top_k: 3,
            ..Settings::default()
        };

        settings.save(&nested).await.unwrap();
        assert_eq!(Settings::load(&nested).await.unwrap(), settings);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings = Settings::from_json(r#"{"query_cache_ttl_secs": 0, "node_timeout_secs": 0}"#).unwrap();
        assert_eq!(settings.query_cache_ttl(), Duration::ZERO);
        assert_eq!(settings.node_timeout(), None);
        assert_eq!(settings.sql_pairs_filter(), FilterConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Settings::from_json(r#"{"sql_pairs_similarity_threshold": 1.2}"#).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid { key: "sql_pairs_similarity_threshold", .. }
        ));

        let err = Settings::from_json(r#"{"query_cache_maxsize": 0}"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "query_cache_maxsize", .. }));

        assert!(matches!(Settings::from_json("not json"), Err(SettingsError::Parse(_))));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{").unwrap();
        assert!(matches!(
            Settings::load(dir.path()).await,
            Err(SettingsError::Parse(_))
        ));
    }
}
