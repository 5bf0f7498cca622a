//! Settings: `.env`, then `config.toml`, then environment overrides.

use crate::view::SortOption;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const APP_DIR: &str = "tasksync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown backend `{0}` (expected memory or firebase)")]
    UnknownBackend(String),
    #[error("the firebase backend needs {0}")]
    Missing(&'static str),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Firebase,
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "firebase" => Ok(Backend::Firebase),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FirebaseConfig {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        FirebaseConfig {
            api_key: None,
            project_id: None,
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub latency_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub default_sort: SortOption,
    pub show_completed: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        UiConfig {
            default_sort: SortOption::default(),
            show_completed: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    pub firebase: FirebaseConfig,
    pub memory: MemoryConfig,
    pub ui: UiConfig,
    pub log: LogConfig,
}

/// Validated Firebase connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirebaseSettings {
    pub api_key: String,
    pub project_id: String,
    pub poll_interval: Duration,
}

impl Config {
    /// Loads `.env`, the config file (if any) and environment overrides.
    pub fn load() -> Result<Config, ConfigError> {
        dotenv::dotenv().ok();

        let path = env::var_os("TASKSYNC_CONFIG")
            .map(PathBuf::from)
            .or_else(default_path);
        let mut config = match path {
            Some(path) if path.exists() => Config::from_file(&path)?,
            _ => Config::default(),
        };
        config.apply_env_from(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("TASKSYNC_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(key) = lookup("FIREBASE_API_KEY") {
            self.firebase.api_key = Some(key);
        }
        if let Some(project) = lookup("FIREBASE_PROJECT_ID") {
            self.firebase.project_id = Some(project);
        }
        Ok(())
    }

    pub fn firebase_settings(&self) -> Result<FirebaseSettings, ConfigError> {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Ok(FirebaseSettings {
            api_key: non_empty(&self.firebase.api_key)
                .ok_or(ConfigError::Missing("FIREBASE_API_KEY or firebase.api_key"))?,
            project_id: non_empty(&self.firebase.project_id).ok_or(ConfigError::Missing(
                "FIREBASE_PROJECT_ID or firebase.project_id",
            ))?,
            poll_interval: Duration::from_millis(self.firebase.poll_interval_ms.max(250)),
        })
    }

    pub fn memory_latency(&self) -> Duration {
        Duration::from_millis(self.memory.latency_ms)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log.file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(env::temp_dir)
                .join(APP_DIR)
                .join("tasksync.log")
        })
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.firebase.poll_interval_ms, 2000);
        assert_eq!(config.ui.default_sort, SortOption::CreatedDesc);
        assert!(config.ui.show_completed);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::from_toml_str(
            r#"
            backend = "firebase"

            [firebase]
            api_key = "abc"
            project_id = "my-tasks"
            poll_interval_ms = 5000

            [memory]
            latency_ms = 300

            [ui]
            default_sort = "dueAsc"
            show_completed = false

            [log]
            level = "debug"
            file = "/tmp/tasksync-test.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, Backend::Firebase);
        assert_eq!(config.ui.default_sort, SortOption::DueAsc);
        assert!(!config.ui.show_completed);
        assert_eq!(config.memory_latency(), Duration::from_millis(300));
        assert_eq!(config.log_file(), PathBuf::from("/tmp/tasksync-test.log"));

        let settings = config.firebase_settings().unwrap();
        assert_eq!(settings.api_key, "abc");
        assert_eq!(settings.project_id, "my-tasks");
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_sort_is_rejected() {
        let err = Config::from_toml_str("[ui]\ndefault_sort = \"sideways\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_from(lookup(&[
                ("TASKSYNC_BACKEND", "Firebase"),
                ("FIREBASE_API_KEY", "env-key"),
                ("FIREBASE_PROJECT_ID", "env-project"),
            ]))
            .unwrap();
        assert_eq!(config.backend, Backend::Firebase);
        assert_eq!(config.firebase_settings().unwrap().api_key, "env-key");
    }

    #[test]
    fn test_unknown_backend() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(lookup(&[("TASKSYNC_BACKEND", "sqlite")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend(name) if name == "sqlite"));
    }

    #[test]
    fn test_firebase_without_credentials() {
        let mut config = Config::default();
        config.firebase.api_key = Some("  ".to_string());
        config.firebase.project_id = Some("p".to_string());
        assert!(matches!(
            config.firebase_settings(),
            Err(ConfigError::Missing(_))
        ));
    }
}
