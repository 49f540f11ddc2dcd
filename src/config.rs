use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store: StoreConfig,
    /// JSON catalog to load instead of the built-in defaults
    pub catalog_path: Option<PathBuf>,
    /// Run a scoped reconciliation after every edit
    pub reconcile_on_edit: bool,
    pub telemetry: TelemetryConfig,
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let db_path = env::var("STARS_DB_PATH").unwrap_or_else(|_| "stars.db".to_string());

        let busy_timeout_ms = match env::var("STARS_BUSY_TIMEOUT_MS") {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidBusyTimeout(value))?,
            Err(_) => 5_000,
        };

        let catalog_path = env::var("STARS_CATALOG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let reconcile_on_edit = match env::var("STARS_RECONCILE_ON_EDIT") {
            Ok(value) => parse_flag("STARS_RECONCILE_ON_EDIT", &value)?,
            Err(_) => false,
        };

        let log_level = env::var("STARS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            store: StoreConfig {
                db_path: PathBuf::from(db_path),
                busy_timeout: Duration::from_millis(busy_timeout_ms),
            },
            catalog_path,
            reconcile_on_edit,
            telemetry: TelemetryConfig { log_level },
        })
    }

    /// In-memory store with defaults; used by tests and demos.
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig {
                db_path: PathBuf::from(":memory:"),
                busy_timeout: Duration::from_millis(5_000),
            },
            catalog_path: None,
            reconcile_on_edit: false,
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
            },
        }
    }
}

/// Where the ledger lives and how long a writer waits on a locked database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub busy_timeout: Duration,
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("STARS_BUSY_TIMEOUT_MS must be a whole number of milliseconds, got '{0}'")]
    InvalidBusyTimeout(String),

    #[error("{name} must be true or false, got '{value}'")]
    InvalidFlag { name: &'static str, value: String },
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        env::remove_var("STARS_DB_PATH");
        env::remove_var("STARS_CATALOG_PATH");
        env::remove_var("STARS_LOG_LEVEL");
        env::remove_var("STARS_RECONCILE_ON_EDIT");
        env::remove_var("STARS_BUSY_TIMEOUT_MS");
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = EngineConfig::load().expect("config loads with defaults");
        assert_eq!(config.store.db_path, PathBuf::from("stars.db"));
        assert_eq!(config.store.busy_timeout, Duration::from_millis(5_000));
        assert_eq!(config.catalog_path, None);
        assert!(!config.reconcile_on_edit);
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn reads_overrides() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("STARS_DB_PATH", "/tmp/ledger.db");
        env::set_var("STARS_CATALOG_PATH", "config/catalog.json");
        env::set_var("STARS_RECONCILE_ON_EDIT", "Yes");
        env::set_var("STARS_BUSY_TIMEOUT_MS", "250");
        let config = EngineConfig::load().expect("config loads");
        reset_env();

        assert_eq!(config.store.db_path, PathBuf::from("/tmp/ledger.db"));
        assert_eq!(config.catalog_path, Some(PathBuf::from("config/catalog.json")));
        assert!(config.reconcile_on_edit);
        assert_eq!(config.store.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_bad_values() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("STARS_BUSY_TIMEOUT_MS", "soon");
        assert!(matches!(
            EngineConfig::load(),
            Err(ConfigError::InvalidBusyTimeout(_))
        ));

        reset_env();
        env::set_var("STARS_RECONCILE_ON_EDIT", "maybe");
        assert!(matches!(
            EngineConfig::load(),
            Err(ConfigError::InvalidFlag { .. })
        ));
        reset_env();
    }
}
