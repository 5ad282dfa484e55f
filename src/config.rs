use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::query_builder::filter::NumericBinding;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub static_dir: PathBuf,
    pub numeric_binding: NumericBinding,
    pub force_seed: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            db_path: PathBuf::from("treasury.db"),
            static_dir: PathBuf::from("static"),
            numeric_binding: NumericBinding::TextAffinity,
            force_seed: false,
        }
    }
}

impl AppConfig {
    /// Read configuration from `TREASURY_*` environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError` when a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// # Errors
    /// Returns `ConfigError` when a variable is set to an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("TREASURY_BIND_ADDR") {
            config.bind_addr = value.parse().map_err(|_| ConfigError::Invalid {
                key: "TREASURY_BIND_ADDR",
                value,
            })?;
        }
        if let Some(value) = lookup("TREASURY_DB_PATH") {
            config.db_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("TREASURY_STATIC_DIR") {
            config.static_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("TREASURY_NUMERIC_BINDING") {
            config.numeric_binding = NumericBinding::parse(&value).ok_or(ConfigError::Invalid {
                key: "TREASURY_NUMERIC_BINDING",
                value,
            })?;
        }
        if let Some(value) = lookup("TREASURY_SEED") {
            config.force_seed = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" | "" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "TREASURY_SEED",
                        value,
                    })
                }
            };
        }

        Ok(config)
    }
}
