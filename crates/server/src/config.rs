//! Process configuration from `SCRIBE_*` environment variables.

use std::path::PathBuf;

use scribe_engine::cache::DEFAULT_CACHE_BYTES;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 50051;
pub const DEFAULT_TRANSLATE_URL: &str = "http://127.0.0.1:5000";

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite persistence file; parent directory is created as needed.
    pub db_path: PathBuf,
    /// Seed for the `models_dir` setting when none is stored yet.
    pub models_dir: PathBuf,
    /// Model cache budget in bytes.
    pub cache_bytes: u64,
    pub host: String,
    pub port: u16,
    /// Base URL of the translation endpoint.
    pub translate_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scribe");

        Self {
            db_path: var("SCRIBE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("data").join("scribe.db")),
            models_dir: var("SCRIBE_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            cache_bytes: var("SCRIBE_MODEL_CACHE_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CACHE_BYTES),
            host: var("SCRIBE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: var("SCRIBE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            translate_url: var("SCRIBE_TRANSLATE_URL")
                .unwrap_or_else(|| DEFAULT_TRANSLATE_URL.to_string()),
        }
    }
}
