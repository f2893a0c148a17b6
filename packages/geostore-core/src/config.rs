use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

pub const DEFAULT_HTTP_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_SQL_LOCK_TIMEOUT_SECS: f64 = 15.0;
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Runtime settings shared by datasets and render layers.
///
/// Settings are passed explicitly to the components that need them; nothing
/// reads them from a global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bounded wait for tile cache locks, in seconds.
    pub http_timeout_secs: f64,
    /// Bounded wait for the dataset SQL mutex, in seconds.
    pub sql_lock_timeout_secs: f64,
    /// Tile edge in pixels.
    pub tile_size: u32,
    /// Worker threads for overview generation (0 = rayon default).
    pub threads: usize,
    pub app_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            sql_lock_timeout_secs: DEFAULT_SQL_LOCK_TIMEOUT_SECS,
            tile_size: DEFAULT_TILE_SIZE,
            threads: 0,
            app_name: "geostore".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Defaults overridden by the `HTTP_TIMEOUT` environment variable.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = std::env::var("HTTP_TIMEOUT")
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
        {
            if secs >= 0.0 {
                self.http_timeout_secs = secs;
            }
        }
        self
    }

    pub fn with_http_timeout_secs(mut self, secs: f64) -> Self {
        self.http_timeout_secs = secs;
        self
    }

    pub fn with_sql_lock_timeout_secs(mut self, secs: f64) -> Self {
        self.sql_lock_timeout_secs = secs;
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.http_timeout_secs.max(0.0))
    }

    pub fn sql_lock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.sql_lock_timeout_secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.http_timeout(), Duration::from_secs(5));
        assert_eq!(settings.sql_lock_timeout(), Duration::from_secs(15));
        assert_eq!(settings.tile_size, 256);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = Settings::from_json_str(r#"{"http_timeout_secs": 0.5}"#).unwrap();
        assert_eq!(settings.http_timeout(), Duration::from_millis(500));
        assert_eq!(settings.sql_lock_timeout_secs, DEFAULT_SQL_LOCK_TIMEOUT_SECS);
    }

    #[test]
    fn builder_overrides() {
        let settings = Settings::new().with_tile_size(512).with_threads(2);
        assert_eq!(settings.tile_size, 512);
        assert_eq!(settings.threads, 2);
    }
}
