use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::pager::PagerOptions;
use crate::types::{MatrixError, Result};

/// File representation of [`PagerOptions`].
///
/// Every field is optional; absent fields keep the [`PagerOptions`] default.
/// Durations are expressed in milliseconds.
///
/// ```toml
/// columns_per_page = 32
/// cache_pages = 8
/// recency_window_ms = 600000
/// spill_dir = "/var/tmp/matrix"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PagerConfig {
    /// See [`PagerOptions::columns_per_page`].
    pub columns_per_page: Option<usize>,
    /// See [`PagerOptions::cache_pages`].
    pub cache_pages: Option<usize>,
    /// Recency window in milliseconds.
    pub recency_window_ms: Option<u64>,
    /// See [`PagerOptions::spill_dir`].
    pub spill_dir: Option<PathBuf>,
    /// See [`PagerOptions::sync_on_spill`].
    pub sync_on_spill: Option<bool>,
    /// See [`PagerOptions::remove_on_drop`].
    pub remove_on_drop: Option<bool>,
    /// In-flight wait bound in milliseconds.
    pub io_wait_timeout_ms: Option<u64>,
}

impl PagerConfig {
    /// Reads and parses a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    /// Parses TOML text.
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| MatrixError::Config(err.to_string()))
    }

    /// Applies the configured fields on top of the defaults and validates.
    pub fn into_options(self) -> Result<PagerOptions> {
        let defaults = PagerOptions::default();
        let options = PagerOptions {
            columns_per_page: self.columns_per_page.unwrap_or(defaults.columns_per_page),
            cache_pages: self.cache_pages.unwrap_or(defaults.cache_pages),
            recency_window: self
                .recency_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.recency_window),
            spill_dir: self.spill_dir.unwrap_or(defaults.spill_dir),
            sync_on_spill: self.sync_on_spill.unwrap_or(defaults.sync_on_spill),
            remove_on_drop: self.remove_on_drop.unwrap_or(defaults.remove_on_drop),
            io_wait_timeout: self
                .io_wait_timeout_ms
                .map(Duration::from_millis)
                .or(defaults.io_wait_timeout),
        };
        options.validate()?;
        Ok(options)
    }
}
