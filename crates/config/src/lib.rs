//! Configuration for mediacache.
//!
//! Values are layered, later sources winning:
//!
//! 1. Built-in defaults ([`Config::default`]).
//! 2. An optional configuration file (TOML, YAML or JSON, picked by
//!    extension).
//! 3. Environment variables prefixed with `MEDIACACHE_`, using `__` to reach
//!    into nested tables (`MEDIACACHE_CATEGORIES__IMAGES__SHARE=80`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "MEDIACACHE_";
const MIB: u64 = 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory under which every category gets its own subdirectory.
    pub root: PathBuf,
    /// Disk budget shared by all categories, in bytes.
    pub total_budget: u64,
    /// Extra space, as a percentage of a category's budget, freed on top of
    /// what is needed to get back under budget.
    pub remove_percent: u8,
    /// Entries younger than this are never evicted.
    pub min_lifetime_secs: u64,
    /// Minimum time between the end of one automatic trim and the start of
    /// the next.
    pub trim_interval_secs: u64,
    /// Wall clock budget of a single automatic trim.
    pub trim_time_budget_ms: u64,
    /// Directories holding fewer files than this are not worth trimming.
    pub min_trim_files: usize,
    pub categories: BTreeMap<String, CategoryConfig>,
}

/// Per-category configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Percentage of [`Config::total_budget`] this category may use.
    pub share: u8,
}

impl Default for Config {
    fn default() -> Self {
        let root = ProjectDirs::from("", "", "mediacache")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("mediacache"));
        Self {
            root,
            total_budget: 512 * MIB,
            remove_percent: 25,
            min_lifetime_secs: 60,
            trim_interval_secs: 10,
            trim_time_budget_ms: 2500,
            min_trim_files: 16,
            categories: BTreeMap::from([
                ("images".to_string(), CategoryConfig { share: 70 }),
                ("videos".to_string(), CategoryConfig { share: 30 }),
            ]),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the optional file at `path`, and the
    /// environment, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = Self::merge_file(figment, path)?;
        }
        let config: Config =
            figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract().or_raise(|| ErrorKind::Parse)?;
        config.validate()?;
        tracing::debug!(root = %config.root.display(), categories = config.categories.len(), "Loaded configuration");
        Ok(config)
    }

    fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
        // Figment quietly ignores missing files; a path given explicitly
        // should exist.
        if !path.is_file() {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        Ok(match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            exn::bail!(ErrorKind::Invalid(format!("root must be absolute: {}", self.root.display())));
        }
        if self.remove_percent > 100 {
            exn::bail!(ErrorKind::Invalid(format!("remove_percent must be at most 100, got {}", self.remove_percent)));
        }
        if self.categories.is_empty() {
            exn::bail!(ErrorKind::Invalid("at least one category is required".to_string()));
        }
        for name in self.categories.keys() {
            mediacache_storage::validate_name(name)
                .or_raise(|| ErrorKind::Invalid(format!("category name is not a plain directory name: {name:?}")))?;
        }
        let shares: u32 = self.categories.values().map(|c| u32::from(c.share)).sum();
        if shares > 100 {
            exn::bail!(ErrorKind::Invalid(format!("category shares add up to {shares}%, more than 100%")));
        }
        Ok(())
    }

    pub fn min_lifetime(&self) -> Duration {
        Duration::from_secs(self.min_lifetime_secs)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.trim_interval_secs)
    }

    pub fn trim_time_budget(&self) -> Duration {
        Duration::from_millis(self.trim_time_budget_ms)
    }

    /// Trim settings for a category that was given `budget` bytes.
    pub fn trim_settings(&self, budget: u64) -> TrimSettings {
        TrimSettings {
            budget,
            remove_percent: self.remove_percent,
            min_lifetime: self.min_lifetime(),
            trim_interval: self.trim_interval(),
            trim_time_budget: self.trim_time_budget(),
            min_trim_files: self.min_trim_files,
        }
    }
}

/// Everything a single category cache needs to know to decide when and how
/// much to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimSettings {
    /// Maximum size of the category's data files, in bytes.
    pub budget: u64,
    pub remove_percent: u8,
    pub min_lifetime: Duration,
    pub trim_interval: Duration,
    pub trim_time_budget: Duration,
    pub min_trim_files: usize,
}

impl TrimSettings {
    /// The defaults of [`Config`] applied to `budget`.
    pub fn with_budget(budget: u64) -> Self {
        Config::default().trim_settings(budget)
    }

    /// Bytes a trim should free when the category currently holds `current`
    /// bytes: whatever is over budget plus the configured cushion.
    pub fn bytes_to_free(&self, current: u64) -> u64 {
        let over = current.saturating_sub(self.budget);
        let cushion = self.budget / 100 * u64::from(self.remove_percent)
            + self.budget % 100 * u64::from(self.remove_percent) / 100;
        over.saturating_add(cushion)
    }
}
