//! Engine configuration parsed from TOML
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Tenant and backend endpoint are supplied by the
//! host application, not by this file.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use farmsync_remote::RetryPolicy;
use farmsync_store::TieBreak;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_clock_skew_secs() -> u64 {
    120
}

fn default_orphan_grace_secs() -> u64 {
    86_400
}

fn default_page_size() -> usize {
    500
}

fn default_apply_batch_size() -> usize {
    200
}

fn default_settle_batch_size() -> usize {
    50
}

fn default_max_push_attempts() -> u32 {
    5
}

fn default_parallelism() -> usize {
    2
}

fn default_full_reconcile_interval_secs() -> u64 {
    604_800
}

/// Tunables of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Pull window overlap that absorbs client/server clock drift
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    /// Records modified within this window before the checkpoint are never
    /// inferred deleted by the orphan sweep
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,

    /// Last-write-wins policy on equal timestamps
    #[serde(default)]
    pub tie_break: TieBreak,

    /// Rows requested per remote page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Changes applied per local transaction
    #[serde(default = "default_apply_batch_size")]
    pub apply_batch_size: usize,

    /// Push answers recorded per local transaction
    #[serde(default = "default_settle_batch_size")]
    pub settle_batch_size: usize,

    /// Retryable push failures tolerated before a mutation is parked
    #[serde(default = "default_max_push_attempts")]
    pub max_push_attempts: u32,

    /// Entity types processed concurrently within one dependency level
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// How often a pull is a full listing that runs the orphan sweep;
    /// `0` disables periodic full listings
    #[serde(default = "default_full_reconcile_interval_secs")]
    pub full_reconcile_interval_secs: u64,

    /// Per-call timeout and backoff
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: default_clock_skew_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
            tie_break: TieBreak::default(),
            page_size: default_page_size(),
            apply_batch_size: default_apply_batch_size(),
            settle_batch_size: default_settle_batch_size(),
            max_push_attempts: default_max_push_attempts(),
            parallelism: default_parallelism(),
            full_reconcile_interval_secs: default_full_reconcile_interval_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a configuration from TOML content.
    ///
    /// # Example
    ///
    /// ```
    /// use farmsync_core::SyncConfig;
    ///
    /// let config = SyncConfig::parse(r#"
    /// clock_skew_secs = 30
    /// tie_break = "timestamp-strict"
    ///
    /// [retry]
    /// max_retries = 5
    /// "#).unwrap();
    ///
    /// assert_eq!(config.clock_skew_secs, 30);
    /// assert_eq!(config.retry.max_retries, 5);
    /// assert_eq!(config.page_size, 500);
    /// ```
    pub fn parse(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `<config dir>/farmsync/sync.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("farmsync").join("sync.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::config("page_size must be at least 1"));
        }
        if self.apply_batch_size == 0 {
            return Err(Error::config("apply_batch_size must be at least 1"));
        }
        if self.settle_batch_size == 0 {
            return Err(Error::config("settle_batch_size must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }
        if self.max_push_attempts == 0 {
            return Err(Error::config("max_push_attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::config("retry.multiplier must be at least 1.0"));
        }
        Ok(())
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::seconds(self.clock_skew_secs as i64)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::seconds(self.orphan_grace_secs as i64)
    }

    /// `None` when periodic full listings are disabled.
    pub fn full_reconcile_interval(&self) -> Option<Duration> {
        (self.full_reconcile_interval_secs > 0)
            .then(|| Duration::seconds(self.full_reconcile_interval_secs as i64))
    }
}
