//! CLI configuration.
//!
//! Loads settings from `STATEKEEP_*` environment variables with sensible
//! defaults. Command-line flags override whatever the environment says.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};
use clap::ValueEnum;
use statekeep_core::backup::BACKUP_STORE_NAME;
use statekeep_core::lock::STATE_LOCK;

/// Medium holding the primary state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PrimaryKind {
    /// In-memory (development only, data lost on exit).
    Memory,
    /// Redb file under the data directory.
    Redb,
    /// `RocksDB` directory under the data directory.
    Rocksdb,
}

impl FromStr for PrimaryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redb" => Ok(Self::Redb),
            "rocksdb" => Ok(Self::Rocksdb),
            other => bail!("unknown primary backend '{other}' (expected memory, redb, or rocksdb)"),
        }
    }
}

/// Medium holding the vault backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackupKind {
    /// Redb file under the data directory.
    Redb,
    /// In-memory (development only).
    Memory,
    /// Run without a backup store.
    None,
}

impl FromStr for BackupKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            "none" | "off" => Ok(Self::None),
            other => bail!("unknown backup backend '{other}' (expected redb, memory, or none)"),
        }
    }
}

/// Resolved CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Directory holding the on-disk stores.
    pub data_dir: PathBuf,
    /// Primary store medium.
    pub primary: PrimaryKind,
    /// Backup store medium.
    pub backup: BackupKind,
    /// Name of the backup store.
    pub backup_name: String,
    /// Name of the state lock, used in log events.
    pub lock_name: String,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub log_json: bool,
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STATEKEEP_DATA_DIR`: directory for on-disk stores (default: `./data`)
    /// - `STATEKEEP_PRIMARY`: `memory`, `redb`, or `rocksdb` (default: `redb`)
    /// - `STATEKEEP_BACKUP`: `redb`, `memory`, or `none` (default: `redb`)
    /// - `STATEKEEP_BACKUP_NAME`: backup store name (default: `state-backup`)
    /// - `STATEKEEP_LOCK_NAME`: state lock name (default: `state-lock`)
    /// - `STATEKEEP_LOG_LEVEL`: log filter (default: `info`)
    /// - `STATEKEEP_LOG_JSON`: JSON log output (default: `false`)
    ///
    /// # Errors
    ///
    /// Returns an error if a backend name is not recognised.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("STATEKEEP_DATA_DIR")
            .map_or_else(|_| PathBuf::from("./data"), PathBuf::from);

        let primary = std::env::var("STATEKEEP_PRIMARY")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("invalid STATEKEEP_PRIMARY")?
            .unwrap_or(PrimaryKind::Redb);

        let backup = std::env::var("STATEKEEP_BACKUP")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("invalid STATEKEEP_BACKUP")?
            .unwrap_or(BackupKind::Redb);

        let backup_name = std::env::var("STATEKEEP_BACKUP_NAME")
            .unwrap_or_else(|_| BACKUP_STORE_NAME.to_owned());

        let lock_name =
            std::env::var("STATEKEEP_LOCK_NAME").unwrap_or_else(|_| STATE_LOCK.to_owned());

        let log_level =
            std::env::var("STATEKEEP_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let log_json = std::env::var("STATEKEEP_LOG_JSON")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            data_dir,
            primary,
            backup,
            backup_name,
            lock_name,
            log_level,
            log_json,
        })
    }

    /// Path of the primary redb file.
    #[must_use]
    pub fn primary_redb_path(&self) -> PathBuf {
        self.data_dir.join("state.redb")
    }

    /// Path of the primary `RocksDB` directory.
    #[must_use]
    pub fn primary_rocksdb_path(&self) -> PathBuf {
        self.data_dir.join("state-rocksdb")
    }
}
