//! `statekeep` CLI: inspect and maintain persisted wallet state.
//!
//! Opens the primary and backup stores described by [`config::CliConfig`],
//! drives one [`PersistenceManager`] operation, and prints the result as
//! JSON on stdout. Logs go to stderr.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use statekeep_core::{MetaData, NamedLock, PersistenceError, PersistenceManager, StorageKind};
use statekeep_storage::{
    BackendFactory, KeyValueBackend, MemoryBackend, MemoryFactory, RedbBackend, RedbFactory,
};
use tracing::{debug, info};

use config::{BackupKind, CliConfig, PrimaryKind};

/// Exit code for a detected vault loss.
const EXIT_MISSING_VAULT: u8 = 2;

// ── CLI structure ────────────────────────────────────────────────────

/// statekeep: crash-safe wallet state persistence.
#[derive(Parser)]
#[command(
    name = "statekeep",
    version,
    about = "statekeep CLI: read, write, migrate, back up, and reset persisted state",
    long_about = None,
    after_help = "Environment variables:\n  \
         STATEKEEP_DATA_DIR     Directory for on-disk stores (default: ./data)\n  \
         STATEKEEP_PRIMARY      memory | redb | rocksdb (default: redb)\n  \
         STATEKEEP_BACKUP       redb | memory | none (default: redb)\n  \
         STATEKEEP_BACKUP_NAME  Backup store name (default: state-backup)\n  \
         STATEKEEP_LOCK_NAME    State lock name (default: state-lock)\n  \
         STATEKEEP_LOG_LEVEL    Log filter (default: info)\n\n\
         Examples:\n  \
         statekeep set state.json --version 10\n  \
         statekeep get --validate-vault\n  \
         statekeep migrate --version 11\n  \
         statekeep update PreferencesController '{\"theme\":\"dark\"}'"
)]
struct Cli {
    /// Directory holding the on-disk stores.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Primary store medium.
    #[arg(long, global = true, value_enum)]
    primary: Option<PrimaryKind>,

    /// Backup store medium.
    #[arg(long, global = true, value_enum)]
    backup: Option<BackupKind>,

    /// Backup store name.
    #[arg(long, global = true)]
    backup_name: Option<String>,

    /// State lock name.
    #[arg(long, global = true)]
    lock_name: Option<String>,

    /// Log level filter.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the persisted state and metadata.
    Get {
        /// Fail if the vault is gone but the backup still remembers one.
        #[arg(long)]
        validate_vault: bool,
    },
    /// Overwrite the whole state from a JSON file (`-` for stdin).
    Set {
        /// Path to a JSON object holding the state tree.
        file: PathBuf,
        /// Schema version to record alongside the state.
        #[arg(long)]
        version: u64,
    },
    /// Change one top-level key of a split state and persist it.
    Update {
        /// Top-level state key.
        key: String,
        /// New JSON value for the key.
        #[arg(required_unless_present = "delete", conflicts_with = "delete")]
        value: Option<String>,
        /// Remove the key instead.
        #[arg(long)]
        delete: bool,
    },
    /// Convert monolithic state into the per-key layout.
    Migrate {
        /// Schema version to record after migration.
        #[arg(long)]
        version: u64,
    },
    /// Print the backup record.
    Backup,
    /// Delete all persisted state and backups.
    Reset,
}

impl Cli {
    /// Apply command-line overrides on top of the environment.
    fn resolve(&self, mut config: CliConfig) -> CliConfig {
        if let Some(dir) = &self.data_dir {
            config.data_dir.clone_from(dir);
        }
        if let Some(primary) = self.primary {
            config.primary = primary;
        }
        if let Some(backup) = self.backup {
            config.backup = backup;
        }
        if let Some(name) = &self.backup_name {
            config.backup_name.clone_from(name);
        }
        if let Some(name) = &self.lock_name {
            config.lock_name.clone_from(name);
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        config.log_json |= self.log_json;
        config
    }
}

// ── Bootstrap ────────────────────────────────────────────────────────

fn init_logging(config: &CliConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_primary(config: &CliConfig) -> Result<Arc<dyn KeyValueBackend>> {
    let backend: Arc<dyn KeyValueBackend> = match config.primary {
        PrimaryKind::Memory => {
            info!("using in-memory primary store (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        PrimaryKind::Redb => {
            tokio::fs::create_dir_all(&config.data_dir)
                .await
                .with_context(|| {
                    format!("failed to create data dir {}", config.data_dir.display())
                })?;
            let path = config.primary_redb_path();
            info!(path = %path.display(), "using redb primary store");
            let backend = tokio::task::spawn_blocking(move || RedbBackend::open(path))
                .await
                .context("redb open task panicked")?
                .context("failed to open redb primary store")?;
            Arc::new(backend)
        }
        #[cfg(feature = "rocksdb-backend")]
        PrimaryKind::Rocksdb => {
            let path = config.primary_rocksdb_path();
            info!(path = %path.display(), "using RocksDB primary store");
            let backend =
                tokio::task::spawn_blocking(move || statekeep_storage::RocksDbBackend::open(path))
                    .await
                    .context("RocksDB open task panicked")?
                    .context("failed to open RocksDB primary store")?;
            Arc::new(backend)
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        PrimaryKind::Rocksdb => {
            bail!("RocksDB support not compiled in; rebuild with --features rocksdb-backend")
        }
    };
    Ok(backend)
}

fn backup_factory(config: &CliConfig) -> Option<Arc<dyn BackendFactory>> {
    let factory: Arc<dyn BackendFactory> = match config.backup {
        BackupKind::Redb => Arc::new(RedbFactory::new(&config.data_dir)),
        BackupKind::Memory => Arc::new(MemoryFactory::new()),
        BackupKind::None => {
            debug!("backup store disabled");
            return None;
        }
    };
    Some(factory)
}

async fn build_manager(config: &CliConfig) -> Result<PersistenceManager> {
    let mut builder = PersistenceManager::builder(open_primary(config).await?)
        .lock(NamedLock::new(&config.lock_name));
    if let Some(factory) = backup_factory(config) {
        builder = builder
            .backup(factory)
            .backup_store(config.backup_name.clone(), statekeep_core::backup::BACKUP_STORE_VERSION);
    }
    Ok(builder.build())
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match CliConfig::from_env() {
        Ok(env) => cli.resolve(env),
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    let result = match build_manager(&config).await {
        Ok(manager) => run(&manager, cli.command).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(PersistenceError::MissingVault(missing)) = e.downcast_ref::<PersistenceError>() {
                print_json(&json!({ "error": "missing-vault", "backup": missing.backup }));
                eprintln!("Error: {e:#}");
                return ExitCode::from(EXIT_MISSING_VAULT);
            }
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(manager: &PersistenceManager, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Get { validate_vault } => cmd_get(manager, validate_vault).await,
        Commands::Set { file, version } => cmd_set(manager, &file, version).await,
        Commands::Update { key, value, delete } => {
            let value = if delete { None } else { value };
            cmd_update(manager, &key, value.as_deref()).await
        }
        Commands::Migrate { version } => cmd_migrate(manager, version).await,
        Commands::Backup => cmd_backup(manager).await,
        Commands::Reset => cmd_reset(manager).await,
    }
}

// ── Commands ─────────────────────────────────────────────────────────

async fn cmd_get(manager: &PersistenceManager, validate_vault: bool) -> Result<()> {
    let state = manager.get(validate_vault).await?;
    print_json(&serde_json::to_value(state).context("failed to encode state")?);
    Ok(())
}

async fn cmd_set(manager: &PersistenceManager, file: &Path, version: u64) -> Result<()> {
    let state = read_json(file)?;
    // Learn the current layout so a split store is refused.
    manager.get(false).await?;
    manager.set_metadata(MetaData::new(version))?;
    manager.set(state).await?;
    ensure_written(manager)?;
    print_json(&json!({ "written": true, "version": version }));
    Ok(())
}

async fn cmd_update(manager: &PersistenceManager, key: &str, value: Option<&str>) -> Result<()> {
    let value = value
        .map(serde_json::from_str::<Value>)
        .transpose()
        .with_context(|| format!("value for '{key}' is not valid JSON"))?;

    let current = manager.get(false).await?;
    if manager.storage_kind() != StorageKind::Split {
        bail!("state is not in split layout; run `statekeep migrate` first");
    }
    let meta = current
        .and_then(|s| s.meta)
        .context("persisted state has no metadata")?;
    manager.set_metadata(meta)?;

    let deleted = value.is_none();
    manager.update(key, value)?;
    manager.persist().await?;
    ensure_written(manager)?;
    print_json(&json!({ "key": key, "deleted": deleted }));
    Ok(())
}

async fn cmd_migrate(manager: &PersistenceManager, version: u64) -> Result<()> {
    let current = manager.get(false).await?;
    if manager.storage_kind() == StorageKind::Split {
        info!("state already uses split layout");
        print_json(&json!({ "storageKind": StorageKind::Split, "migrated": false }));
        return Ok(());
    }
    let data = current
        .and_then(|s| s.data)
        .map_or_else(|| Value::Object(serde_json::Map::new()), Value::Object);

    manager.set_metadata(MetaData::new(version))?;
    manager.migrate_to_split_state(data).await?;
    ensure_written(manager)?;
    print_json(&json!({ "storageKind": StorageKind::Split, "migrated": true }));
    Ok(())
}

async fn cmd_backup(manager: &PersistenceManager) -> Result<()> {
    manager.open().await?;
    let record = manager.get_backup().await?;
    print_json(&serde_json::to_value(record).context("failed to encode backup record")?);
    Ok(())
}

async fn cmd_reset(manager: &PersistenceManager) -> Result<()> {
    manager.reset().await?;
    print_json(&json!({ "reset": true }));
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Writes report failures out of band; surface them as a CLI error.
fn ensure_written(manager: &PersistenceManager) -> Result<()> {
    if manager.data_persistence_failing() {
        bail!("state could not be written; see log output for details");
    }
    Ok(())
}

fn read_json(file: &Path) -> Result<Value> {
    let raw = if file == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("file not found or unreadable: {}", file.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", file.display()))
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Error: failed to encode output: {e}"),
    }
}
