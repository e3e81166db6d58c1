//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            cpu_cores: sys.cpus().len().max(1),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Source database connection.
    #[serde(default)]
    pub source: ConnectionConfig,

    /// Target database connection.
    #[serde(default)]
    pub target: ConnectionConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// DDL scripting options.
    #[serde(default)]
    pub scripter: ScripterOptions,
}

impl Config {
    /// Create a configuration for the given connection strings with default settings.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: ConnectionConfig::new(source),
            target: ConnectionConfig::new(target),
            ..Self::default()
        }
    }

    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// SQL Server connection configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// ADO.NET style connection string
    /// (`Server=tcp:host,1433;Database=db;User Id=sa;Password=...`).
    #[serde(default)]
    pub connection_string: String,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("connection_string", &self.redacted())
            .finish()
    }
}

/// What a run copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyMode {
    /// Create the schema, then copy data.
    #[default]
    Full,

    /// Create the schema only.
    SchemaOnly,

    /// Copy data into an existing, empty schema.
    DataOnly,
}

impl CopyMode {
    /// Whether this mode emits object DDL on the target.
    pub fn creates_schema(self) -> bool {
        !matches!(self, CopyMode::DataOnly)
    }

    /// Whether this mode copies rows.
    pub fn copies_data(self) -> bool {
        !matches!(self, CopyMode::SchemaOnly)
    }
}

impl fmt::Display for CopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyMode::Full => write!(f, "full"),
            CopyMode::SchemaOnly => write!(f, "schema_only"),
            CopyMode::DataOnly => write!(f, "data_only"),
        }
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Number of parallel workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Attempts per item before it is failed terminally (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Item failures per pass after which no new items are started (default: 100).
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,

    /// What the run copies (default: full).
    #[serde(default)]
    pub mode: CopyMode,

    /// Write every executed statement and its elapsed time to the run log (default: true).
    #[serde(default = "default_true")]
    pub log_sql: bool,

    /// Directory for run log files (default: "log").
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Progress report interval in milliseconds (default: 1000).
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_attempts: default_max_attempts(),
            max_errors: default_max_errors(),
            mode: CopyMode::default(),
            log_sql: true,
            log_dir: default_log_dir(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.workers.is_none() {
            // Workers mostly wait on the servers, so one per core is plenty.
            self.workers = Some(resources.cpu_cores.clamp(2, 16));
            info!(
                "Auto-tuned workers={} ({} CPU cores)",
                self.get_workers(),
                resources.cpu_cores
            );
        }
        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }
}

/// Options controlling generated DDL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScripterOptions {
    /// Omit column COLLATE clauses (default: false).
    #[serde(default)]
    pub no_collation: bool,

    /// Script identity columns as plain columns (default: false).
    #[serde(default)]
    pub no_identities: bool,

    /// Script default constraints (default: true).
    #[serde(default = "default_true")]
    pub dri_defaults: bool,

    /// Script check constraints (default: true).
    #[serde(default = "default_true")]
    pub dri_checks: bool,

    /// Create foreign keys WITH NOCHECK (default: false).
    #[serde(default)]
    pub dri_with_no_check: bool,

    /// Script triggers together with their table or view (default: true).
    #[serde(default = "default_true")]
    pub triggers: bool,

    /// Guard every CREATE/DROP with an existence check (default: true).
    #[serde(default = "default_true")]
    pub include_if_not_exists: bool,
}

impl Default for ScripterOptions {
    fn default() -> Self {
        Self {
            no_collation: false,
            no_identities: false,
            dri_defaults: true,
            dri_checks: true,
            dri_with_no_check: false,
            triggers: true,
            include_if_not_exists: true,
        }
    }
}

// Default value functions for serde
fn default_max_attempts() -> u32 {
    3
}

fn default_max_errors() -> usize {
    100
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tuning_keeps_explicit_workers() {
        let config = MigrationConfig {
            workers: Some(3),
            ..MigrationConfig::default()
        };
        let tuned = config.with_auto_tuning(&SystemResources { cpu_cores: 64 });
        assert_eq!(tuned.get_workers(), 3);
    }

    #[test]
    fn test_auto_tuning_clamps_workers() {
        let tuned = MigrationConfig::default().with_auto_tuning(&SystemResources { cpu_cores: 64 });
        assert_eq!(tuned.get_workers(), 16);

        let tuned = MigrationConfig::default().with_auto_tuning(&SystemResources { cpu_cores: 1 });
        assert_eq!(tuned.get_workers(), 2);
    }

    #[test]
    fn test_copy_mode_flags() {
        assert!(CopyMode::Full.creates_schema() && CopyMode::Full.copies_data());
        assert!(CopyMode::SchemaOnly.creates_schema() && !CopyMode::SchemaOnly.copies_data());
        assert!(!CopyMode::DataOnly.creates_schema() && CopyMode::DataOnly.copies_data());
    }
}
