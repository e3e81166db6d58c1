//! Configuration validation.

use super::Config;
use crate::error::{CopyError, Result};

/// Validate a complete configuration, including connection strings.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.connection_string.trim().is_empty() {
        return Err(CopyError::Config("source connection string is required".into()));
    }
    if config.target.connection_string.trim().is_empty() {
        return Err(CopyError::Config("target connection string is required".into()));
    }

    // Cannot copy a database onto itself
    if config.source.connection_string.trim() == config.target.connection_string.trim() {
        return Err(CopyError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    validate_settings(config)
}

/// Validate the settings that do not depend on connection strings.
pub fn validate_settings(config: &Config) -> Result<()> {
    if let Some(0) = config.migration.workers {
        return Err(CopyError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if config.migration.max_attempts == 0 {
        return Err(CopyError::Config(
            "migration.max_attempts must be at least 1".into(),
        ));
    }
    if config.migration.max_errors == 0 {
        return Err(CopyError::Config(
            "migration.max_errors must be at least 1".into(),
        ));
    }
    if config.migration.progress_interval_ms == 0 {
        return Err(CopyError::Config(
            "migration.progress_interval_ms must be at least 1".into(),
        ));
    }

    Ok(())
}
