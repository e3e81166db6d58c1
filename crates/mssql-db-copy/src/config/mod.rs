//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    ///
    /// Connection strings may be left out of the file and supplied later
    /// (the CLI passes them positionally), so only the structure is checked
    /// here. Call [`Config::validate`] once the configuration is complete.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        validation::validate_settings(&config)?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl ConnectionConfig {
    /// Create a connection config from an ADO.NET style connection string.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }

    /// Build a tiberius configuration from the connection string.
    pub fn tiberius_config(&self) -> Result<tiberius::Config> {
        Ok(tiberius::Config::from_ado_string(&self.connection_string)?)
    }

    /// Connection string with any password value replaced.
    pub fn redacted(&self) -> String {
        self.connection_string
            .split(';')
            .map(|part| {
                let key = part.split('=').next().unwrap_or_default().trim();
                if key.eq_ignore_ascii_case("password") || key.eq_ignore_ascii_case("pwd") {
                    format!("{}=[REDACTED]", key)
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_defaults() {
        let config = Config::from_yaml("migration:\n  max_attempts: 5\n").unwrap();
        assert_eq!(config.migration.max_attempts, 5);
        assert_eq!(config.migration.max_errors, 100);
        assert_eq!(config.migration.mode, CopyMode::Full);
        assert!(config.migration.log_sql);
        assert!(config.scripter.dri_checks);
        assert!(config.source.connection_string.is_empty());
    }

    #[test]
    fn test_from_yaml_mode_and_scripter() {
        let yaml = r#"
source:
  connection_string: "Server=tcp:src,1433;Database=Sales;User Id=sa;Password=x"
target:
  connection_string: "Server=tcp:dst,1433;Database=Sales;User Id=sa;Password=x"
migration:
  workers: 6
  mode: data_only
scripter:
  no_collation: true
  triggers: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.migration.workers, Some(6));
        assert_eq!(config.migration.mode, CopyMode::DataOnly);
        assert!(config.scripter.no_collation);
        assert!(!config.scripter.triggers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_rejects_zero_attempts() {
        assert!(Config::from_yaml("migration:\n  max_attempts: 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "migration:\n  max_errors: 7").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.migration.max_errors, 7);
    }

    #[test]
    fn test_redacted_hides_password() {
        let conn = ConnectionConfig::new("Server=tcp:db,1433;User Id=sa;Password=hunter2");
        let redacted = conn.redacted();
        assert!(redacted.contains("Password=[REDACTED]"));
        assert!(!redacted.contains("hunter2"));
    }

    #[test]
    fn test_tiberius_config_parses_ado_string() {
        let conn = ConnectionConfig::new(
            "Server=tcp:localhost,1433;Database=Sales;User Id=sa;Password=x;TrustServerCertificate=true",
        );
        assert!(conn.tiberius_config().is_ok());
    }
}
