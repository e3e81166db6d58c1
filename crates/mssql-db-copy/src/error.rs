//! Error types for the database copy library.

use thiserror::Error;

/// Main error type for copy operations.
#[derive(Error, Debug)]
pub enum CopyError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or statement error reported by the driver
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Run precondition not met (target not empty, schema already present)
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// DDL could not be produced for an object
    #[error("Scripting failed for {object}: {message}")]
    Scripting { object: String, message: String },

    /// A statement or bulk copy failed for an object
    #[error("Statement failed for {object}: {message}")]
    Statement { object: String, message: String },

    /// Worker action failed outside the database (panic, internal invariant)
    #[error("Action failed: {0}")]
    Action(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CopyError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        CopyError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Scripting error
    pub fn scripting(object: impl ToString, message: impl Into<String>) -> Self {
        CopyError::Scripting {
            object: object.to_string(),
            message: message.into(),
        }
    }

    /// Create a Statement error
    pub fn statement(object: impl ToString, message: impl Into<String>) -> Self {
        CopyError::Statement {
            object: object.to_string(),
            message: message.into(),
        }
    }

    /// Process exit code for errors that abort the whole run.
    ///
    /// Item failures are reported through the run result instead; this code is
    /// kept at the top of the range so it never collides with a failed-item count
    /// below 255.
    pub fn exit_code(&self) -> u8 {
        u8::MAX
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for copy operations.
pub type Result<T> = std::result::Result<T, CopyError>;
