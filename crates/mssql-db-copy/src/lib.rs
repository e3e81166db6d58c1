//! # mssql-db-copy
//!
//! Copy a SQL Server database's objects and data to another instance.
//!
//! Tables, views, functions and procedures are created on the target in
//! dependency order by a pool of workers. Each object moves through a small
//! state machine (schema, data, indexes), and an object's dependents are
//! released as soon as its schema exists, so independent parts of the
//! catalog proceed in parallel. Failed items are retried up to a configured
//! limit and a global error budget stops a run that is broken beyond repair.
//!
//! - **Full** mode creates the schema and copies data
//! - **Schema only** creates objects, indexes and foreign keys
//! - **Data only** fills an existing, empty schema
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_db_copy::{Config, MigrationOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> mssql_db_copy::Result<()> {
//!     let config = Config::new(
//!         "Server=tcp:src,1433;Database=Sales;User Id=sa;Password=...",
//!         "Server=tcp:dst,1433;Database=Sales;User Id=sa;Password=...",
//!     )
//!     .with_auto_tuning();
//!     config.validate()?;
//!
//!     let orchestrator = MigrationOrchestrator::connect(config).await?;
//!     let result = orchestrator.run().await?;
//!     println!("{} of {} objects copied", result.items_completed, result.items_total);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod runlog;
pub mod scheduler;

// Re-exports for convenient access
pub use catalog::{Dependency, ObjectId, ObjectKind, SqlObject};
pub use config::{Config, ConnectionConfig, CopyMode, MigrationConfig, ScripterOptions};
pub use database::{Connector, Database, MssqlConnector};
pub use error::{CopyError, Result};
pub use orchestrator::{FailedItem, MigrationOrchestrator, MigrationResult};
pub use progress::{ProgressHook, ProgressSnapshot};
pub use runlog::RunLog;
pub use scheduler::{ItemStatus, MigrationItem};
