//! Database collaborators used by the migration passes.
//!
//! The orchestrator only talks to these traits. [`mssql`] implements them
//! over tiberius; tests use an in-memory fake.

pub mod ddl;
pub mod metadata;
pub mod mssql;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use tracing::warn;

use crate::catalog::{Dependency, SqlObject};
use crate::error::Result;

pub use mssql::{MssqlConnector, MssqlDatabase};

/// Catalog queries.
#[async_trait]
pub trait Inventory: Send {
    /// User objects of the database; tables only when `tables_only`.
    async fn list_objects(&mut self, tables_only: bool) -> Result<Vec<SqlObject>>;

    /// `(referencing, referenced)` pairs between user objects, without direct 2-cycles.
    async fn list_dependencies(&mut self) -> Result<Vec<Dependency>>;

    /// Whether the table holds no rows.
    async fn is_table_empty(&mut self, table: &SqlObject) -> Result<bool>;
}

/// DDL and query text for objects of this database.
///
/// Objects are looked up by schema-qualified name, so an object listed on
/// one database can be scripted from another.
#[async_trait]
pub trait SchemaScripter: Send {
    /// Statements creating every user schema.
    async fn script_schemas(&mut self) -> Result<Vec<String>>;

    /// Statements creating `object`. Non-clustered indexes are included only
    /// when `include_indexes` is set.
    async fn script_object(&mut self, object: &SqlObject, include_indexes: bool)
        -> Result<Vec<String>>;

    /// Statements creating the table's foreign keys.
    async fn script_foreign_keys(&mut self, table: &SqlObject) -> Result<Vec<String>>;

    /// Statements dropping the table's foreign keys.
    async fn script_drop_foreign_keys(&mut self, table: &SqlObject) -> Result<Vec<String>>;

    /// Statements creating the table's non-clustered indexes.
    async fn script_indexes(&mut self, table: &SqlObject) -> Result<Vec<String>>;

    /// Statements dropping the table's non-clustered indexes.
    async fn script_drop_indexes(&mut self, table: &SqlObject) -> Result<Vec<String>>;

    /// SELECT over the table's copyable columns ordered by the clustered key.
    async fn script_select(&mut self, table: &SqlObject) -> Result<String>;
}

/// Statement execution and row transfer.
#[async_trait]
pub trait Executor: Send + Sized {
    /// Run one statement batch.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Stream the rows of `select` on `source` into `table` on this database.
    ///
    /// Identity values and NULLs are preserved. Returns the number of rows copied.
    async fn bulk_copy(&mut self, source: &mut Self, select: &str, table: &SqlObject)
        -> Result<u64>;
}

/// Run `cleanup` on `db` when `result` failed, then hand `result` back.
///
/// Keeps a pooled session from carrying a failed load's state into the
/// next checkout. A cleanup failure is logged and the original error wins.
pub(crate) async fn clean_up_after<E: Executor, T: Send>(
    db: &mut E,
    result: Result<T>,
    cleanup: &str,
) -> Result<T> {
    if result.is_err() {
        if let Err(e) = db.execute(cleanup).await {
            warn!("Cleanup after failed load did not run: {}", e);
        }
    }
    result
}

/// One exclusively held connection to a database.
pub trait Database: Inventory + SchemaScripter + Executor {}

impl<T: Inventory + SchemaScripter + Executor> Database for T {}

/// Hands out connections to the source and target databases.
///
/// Every call returns a connection no other caller holds; it goes back to
/// the connector when dropped.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Db: Database;

    async fn source(&self) -> Result<Self::Db>;

    async fn target(&self) -> Result<Self::Db>;
}
