//! In-memory collaborators for orchestrator tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Connector, Executor, Inventory, SchemaScripter};
use crate::catalog::{Dependency, ObjectId, SqlObject};
use crate::error::{CopyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

#[derive(Debug, Default)]
pub struct FakeState {
    /// Objects listed on the source.
    pub source_objects: Vec<SqlObject>,

    /// Objects listed on the target.
    pub target_objects: Vec<SqlObject>,

    pub dependencies: Vec<Dependency>,

    /// Source tables holding rows.
    pub source_rows: HashSet<ObjectId>,

    /// Target tables holding rows.
    pub target_rows: HashSet<ObjectId>,

    /// Statements run on the target, bulk copies as `COPY <table>`.
    pub executed: Vec<String>,

    /// Statements scripted on the source.
    pub scripted: Vec<String>,

    /// Remaining injected failures: statements containing the text fail.
    pub failures: Vec<(String, usize)>,

    /// Connections currently checked out.
    pub open: usize,
}

impl FakeState {
    fn take_failure(&mut self, sql: &str) -> bool {
        for (pattern, remaining) in self.failures.iter_mut() {
            if *remaining > 0 && sql.contains(pattern.as_str()) {
                *remaining -= 1;
                return true;
            }
        }
        false
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    /// Source catalog with an empty target.
    pub fn new(objects: Vec<SqlObject>, dependencies: Vec<Dependency>) -> Self {
        let connector = Self::default();
        {
            let mut state = connector.state();
            state.source_objects = objects;
            state.dependencies = dependencies;
        }
        connector
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` statements containing `pattern`.
    pub fn fail(&self, pattern: &str, times: usize) {
        self.state().failures.push((pattern.to_string(), times));
    }

    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Executed statements containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.state()
            .executed
            .iter()
            .filter(|sql| sql.contains(pattern))
            .count()
    }

    fn open(&self, side: Side) -> FakeDb {
        self.state().open += 1;
        FakeDb {
            side,
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Db = FakeDb;

    async fn source(&self) -> Result<FakeDb> {
        Ok(self.open(Side::Source))
    }

    async fn target(&self) -> Result<FakeDb> {
        Ok(self.open(Side::Target))
    }
}

pub struct FakeDb {
    side: Side,
    state: Arc<Mutex<FakeState>>,
}

impl FakeDb {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn script(&self, text: String) -> Vec<String> {
        self.state().scripted.push(text.clone());
        vec![text]
    }
}

impl Drop for FakeDb {
    fn drop(&mut self) {
        let mut state = self.state();
        state.open = state.open.saturating_sub(1);
    }
}

#[async_trait]
impl Inventory for FakeDb {
    async fn list_objects(&mut self, tables_only: bool) -> Result<Vec<SqlObject>> {
        let state = self.state();
        let objects = match self.side {
            Side::Source => &state.source_objects,
            Side::Target => &state.target_objects,
        };
        Ok(objects
            .iter()
            .filter(|o| !tables_only || o.is_table())
            .cloned()
            .collect())
    }

    async fn list_dependencies(&mut self) -> Result<Vec<Dependency>> {
        Ok(self.state().dependencies.clone())
    }

    async fn is_table_empty(&mut self, table: &SqlObject) -> Result<bool> {
        let state = self.state();
        let rows = match self.side {
            Side::Source => &state.source_rows,
            Side::Target => &state.target_rows,
        };
        Ok(!rows.contains(&table.id))
    }
}

#[async_trait]
impl SchemaScripter for FakeDb {
    async fn script_schemas(&mut self) -> Result<Vec<String>> {
        Ok(self.script("CREATE SCHEMA [app]".to_string()))
    }

    async fn script_object(
        &mut self,
        object: &SqlObject,
        include_indexes: bool,
    ) -> Result<Vec<String>> {
        let mut statements = self.script(format!("CREATE {}", object));
        if include_indexes && object.is_table() {
            statements.extend(self.script(format!("CREATE INDEX ON {}", object.full_name())));
        }
        Ok(statements)
    }

    async fn script_foreign_keys(&mut self, table: &SqlObject) -> Result<Vec<String>> {
        Ok(self.script(format!("ADD FK ON {}", table.full_name())))
    }

    async fn script_drop_foreign_keys(&mut self, table: &SqlObject) -> Result<Vec<String>> {
        Ok(self.script(format!("DROP FK ON {}", table.full_name())))
    }

    async fn script_indexes(&mut self, table: &SqlObject) -> Result<Vec<String>> {
        Ok(self.script(format!("CREATE INDEX ON {}", table.full_name())))
    }

    async fn script_drop_indexes(&mut self, table: &SqlObject) -> Result<Vec<String>> {
        Ok(self.script(format!("DROP INDEX ON {}", table.full_name())))
    }

    async fn script_select(&mut self, table: &SqlObject) -> Result<String> {
        Ok(format!("SELECT * FROM {}", table.full_name()))
    }
}

#[async_trait]
impl Executor for FakeDb {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut state = self.state();
        if state.take_failure(sql) {
            return Err(CopyError::statement(sql, "injected failure"));
        }
        state.executed.push(sql.to_string());
        Ok(())
    }

    async fn bulk_copy(
        &mut self,
        source: &mut Self,
        select: &str,
        table: &SqlObject,
    ) -> Result<u64> {
        debug_assert_eq!(source.side, Side::Source);
        let statement = format!("COPY {}", table.full_name());
        let mut state = self.state();
        if state.take_failure(&statement) {
            return Err(CopyError::statement(table, "injected failure"));
        }
        state.scripted.push(select.to_string());
        state.executed.push(statement);
        Ok(10)
    }
}
