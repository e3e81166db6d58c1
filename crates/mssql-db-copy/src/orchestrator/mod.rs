//! Migration orchestrator - main workflow coordinator.

mod actions;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::Dependency;
use crate::config::{Config, CopyMode};
use crate::database::{Connector, Inventory, MssqlConnector, SchemaScripter};
use crate::error::{CopyError, Result};
use crate::progress::ProgressHook;
use crate::runlog::RunLog;
use crate::scheduler::{
    all_succeeded, DependencyGraph, ItemAction, MigrationItem, PassReport, PoolOptions,
    WorkerPool,
};

use actions::{ProcessItem, RelationshipStep, Relationships, ValidateTarget};

/// Migration orchestrator.
pub struct MigrationOrchestrator<C: Connector> {
    config: Config,
    connector: Arc<C>,
    run_log: Arc<RunLog>,
    progress_hook: Option<ProgressHook>,
}

/// Item that did not reach `Completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    /// Object kind and qualified name.
    pub name: String,

    /// Last error recorded for the item.
    pub error: String,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// What the run copied.
    pub mode: CopyMode,

    /// Final status ("completed" or "failed").
    pub status: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Objects selected for migration.
    pub items_total: usize,

    /// Objects fully migrated.
    pub items_completed: usize,

    /// Objects that did not complete.
    pub items_failed: usize,

    /// Failed objects with their last error.
    pub failed_items: Vec<FailedItem>,

    /// Total rows bulk copied.
    pub rows_copied: u64,

    /// Whether foreign keys were re-created.
    pub relationships_restored: bool,

    /// Whether any pass stopped early on its error budget.
    pub error_budget_exhausted: bool,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_success(&self) -> bool {
        self.items_failed == 0
    }
}

impl MigrationOrchestrator<MssqlConnector> {
    /// Connect to both databases and create an orchestrator.
    pub async fn connect(config: Config) -> Result<Self> {
        let connector = MssqlConnector::connect(&config).await?;
        Ok(Self::new(config, connector))
    }
}

impl<C: Connector> MigrationOrchestrator<C> {
    /// Create an orchestrator over an existing connector, without a run log.
    pub fn new(config: Config, connector: C) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
            run_log: Arc::new(RunLog::disabled()),
            progress_hook: None,
        }
    }

    /// Write per-item traces to `run_log`.
    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Arc::new(run_log);
        self
    }

    /// Receive progress snapshots of every pass.
    pub fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.progress_hook = Some(hook);
        self
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// Run the migration.
    ///
    /// Returns `Err` only for failures that stop the whole run (preconditions,
    /// connectivity, schema bootstrap). Item failures are reported in the result.
    pub async fn run(&self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mode = self.config.migration.mode;

        info!("Starting migration run: {} (mode={})", run_id, mode);
        self.run_log
            .line(&format!("Run {} started (mode={})", run_id, mode));

        // Phase 1: Initialize
        let mut items = self.initialize().await?;
        let tables = items.iter().filter(|i| i.is_table()).count();
        info!(
            "Found {} objects to migrate ({} tables)",
            items.len(),
            tables
        );

        if mode == CopyMode::DataOnly {
            self.validate_target_empty(&items).await?;
        }

        // Phase 2: Dependencies
        let dependencies = self.collect_dependencies().await?;

        let mut reports = Vec::new();

        // Phase 3: Schemas or relationship drop
        if mode.creates_schema() {
            self.generate_schemas().await?;
        } else {
            let action = Relationships {
                connector: self.connector.clone(),
                step: RelationshipStep::Drop,
                log_sql: self.config.migration.log_sql,
            };
            let (report, merged) = self
                .run_table_pass("drop-relationships", items, action)
                .await;
            items = merged;
            reports.push(report);
        }

        // Phase 4: Items
        let rows_copied = Arc::new(AtomicU64::new(0));
        let action = ProcessItem {
            connector: self.connector.clone(),
            mode,
            log_sql: self.config.migration.log_sql,
            rows_copied: rows_copied.clone(),
        };
        let report = self
            .run_pass("process-items", items, &dependencies, action, true)
            .await;
        items = report.items.clone();
        reports.push(report);

        // Phase 5: Relationships, only when every table made it
        let relationships_restored = if all_succeeded(items.iter().filter(|i| i.is_table())) {
            let action = Relationships {
                connector: self.connector.clone(),
                step: RelationshipStep::Restore,
                log_sql: self.config.migration.log_sql,
            };
            let (report, merged) = self
                .run_table_pass("restore-relationships", items, action)
                .await;
            items = merged;
            let restored = report.failed().next().is_none();
            reports.push(report);
            restored
        } else {
            let failed = items
                .iter()
                .filter(|i| i.is_table() && i.succeeded != Some(true))
                .count();
            warn!(
                "Skipping relationship restore: {} table(s) failed",
                failed
            );
            self.run_log
                .line("Relationship restore skipped: not every table succeeded");
            false
        };

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let failed_items: Vec<FailedItem> = items
            .iter()
            .filter(|item| !item.is_complete())
            .map(|item| FailedItem {
                name: item.object.to_string(),
                error: item
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("stopped at {:?}", item.status)),
            })
            .collect();

        let result = MigrationResult {
            run_id,
            mode,
            status: if failed_items.is_empty() {
                "completed"
            } else {
                "failed"
            }
            .to_string(),
            started_at,
            completed_at,
            duration_seconds: duration,
            items_total: items.len(),
            items_completed: items.len() - failed_items.len(),
            items_failed: failed_items.len(),
            failed_items,
            rows_copied: rows_copied.load(Ordering::Relaxed),
            relationships_restored,
            error_budget_exhausted: reports.iter().any(|r| r.budget_exhausted),
        };

        info!(
            "Migration {}: {} of {} objects, {} rows in {:.1}s",
            result.status,
            result.items_completed,
            result.items_total,
            result.rows_copied,
            result.duration_seconds
        );
        self.run_log.line(&format!(
            "Run {} {}: {} of {} objects completed",
            result.run_id, result.status, result.items_completed, result.items_total
        ));

        Ok(result)
    }

    /// Check the target against the mode and build the item list.
    async fn initialize(&self) -> Result<Vec<MigrationItem>> {
        info!("Phase 1: Initializing");
        let mut source = self.connector.source().await?;
        let mut target = self.connector.target().await?;

        let objects = if self.config.migration.mode.creates_schema() {
            if !target.list_objects(false).await?.is_empty() {
                return Err(CopyError::Precondition(
                    "Target database already has schema migrated".into(),
                ));
            }
            source.list_objects(false).await?
        } else {
            // Only tables of the existing target schema are filled.
            target.list_objects(true).await?
        };

        Ok(MigrationItem::from_objects(objects))
    }

    /// Fail the run if any target table already holds rows.
    async fn validate_target_empty(&self, items: &[MigrationItem]) -> Result<()> {
        info!("Validating target tables are empty");
        let tables: Vec<MigrationItem> = items.iter().filter(|i| i.is_table()).cloned().collect();
        let action = ValidateTarget {
            connector: self.connector.clone(),
        };

        let report = self.run_pass("validate", tables, &[], action, false).await;
        let problems: Vec<String> = report
            .failed()
            .map(|item| {
                item.last_error
                    .clone()
                    .unwrap_or_else(|| item.object.to_string())
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CopyError::Precondition(format!(
                "Target database already has data migrated: {}",
                problems.join("; ")
            )))
        }
    }

    async fn collect_dependencies(&self) -> Result<Vec<Dependency>> {
        info!("Phase 2: Collecting dependencies");
        // Data-only runs fill tables independently.
        if !self.config.migration.mode.creates_schema() {
            return Ok(Vec::new());
        }

        let mut source = self.connector.source().await?;
        let dependencies = source.list_dependencies().await?;
        info!("Found {} dependencies", dependencies.len());
        Ok(dependencies)
    }

    async fn generate_schemas(&self) -> Result<()> {
        info!("Phase 3: Generating schemas");
        let mut source = self.connector.source().await?;
        let mut target = self.connector.target().await?;

        let mut log = self.run_log.item_log();
        log.line("Generate schemas.");
        let script = source.script_schemas().await?;
        let outcome =
            actions::run_script(&mut target, &script, &mut log, self.config.migration.log_sql)
                .await;
        self.run_log.write_item(log);
        outcome
    }

    fn pool_options(&self, retry_on_failure: bool) -> PoolOptions {
        let migration = &self.config.migration;
        PoolOptions {
            workers: migration.get_workers(),
            max_attempts: migration.max_attempts,
            max_errors: migration.max_errors,
            retry_on_failure,
            progress_interval: Duration::from_millis(migration.progress_interval_ms.max(1)),
            progress_hook: self.progress_hook.clone(),
        }
    }

    /// Run one pool pass over `items` with a fresh attempt count.
    async fn run_pass<A: ItemAction + 'static>(
        &self,
        pass: &str,
        mut items: Vec<MigrationItem>,
        dependencies: &[Dependency],
        action: A,
        retry_on_failure: bool,
    ) -> PassReport {
        for item in &mut items {
            item.attempts = 0;
        }
        let graph = DependencyGraph::build(items, dependencies);
        WorkerPool::new(self.pool_options(retry_on_failure))
            .run(pass, graph, Arc::new(action), self.run_log.clone())
            .await
    }

    /// Run a pass over the tables of `items`, returning every item afterwards.
    async fn run_table_pass<A: ItemAction + 'static>(
        &self,
        pass: &str,
        items: Vec<MigrationItem>,
        action: A,
    ) -> (PassReport, Vec<MigrationItem>) {
        let (tables, mut others): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|i| i.is_table());

        let report = self.run_pass(pass, tables, &[], action, true).await;
        others.extend(report.items.iter().cloned());
        others.sort_unstable_by_key(|item| item.id());
        (report, others)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ObjectKind, SqlObject};
    use crate::database::fake::FakeConnector;
    use crate::progress::ProgressSnapshot;
    use crate::scheduler::BLOCKED_MESSAGE;
    use std::sync::Mutex;

    fn config(mode: CopyMode) -> Config {
        let mut config = Config::new("Server=src;Database=a", "Server=dst;Database=b");
        config.migration.workers = Some(4);
        config.migration.mode = mode;
        config.migration.progress_interval_ms = 10;
        config
    }

    fn object(id: i32, name: &str, kind: ObjectKind) -> SqlObject {
        SqlObject::new(id, "dbo", name, kind)
    }

    /// Customers <- Orders <- OrderSummary (view).
    fn catalog() -> FakeConnector {
        let connector = FakeConnector::new(
            vec![
                object(1, "Customers", ObjectKind::Table),
                object(2, "Orders", ObjectKind::Table),
                object(3, "OrderSummary", ObjectKind::View),
            ],
            vec![Dependency::new(2, 1), Dependency::new(3, 2)],
        );
        connector.state().source_rows.extend([1, 2]);
        connector
    }

    fn position(executed: &[String], statement: &str) -> usize {
        executed
            .iter()
            .position(|sql| sql == statement)
            .unwrap_or_else(|| panic!("{} was not executed", statement))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_copy() {
        let connector = catalog();
        let orchestrator = MigrationOrchestrator::new(config(CopyMode::Full), connector.clone());

        let result = orchestrator.run().await.unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.items_total, 3);
        assert_eq!(result.items_completed, 3);
        assert_eq!(result.rows_copied, 20);
        assert!(result.relationships_restored);
        assert!(!result.error_budget_exhausted);

        let executed = connector.executed();
        assert_eq!(executed[0], "CREATE SCHEMA [app]");
        assert!(
            position(&executed, "CREATE table [dbo].[Customers]")
                < position(&executed, "CREATE table [dbo].[Orders]")
        );
        assert!(
            position(&executed, "CREATE table [dbo].[Orders]")
                < position(&executed, "CREATE view [dbo].[OrderSummary]")
        );
        assert!(
            position(&executed, "CREATE INDEX ON [dbo].[Orders]")
                < position(&executed, "ADD FK ON [dbo].[Orders]")
        );
        assert_eq!(connector.count("COPY"), 2);
        assert_eq!(connector.count("ADD FK"), 2);
        assert_eq!(connector.state().open, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retried_item_keeps_schema() {
        let connector = catalog();
        connector.fail("COPY [dbo].[Orders]", 2);
        let orchestrator = MigrationOrchestrator::new(config(CopyMode::Full), connector.clone());

        let result = orchestrator.run().await.unwrap();

        assert_eq!(result.items_failed, 0);
        assert_eq!(connector.count("CREATE table [dbo].[Orders]"), 1);
        assert_eq!(connector.count("COPY [dbo].[Orders]"), 1);
        assert!(result.relationships_restored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_table_failure_skips_relationship_restore() {
        let connector = catalog();
        connector.fail("COPY [dbo].[Orders]", 10);
        let orchestrator = MigrationOrchestrator::new(config(CopyMode::Full), connector.clone());

        let result = orchestrator.run().await.unwrap();

        assert_eq!(result.status, "failed");
        assert_eq!(result.items_failed, 1);
        assert_eq!(result.failed_items[0].name, "table [dbo].[Orders]");
        assert!(result.failed_items[0].error.contains("injected failure"));
        assert!(!result.relationships_restored);
        assert_eq!(connector.count("ADD FK"), 0);

        // The view only needed the table's schema.
        assert_eq!(connector.count("CREATE view [dbo].[OrderSummary]"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_schema_blocks_dependents() {
        let connector = catalog();
        connector.fail("CREATE table [dbo].[Customers]", 10);
        let orchestrator = MigrationOrchestrator::new(config(CopyMode::Full), connector.clone());

        let result = orchestrator.run().await.unwrap();

        assert_eq!(result.items_failed, 3);
        let blocked: Vec<_> = result
            .failed_items
            .iter()
            .filter(|f| f.error == BLOCKED_MESSAGE)
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(
            blocked,
            vec!["table [dbo].[Orders]", "view [dbo].[OrderSummary]"]
        );
        assert_eq!(connector.count("CREATE table [dbo].[Orders]"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_schema_only() {
        let connector = catalog();
        let orchestrator =
            MigrationOrchestrator::new(config(CopyMode::SchemaOnly), connector.clone());

        let result = orchestrator.run().await.unwrap();

        assert_eq!(result.items_completed, 3);
        assert_eq!(result.rows_copied, 0);
        assert_eq!(connector.count("COPY"), 0);
        assert_eq!(connector.count("CREATE INDEX"), 2);
        assert_eq!(connector.count("ADD FK"), 2);
    }

    #[tokio::test]
    async fn test_existing_schema_is_rejected() {
        let connector = catalog();
        connector.state().target_objects = vec![object(9, "Legacy", ObjectKind::Table)];
        let orchestrator = MigrationOrchestrator::new(config(CopyMode::Full), connector.clone());

        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, CopyError::Precondition(_)));
        assert!(connector.executed().is_empty());
    }

    fn data_only_catalog() -> FakeConnector {
        let connector = FakeConnector::default();
        {
            let mut state = connector.state();
            state.target_objects = vec![
                object(1, "Customers", ObjectKind::Table),
                object(2, "Orders", ObjectKind::Table),
            ];
            state.source_rows.insert(1);
        }
        connector
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_data_only_requires_empty_target() {
        let connector = data_only_catalog();
        connector.state().target_rows.insert(2);
        let orchestrator =
            MigrationOrchestrator::new(config(CopyMode::DataOnly), connector.clone());

        let err = orchestrator.run().await.unwrap_err();

        match err {
            CopyError::Precondition(message) => {
                assert!(message.contains("table [dbo].[Orders] has data"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(connector.executed().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_data_only_fills_existing_tables() {
        let connector = data_only_catalog();
        let orchestrator =
            MigrationOrchestrator::new(config(CopyMode::DataOnly), connector.clone());

        let result = orchestrator.run().await.unwrap();

        assert_eq!(result.items_completed, 2);
        assert_eq!(result.rows_copied, 10);
        assert!(result.relationships_restored);

        let executed = connector.executed();
        assert_eq!(connector.count("CREATE table"), 0);
        assert_eq!(connector.count("CREATE SCHEMA"), 0);
        assert_eq!(connector.count("DROP FK"), 2);
        assert_eq!(connector.count("DROP INDEX"), 1);
        assert!(
            position(&executed, "DROP FK ON [dbo].[Customers]")
                < position(&executed, "DROP INDEX ON [dbo].[Customers]")
        );
        assert!(
            position(&executed, "COPY [dbo].[Customers]")
                < position(&executed, "CREATE INDEX ON [dbo].[Customers]")
        );
        assert_eq!(connector.count("ADD FK"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_budget_is_reported() {
        let connector = FakeConnector::new(
            (1..=5)
                .map(|id| object(id, &format!("T{}", id), ObjectKind::Table))
                .collect(),
            Vec::new(),
        );
        connector.fail("CREATE table", 100);

        let mut config = config(CopyMode::Full);
        config.migration.workers = Some(1);
        config.migration.max_errors = 2;
        let orchestrator = MigrationOrchestrator::new(config, connector.clone());

        let result = orchestrator.run().await.unwrap();

        assert!(result.error_budget_exhausted);
        assert_eq!(result.items_failed, 5);
        assert!(!result.relationships_restored);
        assert_eq!(connector.count("CREATE table"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_hook_sees_every_pass() {
        let connector = catalog();
        let passes = Arc::new(Mutex::new(Vec::new()));
        let seen = passes.clone();
        let hook: ProgressHook = Arc::new(move |snapshot: &ProgressSnapshot| {
            seen.lock().unwrap().push(snapshot.pass.clone());
        });
        let orchestrator = MigrationOrchestrator::new(config(CopyMode::Full), connector)
            .with_progress_hook(hook);

        orchestrator.run().await.unwrap();

        let passes = passes.lock().unwrap();
        assert!(passes.iter().any(|p| p == "process-items"));
        assert!(passes.iter().any(|p| p == "restore-relationships"));
    }

    #[test]
    fn test_result_json() {
        let now = Utc::now();
        let result = MigrationResult {
            run_id: "run".into(),
            mode: CopyMode::DataOnly,
            status: "failed".into(),
            started_at: now,
            completed_at: now,
            duration_seconds: 1.5,
            items_total: 2,
            items_completed: 1,
            items_failed: 1,
            failed_items: vec![FailedItem {
                name: "table [dbo].[Orders]".into(),
                error: BLOCKED_MESSAGE.into(),
            }],
            rows_copied: 42,
            relationships_restored: false,
            error_budget_exhausted: false,
        };

        let json = result.to_json().unwrap();
        assert!(json.contains("\"mode\": \"data_only\""));
        assert!(json.contains("\"rows_copied\": 42"));
        assert!(!result.is_success());
    }
}
