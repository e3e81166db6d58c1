//! Per-item work of each migration pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::config::CopyMode;
use crate::database::{Connector, Executor, Inventory, SchemaScripter};
use crate::error::{CopyError, Result};
use crate::runlog::ItemLog;
use crate::scheduler::{ItemAction, ItemContext, ItemStatus, MigrationItem};

/// Run each statement as its own batch, tracing it when `log_sql` is set.
pub(crate) async fn run_script<D: Executor>(
    db: &mut D,
    script: &[String],
    log: &mut ItemLog,
    log_sql: bool,
) -> Result<()> {
    for sql in script {
        let started = Instant::now();
        if let Err(e) = db.execute(sql).await {
            if log_sql {
                log.line(sql.trim());
            }
            return Err(e);
        }
        if log_sql {
            log.statement(sql, started.elapsed());
        }
    }
    Ok(())
}

fn transition(item: &mut MigrationItem, ctx: &mut ItemContext<'_>, next: ItemStatus) {
    debug!("{}: {:?} -> {:?}", item, item.status, next);
    ctx.log().line(format!("{}: {:?} -> {:?}", item, item.status, next));
    item.advance(next);
}

/// Fails tables of the target that already hold rows.
pub(crate) struct ValidateTarget<C> {
    pub connector: Arc<C>,
}

#[async_trait]
impl<C: Connector> ItemAction for ValidateTarget<C> {
    async fn execute(&self, item: &mut MigrationItem, ctx: &mut ItemContext<'_>) -> Result<()> {
        let mut target = self.connector.target().await?;
        if !target.is_table_empty(&item.object).await? {
            return Err(CopyError::Precondition(format!("{} has data", item.object)));
        }
        ctx.log().line(format!("{} is empty.", item));
        Ok(())
    }
}

/// Which foreign key script a [`Relationships`] pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelationshipStep {
    Drop,
    Restore,
}

/// Drops or re-creates the foreign keys of a table.
pub(crate) struct Relationships<C> {
    pub connector: Arc<C>,
    pub step: RelationshipStep,
    pub log_sql: bool,
}

#[async_trait]
impl<C: Connector> ItemAction for Relationships<C> {
    async fn execute(&self, item: &mut MigrationItem, ctx: &mut ItemContext<'_>) -> Result<()> {
        let mut source = self.connector.source().await?;
        let mut target = self.connector.target().await?;

        let script = match self.step {
            RelationshipStep::Drop => {
                ctx.log().line(format!("Drop foreign keys on {}.", item));
                source.script_drop_foreign_keys(&item.object).await?
            }
            RelationshipStep::Restore => {
                ctx.log().line(format!("Generate foreign keys on {}.", item));
                source.script_foreign_keys(&item.object).await?
            }
        };

        run_script(&mut target, &script, ctx.log(), self.log_sql).await
    }
}

/// Moves an item through schema, data and index phases.
///
/// Every phase is entered from the item's current status, so a retried item
/// continues where its previous attempt stopped.
pub(crate) struct ProcessItem<C> {
    pub connector: Arc<C>,
    pub mode: CopyMode,
    pub log_sql: bool,
    pub rows_copied: Arc<AtomicU64>,
}

#[async_trait]
impl<C: Connector> ItemAction for ProcessItem<C> {
    async fn execute(&self, item: &mut MigrationItem, ctx: &mut ItemContext<'_>) -> Result<()> {
        let mut source = self.connector.source().await?;
        let mut target = self.connector.target().await?;

        if item.status == ItemStatus::NotStarted {
            let skip_data = !self.mode.copies_data()
                || !item.is_table()
                || source.is_table_empty(&item.object).await?;

            if self.mode.creates_schema() {
                ctx.log().line(format!("Generate schema for {}.", item));
                let script = source.script_object(&item.object, skip_data).await?;
                run_script(&mut target, &script, ctx.log(), self.log_sql).await?;

                let next = if skip_data {
                    ItemStatus::Completed
                } else {
                    ItemStatus::SchemaMigrated
                };
                transition(item, ctx, next);

                // Dependents only need the schema to exist.
                let released = ctx.release_dependents(item);
                if released > 0 {
                    ctx.log()
                        .line(format!("{} released {} dependent items.", item, released));
                }
            } else if skip_data {
                ctx.log().line(format!("{} is empty.", item));
                transition(item, ctx, ItemStatus::Completed);
            } else {
                ctx.log().line(format!("Drop indexes on {}.", item));
                let script = source.script_drop_indexes(&item.object).await?;
                run_script(&mut target, &script, ctx.log(), self.log_sql).await?;
                transition(item, ctx, ItemStatus::SchemaMigrated);
            }
        }

        if item.status == ItemStatus::SchemaMigrated {
            ctx.log().line(format!("Copy data into {}.", item));
            let select = target.script_select(&item.object).await?;

            let started = Instant::now();
            let rows = target.bulk_copy(&mut source, &select, &item.object).await?;
            if self.log_sql {
                ctx.log().statement(&select, started.elapsed());
            }
            ctx.log().line(format!("{} rows copied into {}.", rows, item));

            self.rows_copied.fetch_add(rows, Ordering::Relaxed);
            transition(item, ctx, ItemStatus::DataMigrated);
        }

        if item.status == ItemStatus::DataMigrated {
            ctx.log().line(format!("Generate indexes on {}.", item));
            let script = source.script_indexes(&item.object).await?;
            run_script(&mut target, &script, ctx.log(), self.log_sql).await?;
            transition(item, ctx, ItemStatus::Completed);
        }

        Ok(())
    }
}
