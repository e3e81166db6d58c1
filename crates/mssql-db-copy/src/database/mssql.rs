//! SQL Server implementation of the database collaborators.

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use futures::TryStreamExt;
use tiberius::{Client, ColumnData, Row, ToSql, TokenRow};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use super::ddl;
use super::metadata::{
    CheckConstraint, Column, DefaultConstraint, ForeignKey, Index, IndexColumn, ModuleDefinition,
    TableMetadata,
};
use super::{clean_up_after, Connector, Executor, Inventory, SchemaScripter};
use crate::catalog::{Dependency, ObjectKind, SqlObject};
use crate::config::{Config, ConnectionConfig, ScripterOptions};
use crate::error::{CopyError, Result};

/// Maximum string length (in bytes) for TDS bulk insert.
/// Tiberius bulk insert has a hard limit of 65535 bytes for UTF-16 encoded strings.
const BULK_INSERT_STRING_LIMIT: usize = 65535;

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: tiberius::Config,
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.config.clone();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Source and target connection pools.
pub struct MssqlConnector {
    source: Pool<TiberiusConnectionManager>,
    target: Pool<TiberiusConnectionManager>,
    scripter: ScripterOptions,
}

impl MssqlConnector {
    /// Open both pools, sized for every worker plus the orchestrator itself.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool_size = config.migration.get_workers() as u32 + 1;
        let source = build_pool(&config.source, "source", pool_size).await?;
        let target = build_pool(&config.target, "target", pool_size).await?;

        Ok(Self {
            source,
            target,
            scripter: config.scripter.clone(),
        })
    }

    async fn checkout(
        &self,
        pool: &Pool<TiberiusConnectionManager>,
        label: &str,
    ) -> Result<MssqlDatabase> {
        let conn = pool
            .get_owned()
            .await
            .map_err(|e| CopyError::pool(e, format!("getting {} connection", label)))?;

        Ok(MssqlDatabase {
            conn,
            scripter: self.scripter.clone(),
        })
    }
}

async fn build_pool(
    connection: &ConnectionConfig,
    label: &str,
    max_size: u32,
) -> Result<Pool<TiberiusConnectionManager>> {
    let manager = TiberiusConnectionManager {
        config: connection.tiberius_config()?,
    };
    let pool = Pool::builder()
        .max_size(max_size)
        .build(manager)
        .await
        .map_err(|e| CopyError::pool(e, format!("creating {} pool", label)))?;

    // Test connection
    {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| CopyError::pool(e, format!("testing {} connection", label)))?;
        conn.simple_query("SELECT 1").await?.into_row().await?;
    }

    info!(
        "Connected to {} database: {} (pool_size={})",
        label,
        connection.redacted(),
        max_size
    );

    Ok(pool)
}

#[async_trait]
impl Connector for MssqlConnector {
    type Db = MssqlDatabase;

    async fn source(&self) -> Result<MssqlDatabase> {
        self.checkout(&self.source, "source").await
    }

    async fn target(&self) -> Result<MssqlDatabase> {
        self.checkout(&self.target, "target").await
    }
}

/// One pooled connection, returned to its pool on drop.
pub struct MssqlDatabase {
    conn: PooledConnection<'static, TiberiusConnectionManager>,
    scripter: ScripterOptions,
}

fn text(row: &Row, idx: usize) -> Result<String> {
    Ok(row.try_get::<&str, _>(idx)?.unwrap_or_default().to_string())
}

fn opt_text(row: &Row, idx: usize) -> Result<Option<String>> {
    Ok(row.try_get::<&str, _>(idx)?.map(str::to_string))
}

fn int(row: &Row, idx: usize) -> Result<i32> {
    Ok(row.try_get::<i32, _>(idx)?.unwrap_or_default())
}

fn flag(row: &Row, idx: usize) -> Result<bool> {
    Ok(row.try_get::<bool, _>(idx)?.unwrap_or_default())
}

impl MssqlDatabase {
    async fn query_rows(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>> {
        let stream = self.conn.query(sql, params).await?;
        Ok(stream.into_first_result().await?)
    }

    async fn load_columns(&mut self, name: &str) -> Result<Vec<Column>> {
        let query = r#"
            SELECT
                c.name,
                t.name,
                CASE WHEN t.is_user_defined = 1 THEN SCHEMA_NAME(t.schema_id) END,
                CAST(c.max_length AS INT),
                CAST(c.precision AS INT),
                CAST(c.scale AS INT),
                c.is_nullable,
                c.is_identity,
                CAST(ic.seed_value AS NVARCHAR(40)),
                CAST(ic.increment_value AS NVARCHAR(40)),
                cc.definition,
                CAST(ISNULL(cc.is_persisted, 0) AS BIT),
                c.collation_name,
                dc.name,
                dc.definition
            FROM sys.columns c
            JOIN sys.types t ON t.user_type_id = c.user_type_id
            LEFT JOIN sys.identity_columns ic
                ON ic.object_id = c.object_id AND ic.column_id = c.column_id
            LEFT JOIN sys.computed_columns cc
                ON cc.object_id = c.object_id AND cc.column_id = c.column_id
            LEFT JOIN sys.default_constraints dc
                ON dc.parent_object_id = c.object_id AND dc.parent_column_id = c.column_id
            WHERE c.object_id = OBJECT_ID(@P1)
            ORDER BY c.column_id
        "#;

        let rows = self.query_rows(query, &[&name]).await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let default = match (opt_text(&row, 13)?, opt_text(&row, 14)?) {
                (Some(name), Some(definition)) => Some(DefaultConstraint { name, definition }),
                _ => None,
            };
            columns.push(Column {
                name: text(&row, 0)?,
                data_type: text(&row, 1)?,
                type_schema: opt_text(&row, 2)?,
                max_length: int(&row, 3)?,
                precision: int(&row, 4)?,
                scale: int(&row, 5)?,
                is_nullable: flag(&row, 6)?,
                is_identity: flag(&row, 7)?,
                identity_seed: opt_text(&row, 8)?,
                identity_increment: opt_text(&row, 9)?,
                computed_definition: opt_text(&row, 10)?,
                is_persisted: flag(&row, 11)?,
                collation: opt_text(&row, 12)?,
                default,
            });
        }

        debug!("Loaded {} columns for {}", columns.len(), name);
        Ok(columns)
    }

    async fn load_indexes(&mut self, name: &str) -> Result<Vec<Index>> {
        // One row per index column; grouped below.
        let query = r#"
            SELECT
                i.index_id,
                i.name,
                CAST(i.type AS INT),
                i.is_unique,
                i.is_primary_key,
                i.is_unique_constraint,
                i.filter_definition,
                COL_NAME(ic.object_id, ic.column_id),
                ic.is_descending_key,
                ic.is_included_column
            FROM sys.indexes i
            JOIN sys.index_columns ic
                ON ic.object_id = i.object_id AND ic.index_id = i.index_id
            WHERE i.object_id = OBJECT_ID(@P1)
              AND i.type IN (1, 2)
              AND i.is_hypothetical = 0
            ORDER BY i.index_id, ic.is_included_column, ic.key_ordinal, ic.index_column_id
        "#;

        let rows = self.query_rows(query, &[&name]).await?;
        let mut indexes: Vec<Index> = Vec::new();
        let mut current_id = None;

        for row in rows {
            let index_id = int(&row, 0)?;
            if current_id != Some(index_id) {
                current_id = Some(index_id);
                indexes.push(Index {
                    name: text(&row, 1)?,
                    is_clustered: int(&row, 2)? == 1,
                    is_unique: flag(&row, 3)?,
                    is_primary_key: flag(&row, 4)?,
                    is_unique_constraint: flag(&row, 5)?,
                    filter: opt_text(&row, 6)?,
                    ..Index::default()
                });
            }

            let Some(index) = indexes.last_mut() else {
                continue;
            };
            let column = text(&row, 7)?;
            if flag(&row, 9)? {
                index.include_cols.push(column);
            } else {
                index.columns.push(IndexColumn {
                    name: column,
                    descending: flag(&row, 8)?,
                });
            }
        }

        debug!("Loaded {} indexes for {}", indexes.len(), name);
        Ok(indexes)
    }

    async fn load_check_constraints(&mut self, name: &str) -> Result<Vec<CheckConstraint>> {
        let query = r#"
            SELECT cc.name, cc.definition
            FROM sys.check_constraints cc
            WHERE cc.parent_object_id = OBJECT_ID(@P1)
              AND cc.is_disabled = 0
            ORDER BY cc.name
        "#;

        let rows = self.query_rows(query, &[&name]).await?;
        rows.iter()
            .map(|row| {
                Ok(CheckConstraint {
                    name: text(row, 0)?,
                    definition: text(row, 1)?,
                })
            })
            .collect()
    }

    async fn load_triggers(&mut self, name: &str) -> Result<Vec<ModuleDefinition>> {
        let query = r#"
            SELECT
                SCHEMA_NAME(o.schema_id),
                o.name,
                m.definition,
                m.uses_ansi_nulls,
                m.uses_quoted_identifier,
                tr.is_disabled
            FROM sys.triggers tr
            JOIN sys.objects o ON o.object_id = tr.object_id
            JOIN sys.sql_modules m ON m.object_id = tr.object_id
            WHERE tr.parent_id = OBJECT_ID(@P1)
            ORDER BY o.name
        "#;

        let rows = self.query_rows(query, &[&name]).await?;
        rows.iter()
            .map(|row| {
                Ok(ModuleDefinition {
                    schema: text(row, 0)?,
                    name: text(row, 1)?,
                    definition: opt_text(row, 2)?,
                    uses_ansi_nulls: flag(row, 3)?,
                    uses_quoted_identifier: flag(row, 4)?,
                    is_disabled: flag(row, 5)?,
                })
            })
            .collect()
    }

    async fn load_module(&mut self, object: &SqlObject) -> Result<ModuleDefinition> {
        let query = r#"
            SELECT m.definition, m.uses_ansi_nulls, m.uses_quoted_identifier
            FROM sys.sql_modules m
            WHERE m.object_id = OBJECT_ID(@P1)
        "#;

        let name = object.full_name();
        let rows = self.query_rows(query, &[&name]).await?;
        let row = rows
            .first()
            .ok_or_else(|| CopyError::scripting(object, "object can't be found"))?;

        Ok(ModuleDefinition {
            schema: object.schema.clone(),
            name: object.name.clone(),
            definition: opt_text(row, 0)?,
            uses_ansi_nulls: flag(row, 1)?,
            uses_quoted_identifier: flag(row, 2)?,
            is_disabled: false,
        })
    }

    async fn load_foreign_keys(&mut self, name: &str) -> Result<Vec<ForeignKey>> {
        // One row per key column; grouped below.
        let query = r#"
            SELECT
                fk.object_id,
                fk.name,
                COL_NAME(fkc.parent_object_id, fkc.parent_column_id),
                SCHEMA_NAME(rt.schema_id),
                rt.name,
                COL_NAME(fkc.referenced_object_id, fkc.referenced_column_id),
                fk.delete_referential_action_desc,
                fk.update_referential_action_desc,
                fk.is_disabled
            FROM sys.foreign_keys fk
            JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id
            JOIN sys.objects rt ON rt.object_id = fk.referenced_object_id
            WHERE fk.parent_object_id = OBJECT_ID(@P1)
            ORDER BY fk.name, fkc.constraint_column_id
        "#;

        let rows = self.query_rows(query, &[&name]).await?;
        let mut foreign_keys: Vec<ForeignKey> = Vec::new();
        let mut current_id = None;

        for row in rows {
            let fk_id = int(&row, 0)?;
            if current_id != Some(fk_id) {
                current_id = Some(fk_id);
                foreign_keys.push(ForeignKey {
                    name: text(&row, 1)?,
                    ref_schema: text(&row, 3)?,
                    ref_table: text(&row, 4)?,
                    on_delete: text(&row, 6)?,
                    on_update: text(&row, 7)?,
                    is_disabled: flag(&row, 8)?,
                    ..ForeignKey::default()
                });
            }
            if let Some(fk) = foreign_keys.last_mut() {
                fk.columns.push(text(&row, 2)?);
                fk.ref_columns.push(text(&row, 5)?);
            }
        }

        debug!("Loaded {} foreign keys for {}", foreign_keys.len(), name);
        Ok(foreign_keys)
    }

    /// Columns and indexes of a table, plus checks and triggers when `full`.
    async fn table_metadata(&mut self, table: &SqlObject, full: bool) -> Result<TableMetadata> {
        let name = table.full_name();
        let columns = self.load_columns(&name).await?;
        if columns.is_empty() {
            return Err(CopyError::scripting(table, "table can't be found"));
        }

        let indexes = self.load_indexes(&name).await?;
        let (check_constraints, triggers) = if full {
            let checks = self.load_check_constraints(&name).await?;
            let triggers = if self.scripter.triggers {
                self.load_triggers(&name).await?
            } else {
                Vec::new()
            };
            (checks, triggers)
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(TableMetadata {
            schema: table.schema.clone(),
            name: table.name.clone(),
            columns,
            indexes,
            check_constraints,
            triggers,
        })
    }
}

#[async_trait]
impl Inventory for MssqlDatabase {
    async fn list_objects(&mut self, tables_only: bool) -> Result<Vec<SqlObject>> {
        let filter = if tables_only {
            "AND type = 'U'"
        } else {
            "AND type IN ('U', 'V', 'FN', 'TF', 'IF', 'P')"
        };
        let query = format!(
            "SELECT object_id, SCHEMA_NAME(schema_id), name, type FROM sys.objects \
             WHERE is_ms_shipped = 0 {} ORDER BY object_id",
            filter
        );

        let rows = self.query_rows(&query, &[]).await?;
        let objects = rows
            .iter()
            .map(|row| {
                Ok(SqlObject::new(
                    int(row, 0)?,
                    text(row, 1)?,
                    text(row, 2)?,
                    ObjectKind::from_type_code(&text(row, 3)?)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Listed {} objects (tables_only={})", objects.len(), tables_only);
        Ok(objects)
    }

    async fn list_dependencies(&mut self) -> Result<Vec<Dependency>> {
        // Direct 2-cycles are excluded; longer cycles are left to the scheduler.
        let query = r#"
            SELECT DISTINCT d.referencing_id, d.referenced_id
            FROM sys.sql_expression_dependencies d
            JOIN sys.objects s ON s.object_id = d.referencing_id
            JOIN sys.objects t ON t.object_id = d.referenced_id
            WHERE NOT EXISTS (
                SELECT 1 FROM sys.sql_expression_dependencies d2
                WHERE d2.referencing_id = d.referenced_id
                  AND d2.referenced_id = d.referencing_id
            )
        "#;

        let rows = self.query_rows(query, &[]).await?;
        rows.iter()
            .map(|row| Ok(Dependency::new(int(row, 0)?, int(row, 1)?)))
            .collect()
    }

    async fn is_table_empty(&mut self, table: &SqlObject) -> Result<bool> {
        let query = format!("SELECT TOP 1 1 FROM {}", table.full_name());
        let row = self.conn.simple_query(query).await?.into_row().await?;
        Ok(row.is_none())
    }
}

#[async_trait]
impl SchemaScripter for MssqlDatabase {
    async fn script_schemas(&mut self) -> Result<Vec<String>> {
        let query = "SELECT name FROM sys.schemas WHERE schema_id BETWEEN 5 AND 16383 ORDER BY name";
        let rows = self.query_rows(query, &[]).await?;
        rows.iter()
            .map(|row| Ok(ddl::create_schema(&text(row, 0)?, &self.scripter)))
            .collect()
    }

    async fn script_object(
        &mut self,
        object: &SqlObject,
        include_indexes: bool,
    ) -> Result<Vec<String>> {
        match object.kind {
            ObjectKind::Table => {
                let table = self.table_metadata(object, true).await?;
                Ok(ddl::create_table(&table, include_indexes, &self.scripter))
            }
            ObjectKind::View | ObjectKind::Function | ObjectKind::StoredProcedure => {
                let module = self.load_module(object).await?;
                let mut statements = ddl::create_module(&module, &self.scripter)?;

                // INSTEAD OF triggers on views
                if object.kind == ObjectKind::View && self.scripter.triggers {
                    let name = object.full_name();
                    for trigger in self.load_triggers(&name).await? {
                        statements.extend(ddl::create_trigger(&name, &trigger, &self.scripter)?);
                    }
                }
                Ok(statements)
            }
        }
    }

    async fn script_foreign_keys(&mut self, table: &SqlObject) -> Result<Vec<String>> {
        let fks = self.load_foreign_keys(&table.full_name()).await?;
        Ok(fks
            .iter()
            .flat_map(|fk| ddl::create_foreign_key(&table.schema, &table.name, fk, &self.scripter))
            .collect())
    }

    async fn script_drop_foreign_keys(&mut self, table: &SqlObject) -> Result<Vec<String>> {
        let fks = self.load_foreign_keys(&table.full_name()).await?;
        Ok(fks
            .iter()
            .map(|fk| ddl::drop_foreign_key(&table.schema, &table.name, fk, &self.scripter))
            .collect())
    }

    async fn script_indexes(&mut self, table: &SqlObject) -> Result<Vec<String>> {
        let metadata = self.table_metadata(table, false).await?;
        Ok(ddl::create_indexes(&metadata, &self.scripter))
    }

    async fn script_drop_indexes(&mut self, table: &SqlObject) -> Result<Vec<String>> {
        let metadata = self.table_metadata(table, false).await?;
        Ok(ddl::drop_indexes(&metadata, &self.scripter))
    }

    async fn script_select(&mut self, table: &SqlObject) -> Result<String> {
        let metadata = self.table_metadata(table, false).await?;
        ddl::select_statement(&metadata)
    }
}

fn check_bulk_value(table: &SqlObject, value: &ColumnData<'_>) -> Result<()> {
    if let ColumnData::String(Some(s)) = value {
        // UTF-16 byte length: 2 per BMP character, 4 per surrogate pair
        let utf16_len: usize = s.chars().map(|c| c.len_utf16() * 2).sum();
        if utf16_len > BULK_INSERT_STRING_LIMIT {
            return Err(CopyError::statement(
                table,
                format!(
                    "string value of {} bytes exceeds the bulk insert limit of {} bytes",
                    utf16_len, BULK_INSERT_STRING_LIMIT
                ),
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl Executor for MssqlDatabase {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        // Batches (not sp_executesql) so SET options stay on the session.
        self.conn.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn bulk_copy(
        &mut self,
        source: &mut Self,
        select: &str,
        table: &SqlObject,
    ) -> Result<u64> {
        let mut metadata = self.table_metadata(table, false).await?;
        // Whatever fires on the target, not what the scripter would create.
        metadata.triggers = self.load_triggers(&table.full_name()).await?;
        let cleanup = ddl::staging_cleanup(&metadata);

        self.execute(&ddl::create_staging(&metadata)).await?;

        let streamed = self.stream_into_staging(source, select, table).await;
        let rows = clean_up_after(self, streamed, &cleanup).await?;

        let loaded = self.execute(&ddl::load_from_staging(&metadata)).await;
        clean_up_after(self, loaded, &cleanup).await?;

        debug!("Copied {} rows into {}", rows, table);
        Ok(rows)
    }
}

impl MssqlDatabase {
    async fn stream_into_staging(
        &mut self,
        source: &mut Self,
        select: &str,
        table: &SqlObject,
    ) -> Result<u64> {
        let mut stream = source.conn.simple_query(select).await?.into_row_stream();
        let mut load = self.conn.bulk_insert(ddl::STAGING_TABLE).await?;
        let mut rows = 0u64;

        while let Some(row) = stream.try_next().await? {
            let mut token_row = TokenRow::new();
            for value in row {
                check_bulk_value(table, &value)?;
                token_row.push(value);
            }
            load.send(token_row).await?;
            rows += 1;
        }

        load.finalize().await?;
        Ok(rows)
    }
}
