//! T-SQL text generation from catalog metadata.
//!
//! Everything here is pure: statements are built from the structs in
//! [`super::metadata`] and the scripting options, one statement per batch.
//! Object names are always schema-qualified and bracket-quoted.

use super::metadata::{
    CheckConstraint, Column, ForeignKey, Index, IndexColumn, ModuleDefinition, TableMetadata,
};
use crate::catalog::{quote_ident, quote_literal};
use crate::config::ScripterOptions;
use crate::error::{CopyError, Result};

/// Session temp table used as the bulk load destination.
pub const STAGING_TABLE: &str = "#mssql_db_copy_stage";

/// `[schema].[name]`
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

fn guard(condition: String, body: String, opts: &ScripterOptions) -> String {
    if opts.include_if_not_exists {
        format!("{}\n{}", condition, body)
    } else {
        body
    }
}

/// `CREATE SCHEMA` wrapped in `EXEC` so it can follow an `IF`.
pub fn create_schema(name: &str, opts: &ScripterOptions) -> String {
    let body = format!(
        "EXEC({})",
        quote_literal(&format!("CREATE SCHEMA {}", quote_ident(name)))
    );
    guard(
        format!(
            "IF NOT EXISTS (SELECT * FROM sys.schemas WHERE name = {})",
            quote_literal(name)
        ),
        body,
        opts,
    )
}

/// Format a column type with its length, precision or scale.
pub fn format_type(column: &Column) -> String {
    if let Some(schema) = &column.type_schema {
        return qualified(schema, &column.data_type);
    }

    let data_type = column.data_type.as_str();
    let lower = data_type.to_lowercase();
    match lower.as_str() {
        // Float carries its mantissa bits; 53 is the default
        "float" => {
            if column.precision > 0 && column.precision != 53 {
                format!("float({})", column.precision)
            } else {
                "float".to_string()
            }
        }

        "decimal" | "numeric" => {
            if column.precision > 0 {
                format!("{}({}, {})", lower, column.precision, column.scale)
            } else {
                format!("{}(18, 0)", lower)
            }
        }

        // Always explicit: a bare datetime2 means datetime2(7)
        "datetime2" | "time" | "datetimeoffset" => format!("{}({})", lower, column.scale),

        "char" | "varchar" | "binary" | "varbinary" => {
            if column.max_length == -1 {
                format!("{}(max)", lower)
            } else {
                format!("{}({})", lower, column.max_length.max(1))
            }
        }

        // max_length is in bytes, two per character
        "nchar" | "nvarchar" => {
            if column.max_length == -1 {
                format!("{}(max)", lower)
            } else {
                format!("{}({})", lower, (column.max_length / 2).max(1))
            }
        }

        _ => lower,
    }
}

fn has_collation(column: &Column) -> bool {
    matches!(
        column.data_type.to_lowercase().as_str(),
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext"
    )
}

fn column_definition(column: &Column, opts: &ScripterOptions) -> String {
    let name = quote_ident(&column.name);

    if let Some(expression) = &column.computed_definition {
        let persisted = if column.is_persisted { " PERSISTED" } else { "" };
        return format!("{} AS {}{}", name, expression, persisted);
    }

    let mut def = format!("{} {}", name, format_type(column));

    if !opts.no_collation && has_collation(column) {
        if let Some(collation) = &column.collation {
            def.push_str(&format!(" COLLATE {}", collation));
        }
    }

    if column.is_identity && !opts.no_identities {
        def.push_str(&format!(
            " IDENTITY({}, {})",
            column.identity_seed.as_deref().unwrap_or("1"),
            column.identity_increment.as_deref().unwrap_or("1")
        ));
    }

    def.push_str(if column.is_nullable { " NULL" } else { " NOT NULL" });

    if opts.dri_defaults {
        if let Some(default) = &column.default {
            def.push_str(&format!(
                " CONSTRAINT {} DEFAULT {}",
                quote_ident(&default.name),
                default.definition
            ));
        }
    }

    def
}

fn key_list(columns: &[IndexColumn]) -> String {
    columns
        .iter()
        .map(|c| {
            format!(
                "{} {}",
                quote_ident(&c.name),
                if c.descending { "DESC" } else { "ASC" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn name_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn clustering(index: &Index) -> &'static str {
    if index.is_clustered {
        "CLUSTERED"
    } else {
        "NONCLUSTERED"
    }
}

fn constraint_clause(index: &Index) -> String {
    let kind = if index.is_primary_key {
        "PRIMARY KEY"
    } else {
        "UNIQUE"
    };
    format!(
        "CONSTRAINT {} {} {} ({})",
        quote_ident(&index.name),
        kind,
        clustering(index),
        key_list(&index.columns)
    )
}

fn check_clause(check: &CheckConstraint) -> String {
    format!(
        "CONSTRAINT {} CHECK {}",
        quote_ident(&check.name),
        check.definition
    )
}

/// Statements creating a table.
///
/// The clustered index (or clustered key constraint) is always created with
/// the table; non-clustered indexes only when `include_indexes` is set.
pub fn create_table(
    table: &TableMetadata,
    include_indexes: bool,
    opts: &ScripterOptions,
) -> Vec<String> {
    let name = qualified(&table.schema, &table.name);

    let mut definitions: Vec<String> = table
        .columns
        .iter()
        .map(|c| column_definition(c, opts))
        .collect();

    if let Some(index) = table.clustered_index().filter(|i| i.is_constraint()) {
        definitions.push(constraint_clause(index));
    }

    if opts.dri_checks {
        definitions.extend(table.check_constraints.iter().map(check_clause));
    }

    let create = format!(
        "CREATE TABLE {} (\n    {}\n)",
        name,
        definitions.join(",\n    ")
    );

    let mut statements = vec![guard(
        format!("IF OBJECT_ID({}, N'U') IS NULL", quote_literal(&name)),
        create,
        opts,
    )];

    if let Some(index) = table.clustered_index().filter(|i| !i.is_constraint()) {
        statements.push(create_index(table, index, opts));
    }

    if include_indexes {
        statements.extend(create_indexes(table, opts));
    }

    if opts.triggers {
        for trigger in &table.triggers {
            // Encrypted triggers cannot be scripted; the table itself still is.
            if let Ok(trigger_statements) = create_trigger(&name, trigger, opts) {
                statements.extend(trigger_statements);
            }
        }
    }

    statements
}

fn index_guard(table_name: &str, index: &Index, exists: bool) -> String {
    format!(
        "IF {}EXISTS (SELECT * FROM sys.indexes WHERE object_id = OBJECT_ID({}) AND name = {})",
        if exists { "" } else { "NOT " },
        quote_literal(table_name),
        quote_literal(&index.name)
    )
}

/// Statement creating one index or key constraint on an existing table.
pub fn create_index(table: &TableMetadata, index: &Index, opts: &ScripterOptions) -> String {
    let name = qualified(&table.schema, &table.name);

    let body = if index.is_constraint() {
        format!("ALTER TABLE {} ADD {}", name, constraint_clause(index))
    } else {
        let mut sql = format!(
            "CREATE {}{} INDEX {} ON {} ({})",
            if index.is_unique { "UNIQUE " } else { "" },
            clustering(index),
            quote_ident(&index.name),
            name,
            key_list(&index.columns)
        );
        if !index.include_cols.is_empty() {
            sql.push_str(&format!(" INCLUDE ({})", name_list(&index.include_cols)));
        }
        if let Some(filter) = &index.filter {
            sql.push_str(&format!(" WHERE {}", filter));
        }
        sql
    };

    guard(index_guard(&name, index, false), body, opts)
}

/// Statement dropping one index or key constraint.
pub fn drop_index(table: &TableMetadata, index: &Index, opts: &ScripterOptions) -> String {
    let name = qualified(&table.schema, &table.name);

    let body = if index.is_constraint() {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            name,
            quote_ident(&index.name)
        )
    } else {
        format!("DROP INDEX {} ON {}", quote_ident(&index.name), name)
    };

    guard(index_guard(&name, index, true), body, opts)
}

/// Statements creating every non-clustered index of the table.
pub fn create_indexes(table: &TableMetadata, opts: &ScripterOptions) -> Vec<String> {
    table
        .nonclustered_indexes()
        .map(|i| create_index(table, i, opts))
        .collect()
}

/// Statements dropping every non-clustered index of the table.
pub fn drop_indexes(table: &TableMetadata, opts: &ScripterOptions) -> Vec<String> {
    table
        .nonclustered_indexes()
        .map(|i| drop_index(table, i, opts))
        .collect()
}

fn fk_guard(schema: &str, table_name: &str, fk: &ForeignKey, exists: bool) -> String {
    format!(
        "IF {}EXISTS (SELECT * FROM sys.foreign_keys WHERE object_id = OBJECT_ID({}) AND parent_object_id = OBJECT_ID({}))",
        if exists { "" } else { "NOT " },
        quote_literal(&qualified(schema, &fk.name)),
        quote_literal(table_name)
    )
}

fn referential_action(clause: &str, action: &str) -> String {
    match action {
        "" | "NO_ACTION" => String::new(),
        other => format!(" {} {}", clause, other.replace('_', " ")),
    }
}

/// Statements creating a foreign key on `[schema].[table]`.
pub fn create_foreign_key(
    schema: &str,
    table: &str,
    fk: &ForeignKey,
    opts: &ScripterOptions,
) -> Vec<String> {
    let name = qualified(schema, table);
    let check = if opts.dri_with_no_check {
        "NOCHECK"
    } else {
        "CHECK"
    };

    let body = format!(
        "ALTER TABLE {} WITH {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}){}{}",
        name,
        check,
        quote_ident(&fk.name),
        name_list(&fk.columns),
        qualified(&fk.ref_schema, &fk.ref_table),
        name_list(&fk.ref_columns),
        referential_action("ON DELETE", &fk.on_delete),
        referential_action("ON UPDATE", &fk.on_update)
    );

    let mut statements = vec![guard(fk_guard(schema, &name, fk, false), body, opts)];
    if fk.is_disabled {
        statements.push(format!(
            "ALTER TABLE {} NOCHECK CONSTRAINT {}",
            name,
            quote_ident(&fk.name)
        ));
    }
    statements
}

/// Statement dropping a foreign key from `[schema].[table]`.
pub fn drop_foreign_key(
    schema: &str,
    table: &str,
    fk: &ForeignKey,
    opts: &ScripterOptions,
) -> String {
    let name = qualified(schema, table);
    let body = format!(
        "ALTER TABLE {} DROP CONSTRAINT {}",
        name,
        quote_ident(&fk.name)
    );
    guard(fk_guard(schema, &name, fk, true), body, opts)
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "ON"
    } else {
        "OFF"
    }
}

/// Statements creating a view, function or procedure from its definition.
pub fn create_module(module: &ModuleDefinition, opts: &ScripterOptions) -> Result<Vec<String>> {
    let name = qualified(&module.schema, &module.name);
    let definition = module
        .definition
        .as_deref()
        .ok_or_else(|| CopyError::scripting(&name, "module is encrypted"))?;

    Ok(vec![
        format!("SET ANSI_NULLS {}", on_off(module.uses_ansi_nulls)),
        format!(
            "SET QUOTED_IDENTIFIER {}",
            on_off(module.uses_quoted_identifier)
        ),
        guard(
            format!("IF OBJECT_ID({}) IS NULL", quote_literal(&name)),
            format!("EXEC({})", quote_literal(definition.trim())),
            opts,
        ),
    ])
}

/// Statements creating a trigger on `parent` (already qualified).
pub fn create_trigger(
    parent: &str,
    trigger: &ModuleDefinition,
    opts: &ScripterOptions,
) -> Result<Vec<String>> {
    let mut statements = create_module(trigger, opts)?;
    if trigger.is_disabled {
        statements.push(format!(
            "DISABLE TRIGGER {} ON {}",
            qualified(&trigger.schema, &trigger.name),
            parent
        ));
    }
    Ok(statements)
}

fn select_column(column: &Column) -> String {
    let name = quote_ident(&column.name);
    match &column.collation {
        Some(collation) if has_collation(column) => {
            format!("{} COLLATE {} AS {}", name, collation, name)
        }
        _ => name,
    }
}

/// SELECT over the copyable columns, ordered by the clustered key.
pub fn select_statement(table: &TableMetadata) -> Result<String> {
    let name = qualified(&table.schema, &table.name);

    if table.columns.is_empty() {
        return Err(CopyError::scripting(&name, "table can't be found"));
    }

    let columns: Vec<String> = table.copyable_columns().map(select_column).collect();
    if columns.is_empty() {
        return Err(CopyError::scripting(&name, "table has no copyable columns"));
    }

    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), name);
    if let Some(index) = table.clustered_index() {
        if !index.columns.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", key_list(&index.columns)));
        }
    }
    Ok(sql)
}

fn copy_column_list(table: &TableMetadata) -> String {
    table
        .copyable_columns()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Batch creating an empty staging copy of the table's copyable columns.
///
/// `SELECT ... INTO` over a UNION does not carry the identity property, so
/// the staging table accepts explicit identity values from a bulk load.
pub fn create_staging(table: &TableMetadata) -> String {
    let name = qualified(&table.schema, &table.name);
    let columns = copy_column_list(table);
    format!(
        "IF OBJECT_ID(N'tempdb..{stage}') IS NOT NULL DROP TABLE {stage};\n\
         SELECT TOP 0 {cols} INTO {stage} FROM {name} UNION ALL SELECT TOP 0 {cols} FROM {name};",
        stage = STAGING_TABLE,
        cols = columns,
        name = name
    )
}

fn enabled_triggers(table: &TableMetadata) -> impl Iterator<Item = String> + '_ {
    table
        .triggers
        .iter()
        .filter(|t| !t.is_disabled)
        .map(|t| qualified(&t.schema, &t.name))
}

/// Batch undoing the session and table state of a load: re-enables the
/// triggers the load disabled, turns `IDENTITY_INSERT` off and drops the
/// staging table. Safe to run when the load never started.
pub fn staging_cleanup(table: &TableMetadata) -> String {
    let name = qualified(&table.schema, &table.name);
    let mut statements: Vec<String> = enabled_triggers(table)
        .map(|trigger| format!("ENABLE TRIGGER {} ON {};", trigger, name))
        .collect();
    if table.has_identity() {
        statements.push(format!("SET IDENTITY_INSERT {} OFF;", name));
    }
    statements.push(format!(
        "IF OBJECT_ID(N'tempdb..{stage}') IS NOT NULL DROP TABLE {stage};",
        stage = STAGING_TABLE
    ));
    statements.join("\n")
}

/// Batch moving staged rows into the table, keeping identity values.
///
/// Enabled triggers are switched off for the insert so copied rows arrive
/// unchanged. The cleanup runs on both the success and the error path.
pub fn load_from_staging(table: &TableMetadata) -> String {
    let name = qualified(&table.schema, &table.name);
    let columns = copy_column_list(table);

    let mut statements = Vec::new();
    if table.has_identity() {
        statements.push(format!("SET IDENTITY_INSERT {} ON;", name));
    }
    statements.extend(
        enabled_triggers(table).map(|trigger| format!("DISABLE TRIGGER {} ON {};", trigger, name)),
    );

    let cleanup = staging_cleanup(table);
    statements.push(format!(
        "BEGIN TRY\n\
         INSERT INTO {name} WITH (TABLOCK) ({cols}) SELECT {cols} FROM {stage};\n\
         END TRY\n\
         BEGIN CATCH\n\
         {cleanup}\n\
         THROW;\n\
         END CATCH;",
        name = name,
        cols = columns,
        stage = STAGING_TABLE,
        cleanup = cleanup
    ));
    statements.push(cleanup);

    statements.join("\n")
}
