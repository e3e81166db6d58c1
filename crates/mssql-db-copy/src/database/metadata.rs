//! Table and module metadata read from the SQL Server catalog views.

use serde::{Deserialize, Serialize};

/// Table metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Column definitions in `column_id` order.
    pub columns: Vec<Column>,

    /// Rowstore indexes, primary key and unique constraints included.
    pub indexes: Vec<Index>,

    /// Enabled check constraints.
    pub check_constraints: Vec<CheckConstraint>,

    /// Triggers defined on the table.
    pub triggers: Vec<ModuleDefinition>,
}

impl TableMetadata {
    /// Columns whose values can be read and bulk inserted.
    ///
    /// Computed and rowversion columns are generated by the server.
    pub fn copyable_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_copyable())
    }

    pub fn has_identity(&self) -> bool {
        self.columns.iter().any(|c| c.is_identity)
    }

    /// The clustered index or clustered primary key, if any.
    pub fn clustered_index(&self) -> Option<&Index> {
        self.indexes.iter().find(|i| i.is_clustered)
    }

    /// Indexes dropped before and rebuilt after a bulk load.
    pub fn nonclustered_indexes(&self) -> impl Iterator<Item = &Index> {
        self.indexes.iter().filter(|i| !i.is_clustered)
    }
}

/// Column metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Type name (e.g. "int", "nvarchar", "datetime2").
    pub data_type: String,

    /// Schema of a user-defined alias type; `None` for system types.
    pub type_schema: Option<String>,

    /// Maximum length in bytes (-1 for max).
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric or fractional-seconds scale.
    pub scale: i32,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Whether the column is an identity column.
    pub is_identity: bool,

    /// Identity seed, as text to cover decimal identities.
    pub identity_seed: Option<String>,

    /// Identity increment.
    pub identity_increment: Option<String>,

    /// Expression of a computed column.
    pub computed_definition: Option<String>,

    /// Whether a computed column is persisted.
    pub is_persisted: bool,

    /// Column collation for character types.
    pub collation: Option<String>,

    /// Default constraint bound to the column.
    pub default: Option<DefaultConstraint>,
}

impl Column {
    pub fn is_computed(&self) -> bool {
        self.computed_definition.is_some()
    }

    pub fn is_rowversion(&self) -> bool {
        self.type_schema.is_none()
            && matches!(
                self.data_type.to_lowercase().as_str(),
                "timestamp" | "rowversion"
            )
    }

    pub fn is_copyable(&self) -> bool {
        !self.is_computed() && !self.is_rowversion()
    }
}

/// Default constraint metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConstraint {
    /// Constraint name.
    pub name: String,

    /// Default expression as stored, parentheses included.
    pub definition: String,
}

/// Key column of an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    pub descending: bool,
}

/// Index metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,

    /// Key columns in key order.
    pub columns: Vec<IndexColumn>,

    /// Included columns (non-key).
    pub include_cols: Vec<String>,

    /// Whether the index is unique.
    pub is_unique: bool,

    /// Whether the index is clustered.
    pub is_clustered: bool,

    /// Index backs the primary key.
    pub is_primary_key: bool,

    /// Index backs a UNIQUE constraint.
    pub is_unique_constraint: bool,

    /// Filter predicate of a filtered index.
    pub filter: Option<String>,
}

impl Index {
    /// Whether the index is created through ALTER TABLE ... ADD CONSTRAINT.
    pub fn is_constraint(&self) -> bool {
        self.is_primary_key || self.is_unique_constraint
    }
}

/// Foreign key metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Referencing column names.
    pub columns: Vec<String>,

    /// Referenced schema name.
    pub ref_schema: String,

    /// Referenced table name.
    pub ref_table: String,

    /// Referenced column names.
    pub ref_columns: Vec<String>,

    /// ON DELETE action (`NO_ACTION`, `CASCADE`, `SET_NULL`, `SET_DEFAULT`).
    pub on_delete: String,

    /// ON UPDATE action.
    pub on_update: String,

    /// Constraint is disabled on the source.
    pub is_disabled: bool,
}

/// Check constraint metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConstraint {
    /// Constraint name.
    pub name: String,

    /// Constraint definition (SQL expression).
    pub definition: String,
}

/// Definition of a view, function, procedure or trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub schema: String,
    pub name: String,

    /// Module text; `None` when the module is encrypted.
    pub definition: Option<String>,

    pub uses_ansi_nulls: bool,
    pub uses_quoted_identifier: bool,

    /// Trigger is disabled (triggers only).
    pub is_disabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str) -> Column {
        Column {
            name: name.into(),
            data_type: data_type.into(),
            ..Column::default()
        }
    }

    #[test]
    fn test_copyable_columns_skip_generated() {
        let mut total = column("Total", "money");
        total.computed_definition = Some("([Price]*[Qty])".into());

        let table = TableMetadata {
            schema: "dbo".into(),
            name: "Orders".into(),
            columns: vec![
                column("Id", "int"),
                total,
                column("Version", "timestamp"),
                column("Note", "nvarchar"),
            ],
            ..TableMetadata::default()
        };

        let names: Vec<_> = table.copyable_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Id", "Note"]);
    }

    #[test]
    fn test_user_type_named_timestamp_is_copyable() {
        let mut col = column("When", "timestamp");
        col.type_schema = Some("app".into());
        assert!(col.is_copyable());
    }

    #[test]
    fn test_clustered_and_nonclustered_split() {
        let table = TableMetadata {
            indexes: vec![
                Index {
                    name: "PK_Orders".into(),
                    is_clustered: true,
                    is_primary_key: true,
                    ..Index::default()
                },
                Index {
                    name: "IX_Orders_Date".into(),
                    ..Index::default()
                },
            ],
            ..TableMetadata::default()
        };

        assert_eq!(table.clustered_index().unwrap().name, "PK_Orders");
        let names: Vec<_> = table.nonclustered_indexes().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["IX_Orders_Date"]);
    }
}
