//! Catalog identities of the objects a run copies.

use crate::error::{CopyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Object id, unique within one source catalog (`sys.objects.object_id`).
pub type ObjectId = i32;

/// Kind of a copied object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    View,
    Function,
    StoredProcedure,
}

impl ObjectKind {
    /// Map a `sys.objects.type` code to a kind.
    pub fn from_type_code(code: &str) -> Result<Self> {
        match code.trim() {
            "U" => Ok(ObjectKind::Table),
            "V" => Ok(ObjectKind::View),
            "P" => Ok(ObjectKind::StoredProcedure),
            "FN" | "TF" | "IF" => Ok(ObjectKind::Function),
            other => Err(CopyError::Config(format!(
                "Unknown SQL object type: {}",
                other
            ))),
        }
    }

    /// Lowercase name used in messages.
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::View => "view",
            ObjectKind::Function => "function",
            ObjectKind::StoredProcedure => "procedure",
        }
    }
}

/// Immutable identity of a catalog object.
///
/// Equality and hashing use the object id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlObject {
    /// Catalog object id.
    pub id: ObjectId,

    /// Schema name.
    pub schema: String,

    /// Object name.
    pub name: String,

    /// Object kind.
    pub kind: ObjectKind,
}

impl SqlObject {
    pub fn new(
        id: ObjectId,
        schema: impl Into<String>,
        name: impl Into<String>,
        kind: ObjectKind,
    ) -> Self {
        Self {
            id,
            schema: schema.into(),
            name: name.into(),
            kind,
        }
    }

    /// Bracket-quoted, schema-qualified name (`[dbo].[Orders]`).
    pub fn full_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    pub fn is_table(&self) -> bool {
        self.kind == ObjectKind::Table
    }
}

impl PartialEq for SqlObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SqlObject {}

impl Hash for SqlObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for SqlObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.full_name())
    }
}

/// `id` references `depends_on` in its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// Referencing object.
    pub id: ObjectId,

    /// Referenced object.
    pub depends_on: ObjectId,
}

impl Dependency {
    pub fn new(id: ObjectId, depends_on: ObjectId) -> Self {
        Self { id, depends_on }
    }
}

/// Quote an identifier with brackets.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Escape text for use inside an `N'...'` literal.
pub fn quote_literal(text: &str) -> String {
    format!("N'{}'", text.replace('\'', "''"))
}
