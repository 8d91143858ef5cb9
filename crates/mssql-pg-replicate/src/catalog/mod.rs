//! Declarative schema catalog.
//!
//! The source system's generated per-table interfaces collapse into this
//! data-driven registry: one [`TableDescriptor`] per table, each column
//! carrying an enumerated [`SourceType`]. The catalog is loaded once at
//! startup and is read-only afterwards.

mod order;

pub use order::{build_plan, ReplicationPlan};

use crate::error::{ReplicateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Enumerated source column type.
///
/// Covers exactly the types the source schema uses; an unknown tag fails
/// catalog deserialization, which is a pre-run schema-integrity error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceType {
    SmallInt,
    Int,
    Numeric { precision: u32, scale: u32 },
    Bool,
    Uuid,
    Timestamp,
    VarText,
    FixedText,
    Binary,
}

impl SourceType {
    /// Human-readable type name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            SourceType::SmallInt => "small-int",
            SourceType::Int => "int",
            SourceType::Numeric { .. } => "numeric",
            SourceType::Bool => "bool",
            SourceType::Uuid => "uuid",
            SourceType::Timestamp => "timestamp",
            SourceType::VarText => "var-text",
            SourceType::FixedText => "fixed-text",
            SourceType::Binary => "binary",
        }
    }

    /// Whether this is a length-bounded text type.
    pub fn is_text(&self) -> bool {
        matches!(self, SourceType::VarText | SourceType::FixedText)
    }
}

/// Column metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,

    /// Source data type.
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// Whether the column allows NULL.
    #[serde(default)]
    pub nullable: bool,

    /// Maximum length in characters for text types.
    #[serde(default)]
    pub max_length: Option<u32>,
}

/// Foreign key reference to another catalog table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    /// Referencing column names in this table.
    pub columns: Vec<String>,

    /// Referenced table name.
    pub ref_table: String,
}

/// Table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name.
    pub name: String,

    /// Column definitions in source order.
    pub columns: Vec<ColumnDescriptor>,

    /// Primary key column names.
    pub primary_key: Vec<String>,

    /// Foreign key references.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyRef>,

    /// Hierarchy depth column for self-referential tables.
    ///
    /// When present, rows are read in level order (parents before children)
    /// so that in-order batch commits satisfy parent-first insertion.
    #[serde(default)]
    pub depth_column: Option<String>,
}

impl TableDescriptor {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in source order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Whether the table references itself (parent/child hierarchy).
    pub fn is_self_referential(&self) -> bool {
        self.foreign_keys.iter().any(|fk| fk.ref_table == self.name)
    }

    /// Tables this one depends on, excluding self-references.
    pub fn references(&self) -> HashSet<&str> {
        self.foreign_keys
            .iter()
            .filter(|fk| fk.ref_table != self.name)
            .map(|fk| fk.ref_table.as_str())
            .collect()
    }
}

/// The full schema catalog: every table to replicate plus the foreign-key
/// graph between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub tables: Vec<TableDescriptor>,
}

impl Catalog {
    /// Load the catalog from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse the catalog from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(yaml)
            .map_err(|e| ReplicateError::Catalog(format!("catalog parse failed: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Validate catalog integrity.
    ///
    /// Every problem found here is fatal before any write occurs.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for table in &self.tables {
            if !names.insert(table.name.as_str()) {
                return Err(ReplicateError::Catalog(format!(
                    "duplicate table name: {}",
                    table.name
                )));
            }
        }

        for table in &self.tables {
            let mut cols = HashSet::new();
            for col in &table.columns {
                if !cols.insert(col.name.as_str()) {
                    return Err(ReplicateError::Catalog(format!(
                        "{}: duplicate column name: {}",
                        table.name, col.name
                    )));
                }
                if col.source_type.is_text() && col.max_length.is_none() {
                    return Err(ReplicateError::Catalog(format!(
                        "{}.{}: text column requires max_length",
                        table.name, col.name
                    )));
                }
            }

            if table.primary_key.is_empty() {
                return Err(ReplicateError::Catalog(format!(
                    "{}: primary key required for upsert replication",
                    table.name
                )));
            }
            for pk in &table.primary_key {
                if table.column(pk).is_none() {
                    return Err(ReplicateError::Catalog(format!(
                        "{}: primary key column {} not in column list",
                        table.name, pk
                    )));
                }
            }

            for fk in &table.foreign_keys {
                if self.table(&fk.ref_table).is_none() {
                    return Err(ReplicateError::Catalog(format!(
                        "{}: foreign key references unknown table {}",
                        table.name, fk.ref_table
                    )));
                }
                for col in &fk.columns {
                    if table.column(col).is_none() {
                        return Err(ReplicateError::Catalog(format!(
                            "{}: foreign key column {} not in column list",
                            table.name, col
                        )));
                    }
                }
            }

            if let Some(depth) = &table.depth_column {
                match table.column(depth).map(|c| &c.source_type) {
                    Some(SourceType::SmallInt) | Some(SourceType::Int) => {}
                    Some(_) => {
                        return Err(ReplicateError::Catalog(format!(
                            "{}: depth column {} must be an integer type",
                            table.name, depth
                        )));
                    }
                    None => {
                        return Err(ReplicateError::Catalog(format!(
                            "{}: depth column {} not in column list",
                            table.name, depth
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
