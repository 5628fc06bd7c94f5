//! Schema Catalog - read-only view of existing tables and columns
//!
//! The DDL builder validates structural changes against a [`SchemaCatalog`]
//! so that a migration naming a missing table or column fails as an authoring
//! defect before any statement runs.

use std::collections::HashMap;

use super::schema_builder::{ColumnDef, ColumnType, StructuralChange, DEFAULT_STRING_LIMIT};
use crate::backends::{DatabaseConnection, DatabaseValue};
use crate::dialect::Dialect;
use crate::error::MigrationResult;

/// Column metadata read from the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Lowercased base type, without length (`varchar`, `text`, `integer`, ...)
    pub data_type: String,
    /// Declared maximum length in characters, for sized character types
    pub max_length: Option<u32>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, max_length: Option<u32>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into().to_lowercase(),
            max_length,
        }
    }

    /// Parse a declared SQLite-style type such as `VARCHAR(400)`
    pub fn from_declared(name: impl Into<String>, declared: &str) -> Self {
        let declared = declared.trim();
        let (base, length) = match declared.split_once('(') {
            Some((base, rest)) => {
                let length = rest
                    .trim_end_matches(')')
                    .split(',')
                    .next()
                    .and_then(|n| n.trim().parse::<u32>().ok());
                (base.trim(), length)
            }
            None => (declared, None),
        };
        Self::new(name, base, length)
    }

    /// Metadata a column will have once `def` is created
    pub fn from_def(def: &ColumnDef) -> Self {
        let (data_type, max_length) = match def.column_type {
            ColumnType::String => ("varchar", Some(def.limit.unwrap_or(DEFAULT_STRING_LIMIT))),
            ColumnType::Text => ("text", None),
            ColumnType::Id | ColumnType::Integer => ("integer", None),
            ColumnType::BigInteger => ("bigint", None),
            ColumnType::Boolean => ("boolean", None),
            ColumnType::Float => ("double", None),
            ColumnType::Timestamp => ("timestamp", None),
        };
        Self::new(def.name.clone(), data_type, max_length)
    }

    /// Whether this is a variable-length character column (`VARCHAR`, `TEXT`, ...)
    pub fn is_variable_text(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "varchar"
                | "character varying"
                | "nvarchar"
                | "varchar2"
                | "text"
                | "tinytext"
                | "mediumtext"
                | "longtext"
                | "clob"
                | "string"
        )
    }
}

/// Columns of one existing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Lookup of existing tables used while building DDL
pub trait SchemaCatalog {
    fn table(&self, name: &str) -> Option<&TableSchema>;
}

/// In-memory catalog, filled from the database or by hand in tests
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tables: HashMap<String, TableSchema>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.insert(table);
        self
    }

    pub fn insert(&mut self, table: TableSchema) {
        self.tables.insert(table.name.to_lowercase(), table);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_lowercase())
    }

    /// Reflect a structural change, so later changes can be checked without a database
    pub fn apply(&mut self, change: &StructuralChange) {
        let key = change.table().to_lowercase();
        match change {
            StructuralChange::CreateTable { table, columns } => {
                let columns = columns.iter().map(ColumnInfo::from_def).collect();
                self.insert(TableSchema::new(table.clone(), columns));
            }
            StructuralChange::DropTable { .. } => {
                self.tables.remove(&key);
            }
            StructuralChange::AddColumn { column, .. } => {
                if let Some(schema) = self.tables.get_mut(&key) {
                    schema.columns.push(ColumnInfo::from_def(column));
                }
            }
            StructuralChange::DropColumn { column, .. } => {
                if let Some(schema) = self.tables.get_mut(&key) {
                    schema.columns.retain(|c| !c.name.eq_ignore_ascii_case(column));
                }
            }
            StructuralChange::AddIndex(_) | StructuralChange::DropIndex { .. } => {}
        }
    }
}

impl SchemaCatalog for StaticCatalog {
    fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_lowercase())
    }
}

/// Reads table metadata from a live connection
pub struct SchemaInspector {
    dialect: Dialect,
}

impl SchemaInspector {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Describe a table, or `None` when it does not exist
    pub async fn describe_table(
        &self,
        conn: &mut dyn DatabaseConnection,
        table: &str,
    ) -> MigrationResult<Option<TableSchema>> {
        let (sql, params) = self.columns_sql(table);
        let rows = conn.fetch_all(&sql, &params).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = row.try_get_string("column_name")?.unwrap_or_default();
            let data_type = row.try_get_string("data_type")?.unwrap_or_default();
            let column = match self.dialect {
                Dialect::Sqlite => ColumnInfo::from_declared(name, &data_type),
                _ => {
                    let max_length = row
                        .try_get_i64("max_length")?
                        .and_then(|n| u32::try_from(n).ok());
                    ColumnInfo::new(name, data_type, max_length)
                }
            };
            columns.push(column);
        }

        Ok(Some(TableSchema::new(table, columns)))
    }

    /// Load every named table that exists into a [`StaticCatalog`]
    pub async fn load<'a, I>(
        &self,
        conn: &mut dyn DatabaseConnection,
        tables: I,
    ) -> MigrationResult<StaticCatalog>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut catalog = StaticCatalog::new();
        for table in tables {
            if let Some(schema) = self.describe_table(conn, table).await? {
                catalog.insert(schema);
            }
        }
        Ok(catalog)
    }

    fn columns_sql(&self, table: &str) -> (String, Vec<DatabaseValue>) {
        let params = vec![DatabaseValue::from(table)];
        let sql = match self.dialect {
            Dialect::Sqlite => "SELECT name AS column_name, type AS data_type \
                 FROM pragma_table_info(?) ORDER BY cid"
                .to_string(),
            Dialect::PostgreSql => "SELECT CAST(column_name AS VARCHAR) AS column_name, \
                 CAST(data_type AS VARCHAR) AS data_type, \
                 CAST(character_maximum_length AS BIGINT) AS max_length \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position"
                .to_string(),
            Dialect::MySqlFamily => "SELECT column_name AS column_name, data_type AS data_type, \
                 CAST(character_maximum_length AS SIGNED) AS max_length \
                 FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 ORDER BY ordinal_position"
                .to_string(),
            Dialect::Generic => "SELECT column_name, data_type, \
                 character_maximum_length AS max_length \
                 FROM information_schema.columns \
                 WHERE LOWER(table_name) = LOWER(?) \
                 ORDER BY ordinal_position"
                .to_string(),
        };
        (sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_declared_parses_length() {
        let column = ColumnInfo::from_declared("kee", "VARCHAR(400)");
        assert_eq!(column.data_type, "varchar");
        assert_eq!(column.max_length, Some(400));
        assert!(column.is_variable_text());

        let column = ColumnInfo::from_declared("price", "DECIMAL(10, 2)");
        assert_eq!(column.data_type, "decimal");
        assert_eq!(column.max_length, Some(10));
        assert!(!column.is_variable_text());

        let column = ColumnInfo::from_declared("body", "text");
        assert_eq!(column.max_length, None);
        assert!(column.is_variable_text());
    }

    #[test]
    fn test_static_catalog_lookup_is_case_insensitive() {
        let catalog = StaticCatalog::new().with_table(TableSchema::new(
            "Projects",
            vec![ColumnInfo::new("KEE", "varchar", Some(400))],
        ));

        let table = catalog.table("projects").unwrap();
        assert!(table.column("kee").is_some());
        assert!(catalog.table("issues").is_none());
    }

    #[test]
    fn test_apply_tracks_planned_changes() {
        let mut catalog = StaticCatalog::new();
        catalog.apply(&StructuralChange::CreateTable {
            table: "action_plans".to_string(),
            columns: vec![ColumnDef::id("id")],
        });
        catalog.apply(&StructuralChange::AddColumn {
            table: "action_plans".to_string(),
            column: ColumnDef::string("kee").limit(100),
        });

        let kee = catalog.table("action_plans").and_then(|t| t.column("kee")).unwrap();
        assert_eq!(kee.max_length, Some(100));
        assert!(kee.is_variable_text());

        catalog.apply(&StructuralChange::DropColumn {
            table: "action_plans".to_string(),
            column: "kee".to_string(),
        });
        assert!(catalog.table("action_plans").unwrap().column("kee").is_none());

        catalog.apply(&StructuralChange::DropTable {
            table: "action_plans".to_string(),
        });
        assert!(!catalog.contains("action_plans"));
    }
}
