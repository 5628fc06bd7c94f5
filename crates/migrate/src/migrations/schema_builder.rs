//! Schema Builder - dialect-aware DDL generation
//!
//! Migrations describe structural changes as [`StructuralChange`] values. The
//! [`DdlBuilder`] turns one change into concrete statements for a resolved
//! [`Dialect`], validating names and checking the target objects against a
//! [`SchemaCatalog`]. It never executes anything.

use crate::dialect::{Dialect, MYSQL_BYTES_PER_CHAR};
use crate::error::{MigrationError, MigrationResult, SchemaObjectKind};
use crate::security::{validate_identifier, validate_identifiers};

use super::catalog::{ColumnInfo, SchemaCatalog, TableSchema};

/// Default length of a `string` column when no limit is given
pub const DEFAULT_STRING_LIMIT: u32 = 255;

/// Abstract column types, mapped per dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Auto-incrementing integer primary key
    Id,
    String,
    Text,
    Integer,
    BigInteger,
    Boolean,
    Float,
    Timestamp,
}

/// Column definition used by `CreateTable` and `AddColumn`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub limit: Option<u32>,
    /// Raw SQL default expression
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            limit: None,
            default: None,
        }
    }

    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Id).not_null()
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::String)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn big_integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::BigInteger)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }
}

/// Index definition for `AddIndex`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub table: String,
    pub columns: Vec<String>,
    pub name: Option<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn new(table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            name: None,
            unique: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Explicit name, or `idx_<table>_<columns>`
    pub fn index_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("idx_{}_{}", self.table, self.columns.join("_")))
    }
}

/// One DDL intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralChange {
    CreateTable { table: String, columns: Vec<ColumnDef> },
    DropTable { table: String },
    AddColumn { table: String, column: ColumnDef },
    DropColumn { table: String, column: String },
    AddIndex(IndexDef),
    DropIndex { table: String, name: String },
}

impl StructuralChange {
    /// Table the change applies to
    pub fn table(&self) -> &str {
        match self {
            StructuralChange::CreateTable { table, .. }
            | StructuralChange::DropTable { table }
            | StructuralChange::AddColumn { table, .. }
            | StructuralChange::DropColumn { table, .. }
            | StructuralChange::DropIndex { table, .. } => table,
            StructuralChange::AddIndex(index) => &index.table,
        }
    }

    /// Short human description for logs
    pub fn describe(&self) -> String {
        match self {
            StructuralChange::CreateTable { table, .. } => format!("create table {}", table),
            StructuralChange::DropTable { table } => format!("drop table {}", table),
            StructuralChange::AddColumn { table, column } => {
                format!("add column {}.{}", table, column.name)
            }
            StructuralChange::DropColumn { table, column } => {
                format!("drop column {}.{}", table, column)
            }
            StructuralChange::AddIndex(index) => {
                format!("add index {} on {}", index.index_name(), index.table)
            }
            StructuralChange::DropIndex { table, name } => {
                format!("drop index {} on {}", name, table)
            }
        }
    }
}

/// Table builder for `CreateTable` changes
pub struct TableBuilder {
    table_name: String,
    columns: Vec<ColumnDef>,
}

impl TableBuilder {
    pub fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            columns: Vec::new(),
        }
    }

    /// Add a fully specified column
    pub fn column(&mut self, column: ColumnDef) -> &mut Self {
        self.columns.push(column);
        self
    }

    /// Add an ID column (auto-increment primary key)
    pub fn id(&mut self, name: &str) -> &mut Self {
        self.column(ColumnDef::id(name))
    }

    /// Add a nullable string column
    pub fn string(&mut self, name: &str, length: Option<u32>) -> &mut Self {
        let mut column = ColumnDef::string(name);
        column.limit = length;
        self.column(column)
    }

    pub fn text(&mut self, name: &str) -> &mut Self {
        self.column(ColumnDef::text(name))
    }

    pub fn integer(&mut self, name: &str) -> &mut Self {
        self.column(ColumnDef::integer(name))
    }

    pub fn boolean(&mut self, name: &str) -> &mut Self {
        self.column(ColumnDef::boolean(name))
    }

    /// Add created_at / updated_at columns
    pub fn timestamps(&mut self) -> &mut Self {
        self.column(ColumnDef::timestamp("created_at"));
        self.column(ColumnDef::timestamp("updated_at"))
    }

    pub fn into_change(self) -> StructuralChange {
        StructuralChange::CreateTable {
            table: self.table_name,
            columns: self.columns,
        }
    }
}

/// Produces DDL statements for a resolved dialect
#[derive(Debug, Clone, Copy)]
pub struct DdlBuilder {
    dialect: Dialect,
}

impl DdlBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Build the statements for one structural change
    pub fn build(
        &self,
        change: &StructuralChange,
        catalog: &dyn SchemaCatalog,
    ) -> MigrationResult<Vec<String>> {
        validate_identifier(change.table())?;

        let sql = match change {
            StructuralChange::CreateTable { table, columns } => {
                if columns.is_empty() {
                    return Err(MigrationError::InvalidIdentifier(format!(
                        "table '{}' must declare at least one column",
                        table
                    )));
                }
                let definitions = columns
                    .iter()
                    .map(|c| self.column_sql(c))
                    .collect::<MigrationResult<Vec<_>>>()?;
                format!("CREATE TABLE {} (\n    {}\n)", table, definitions.join(",\n    "))
            }
            StructuralChange::DropTable { table } => {
                require_table(catalog, table)?;
                format!("DROP TABLE {}", table)
            }
            StructuralChange::AddColumn { table, column } => {
                require_table(catalog, table)?;
                format!("ALTER TABLE {} ADD COLUMN {}", table, self.column_sql(column)?)
            }
            StructuralChange::DropColumn { table, column } => {
                validate_identifier(column)?;
                let schema = require_table(catalog, table)?;
                require_column(schema, column)?;
                format!("ALTER TABLE {} DROP COLUMN {}", table, column)
            }
            StructuralChange::AddIndex(index) => self.add_index_sql(index, catalog)?,
            StructuralChange::DropIndex { table, name } => {
                validate_identifier(name)?;
                require_table(catalog, table)?;
                if self.dialect.drop_index_needs_table() {
                    format!("DROP INDEX {} ON {}", name, table)
                } else {
                    format!("DROP INDEX {}", name)
                }
            }
        };

        Ok(vec![sql])
    }

    fn add_index_sql(&self, index: &IndexDef, catalog: &dyn SchemaCatalog) -> MigrationResult<String> {
        if index.columns.is_empty() {
            return Err(MigrationError::InvalidIdentifier(format!(
                "index on '{}' must name at least one column",
                index.table
            )));
        }
        let name = index.index_name();
        validate_identifier(&name)?;
        validate_identifiers(index.columns.iter().map(String::as_str))?;

        let schema = require_table(catalog, &index.table)?;
        let columns = index
            .columns
            .iter()
            .map(|c| require_column(schema, c).map(|info| self.index_column_sql(c, info)))
            .collect::<MigrationResult<Vec<_>>>()?;

        Ok(format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            name,
            index.table,
            columns.join(", ")
        ))
    }

    /// Column reference inside an index, prefix-limited where the dialect caps key size
    fn index_column_sql(&self, name: &str, column: &ColumnInfo) -> String {
        let (Some(max_bytes), Some(prefix_chars)) = (
            self.dialect.max_indexable_bytes(),
            self.dialect.max_index_prefix_chars(),
        ) else {
            return name.to_string();
        };

        if !column.is_variable_text() {
            return name.to_string();
        }

        let too_wide = match column.max_length {
            Some(chars) => chars.saturating_mul(MYSQL_BYTES_PER_CHAR) > max_bytes,
            None => true,
        };

        if too_wide {
            tracing::debug!(
                "Limiting index key on {} to {} characters ({} bytes max)",
                name,
                prefix_chars,
                max_bytes
            );
            format!("{}({})", name, prefix_chars)
        } else {
            name.to_string()
        }
    }

    /// Render a column definition
    pub fn column_sql(&self, column: &ColumnDef) -> MigrationResult<String> {
        validate_identifier(&column.name)?;

        let mut sql = format!("{} {}", column.name, self.type_sql(column));
        if column.column_type != ColumnType::Id && !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        Ok(sql)
    }

    fn type_sql(&self, column: &ColumnDef) -> String {
        match (column.column_type, self.dialect) {
            (ColumnType::Id, Dialect::PostgreSql) => "BIGSERIAL PRIMARY KEY".to_string(),
            (ColumnType::Id, Dialect::MySqlFamily) => "BIGINT AUTO_INCREMENT PRIMARY KEY".to_string(),
            (ColumnType::Id, Dialect::Sqlite) => "INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
            (ColumnType::Id, Dialect::Generic) => {
                "BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY".to_string()
            }
            (ColumnType::String, _) => {
                format!("VARCHAR({})", column.limit.unwrap_or(DEFAULT_STRING_LIMIT))
            }
            (ColumnType::Text, Dialect::MySqlFamily) => "LONGTEXT".to_string(),
            (ColumnType::Text, Dialect::Generic) => "CLOB".to_string(),
            (ColumnType::Text, _) => "TEXT".to_string(),
            (ColumnType::Integer, _) => "INTEGER".to_string(),
            (ColumnType::BigInteger, _) => "BIGINT".to_string(),
            (ColumnType::Boolean, dialect) if !dialect.supports_boolean() => "TINYINT(1)".to_string(),
            (ColumnType::Boolean, _) => "BOOLEAN".to_string(),
            (ColumnType::Float, Dialect::MySqlFamily) => "DOUBLE".to_string(),
            (ColumnType::Float, Dialect::Sqlite) => "REAL".to_string(),
            (ColumnType::Float, _) => "DOUBLE PRECISION".to_string(),
            (ColumnType::Timestamp, Dialect::MySqlFamily) => "DATETIME".to_string(),
            (ColumnType::Timestamp, _) => "TIMESTAMP".to_string(),
        }
    }
}

fn require_table<'c>(catalog: &'c dyn SchemaCatalog, table: &str) -> MigrationResult<&'c TableSchema> {
    catalog
        .table(table)
        .ok_or_else(|| MigrationError::SchemaObjectNotFound {
            kind: SchemaObjectKind::Table,
            name: table.to_string(),
        })
}

fn require_column<'t>(schema: &'t TableSchema, column: &str) -> MigrationResult<&'t ColumnInfo> {
    schema
        .column(column)
        .ok_or_else(|| MigrationError::SchemaObjectNotFound {
            kind: SchemaObjectKind::Column,
            name: format!("{}.{}", schema.name, column),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::catalog::StaticCatalog;

    fn projects_catalog() -> StaticCatalog {
        StaticCatalog::new().with_table(TableSchema::new(
            "projects",
            vec![
                ColumnInfo::new("id", "integer", None),
                ColumnInfo::new("kee", "varchar", Some(400)),
                ColumnInfo::new("name", "varchar", Some(64)),
                ColumnInfo::new("description", "text", None),
            ],
        ))
    }

    fn kee_index() -> StructuralChange {
        StructuralChange::AddIndex(IndexDef::new("projects", &["kee"]).named("projects_kee"))
    }

    #[test]
    fn test_mysql_index_on_wide_varchar_is_prefix_limited() {
        let sql = DdlBuilder::new(Dialect::MySqlFamily)
            .build(&kee_index(), &projects_catalog())
            .unwrap();
        assert_eq!(sql, vec!["CREATE INDEX projects_kee ON projects (kee(255))"]);
    }

    #[test]
    fn test_other_dialects_emit_full_column_index() {
        for dialect in [Dialect::Generic, Dialect::PostgreSql, Dialect::Sqlite] {
            let sql = DdlBuilder::new(dialect)
                .build(&kee_index(), &projects_catalog())
                .unwrap();
            assert_eq!(sql, vec!["CREATE INDEX projects_kee ON projects (kee)"]);
        }
    }

    #[test]
    fn test_mysql_narrow_and_non_text_columns_are_not_limited() {
        let change = StructuralChange::AddIndex(
            IndexDef::new("projects", &["name", "id"]).named("projects_name_id").unique(),
        );
        let sql = DdlBuilder::new(Dialect::MySqlFamily)
            .build(&change, &projects_catalog())
            .unwrap();
        assert_eq!(sql, vec!["CREATE UNIQUE INDEX projects_name_id ON projects (name, id)"]);
    }

    #[test]
    fn test_mysql_unbounded_text_column_is_limited() {
        let change = StructuralChange::AddIndex(IndexDef::new("projects", &["description"]));
        let sql = DdlBuilder::new(Dialect::MySqlFamily)
            .build(&change, &projects_catalog())
            .unwrap();
        assert_eq!(
            sql,
            vec!["CREATE INDEX idx_projects_description ON projects (description(255))"]
        );
    }

    #[test]
    fn test_missing_table_or_column_is_reported() {
        let builder = DdlBuilder::new(Dialect::Generic);

        let missing_table = StructuralChange::AddIndex(IndexDef::new("issues", &["kee"]));
        let err = builder.build(&missing_table, &projects_catalog()).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::SchemaObjectNotFound { kind: SchemaObjectKind::Table, .. }
        ));

        let missing_column = StructuralChange::AddIndex(IndexDef::new("projects", &["uuid"]));
        let err = builder.build(&missing_column, &projects_catalog()).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::SchemaObjectNotFound { kind: SchemaObjectKind::Column, ref name } if name == "projects.uuid"
        ));

        let add_column = StructuralChange::AddColumn {
            table: "action_plans".to_string(),
            column: ColumnDef::string("kee"),
        };
        assert!(builder.build(&add_column, &projects_catalog()).is_err());
    }

    #[test]
    fn test_add_column_types_per_dialect() {
        let catalog = StaticCatalog::new().with_table(TableSchema::new(
            "action_plans",
            vec![ColumnInfo::new("id", "integer", None)],
        ));
        let change = StructuralChange::AddColumn {
            table: "action_plans".to_string(),
            column: ColumnDef::string("kee").nullable().limit(100),
        };

        let sql = DdlBuilder::new(Dialect::PostgreSql).build(&change, &catalog).unwrap();
        assert_eq!(sql, vec!["ALTER TABLE action_plans ADD COLUMN kee VARCHAR(100)"]);

        let flag = StructuralChange::AddColumn {
            table: "action_plans".to_string(),
            column: ColumnDef::boolean("archived").not_null().default_value("0"),
        };
        let sql = DdlBuilder::new(Dialect::MySqlFamily).build(&flag, &catalog).unwrap();
        assert_eq!(
            sql,
            vec!["ALTER TABLE action_plans ADD COLUMN archived TINYINT(1) NOT NULL DEFAULT 0"]
        );
    }

    #[test]
    fn test_create_table_from_table_builder() {
        let mut table = TableBuilder::new("action_plans");
        table.id("id");
        table.string("name", Some(200));
        table.text("description");
        table.timestamps();

        let sql = DdlBuilder::new(Dialect::Sqlite)
            .build(&table.into_change(), &StaticCatalog::new())
            .unwrap();
        let sql = &sql[0];
        assert!(sql.starts_with("CREATE TABLE action_plans ("));
        assert!(sql.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("name VARCHAR(200)"));
        assert!(sql.contains("description TEXT"));
        assert!(sql.contains("updated_at TIMESTAMP"));
    }

    #[test]
    fn test_drop_index_syntax() {
        let change = StructuralChange::DropIndex {
            table: "projects".to_string(),
            name: "projects_kee".to_string(),
        };
        let catalog = projects_catalog();

        assert_eq!(
            DdlBuilder::new(Dialect::MySqlFamily).build(&change, &catalog).unwrap(),
            vec!["DROP INDEX projects_kee ON projects"]
        );
        assert_eq!(
            DdlBuilder::new(Dialect::PostgreSql).build(&change, &catalog).unwrap(),
            vec!["DROP INDEX projects_kee"]
        );
    }

    #[test]
    fn test_invalid_identifiers_are_rejected() {
        let change = StructuralChange::AddColumn {
            table: "projects".to_string(),
            column: ColumnDef::string("kee; DROP TABLE projects"),
        };
        let err = DdlBuilder::new(Dialect::Generic)
            .build(&change, &projects_catalog())
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidIdentifier(_)));
    }
}
