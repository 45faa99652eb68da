//! Namespace and table creation, safe to run on every start
//!
//! The table is a `ReplacingMergeTree` ordered by `id`: every upsert inserts
//! the full row with a larger `version`, and reads with `FINAL` see only the
//! newest row per key.
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::record::{OPTIONAL_FIELDS, REQUIRED_FIELDS};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("column store unavailable: {0}")]
    Unavailable(String),
    #[error("DDL failed ({statement}): {reason}")]
    Ddl { statement: String, reason: String },
    #[error("table {table} is incompatible: {reason}")]
    Incompatible { table: String, reason: String },
}

/// Failure of a single DDL statement, as reported by a [Catalog].
#[derive(Debug)]
pub struct DdlFailure {
    /// Another instance created the object first.
    pub already_exists: bool,
    pub reason: String,
}

/// Narrow DDL surface of the column store.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<(), DdlFailure>;

    /// `(name, type)` of every column of the table; empty when it does not exist.
    async fn columns(&self, database: &str, table: &str)
        -> Result<Vec<(String, String)>, BootstrapError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub database: String,
    pub table: String,
    pub columns: Vec<Column>,
}

/// Row version column used by the replacing engine.
pub const VERSION_COLUMN: &str = "version";

impl TableSchema {
    /// Schema of the user table: one `String` column per record field.
    ///
    /// An absent date of birth is stored as the empty string.
    pub fn users(database: &str, table: &str) -> Self {
        let mut columns: Vec<Column> = REQUIRED_FIELDS
            .iter()
            .map(|name| Column {
                name: *name,
                sql_type: "String",
                required: true,
            })
            .collect();
        columns.extend(OPTIONAL_FIELDS.iter().map(|name| Column {
            name: *name,
            sql_type: "String",
            required: false,
        }));
        columns.push(Column {
            name: VERSION_COLUMN,
            sql_type: "UInt64",
            required: true,
        });
        Self {
            database: database.to_owned(),
            table: table.to_owned(),
            columns,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    pub fn create_database_sql(&self) -> String {
        format!("CREATE DATABASE IF NOT EXISTS {}", self.database)
    }

    pub fn create_table_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(column_ddl)
            .collect::<Vec<_>>()
            .join(",\n    ");
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n) ENGINE = ReplacingMergeTree({}) ORDER BY id",
            self.qualified_name(),
            cols,
            VERSION_COLUMN
        )
    }

    /// Statements bringing an existing table up to this schema.
    ///
    /// Optional columns may be added; a missing or retyped required column
    /// cannot be repaired in place.
    pub fn migration(&self, existing: &[(String, String)]) -> Result<Vec<String>, BootstrapError> {
        let mut statements = Vec::new();
        for col in &self.columns {
            match existing.iter().find(|(name, _)| name == col.name) {
                Some((_, ty)) if ty == col.sql_type => {}
                Some((_, ty)) => {
                    return Err(BootstrapError::Incompatible {
                        table: self.qualified_name(),
                        reason: format!("column {} is {}, expected {}", col.name, ty, col.sql_type),
                    })
                }
                None if col.required => {
                    return Err(BootstrapError::Incompatible {
                        table: self.qualified_name(),
                        reason: format!("required column {} is missing", col.name),
                    })
                }
                None => statements.push(format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                    self.qualified_name(),
                    column_ddl(col)
                )),
            }
        }
        Ok(statements)
    }
}

fn column_ddl(c: &Column) -> String {
    if c.required {
        format!("{} {}", c.name, c.sql_type)
    } else {
        format!("{} {} DEFAULT ''", c.name, c.sql_type)
    }
}

/// Prepares the column store before any record is written.
pub struct Bootstrap<'a, C: Catalog + ?Sized> {
    catalog: &'a C,
}

impl<'a, C: Catalog + ?Sized> Bootstrap<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    pub async fn ensure_namespace(&self, schema: &TableSchema) -> Result<(), BootstrapError> {
        self.run(&schema.create_database_sql()).await?;
        info!(database = %schema.database, "namespace ready");
        Ok(())
    }

    pub async fn ensure_table(&self, schema: &TableSchema) -> Result<(), BootstrapError> {
        self.run(&schema.create_table_sql()).await?;
        let existing = self.catalog.columns(&schema.database, &schema.table).await?;
        if existing.is_empty() {
            return Err(BootstrapError::Incompatible {
                table: schema.qualified_name(),
                reason: String::from("table not visible after creation"),
            });
        }
        for statement in schema.migration(&existing)? {
            info!(table = %schema.qualified_name(), %statement, "evolving table");
            self.run(&statement).await?;
        }
        info!(table = %schema.qualified_name(), "table ready");
        Ok(())
    }

    async fn run(&self, statement: &str) -> Result<(), BootstrapError> {
        match self.catalog.execute(statement).await {
            Ok(()) => Ok(()),
            Err(DdlFailure {
                already_exists: true,
                ..
            }) => {
                info!(%statement, "object created concurrently by another instance");
                Ok(())
            }
            Err(DdlFailure { reason, .. }) => Err(BootstrapError::Ddl {
                statement: statement.to_owned(),
                reason,
            }),
        }
    }
}
