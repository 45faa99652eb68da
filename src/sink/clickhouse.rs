//! ClickHouse sink
//!
//! Rows go into a `ReplacingMergeTree(version)` table ordered by `id`. Every
//! upsert inserts the complete row with a fresh version; reads use `FINAL`,
//! so a redelivered record collapses into the row it replaces.
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clickhouse_rs::{errors::Error as ChError, types::Value, Block, Pool};
use tracing::debug;

use super::{RecordSink, WriteError};
use crate::{
    bootstrap::{Bootstrap, BootstrapError, Catalog, DdlFailure, TableSchema, VERSION_COLUMN},
    record::{UserRecord, OPTIONAL_FIELDS, REQUIRED_FIELDS},
};

/// ClickHouse row - vector of columns, each column is tuple of its name and value
pub type Row = Vec<(String, Value)>;

/// Server error codes meaning a concurrent `CREATE` won the race.
const TABLE_ALREADY_EXISTS: u32 = 57;
const DATABASE_ALREADY_EXISTS: u32 = 82;

/// Server error codes for overload and timeouts; the same insert may succeed later.
const RETRYABLE_SERVER_CODES: [u32; 8] = [
    159, // TIMEOUT_EXCEEDED
    202, // TOO_MANY_SIMULTANEOUS_QUERIES
    209, // SOCKET_TIMEOUT
    210, // NETWORK_ERROR
    241, // MEMORY_LIMIT_EXCEEDED
    242, // TABLE_IS_READ_ONLY
    252, // TOO_MANY_PARTS
    425, // SYSTEM_ERROR
];

pub struct ClickHouseSink {
    pool: Pool,
    schema: TableSchema,
    write_timeout: Duration,
}

impl ClickHouseSink {
    /// The pool is shared by every partition worker holding this sink.
    pub fn new(url: &str, database: &str, table: &str, write_timeout: Duration) -> Self {
        Self {
            pool: Pool::new(url.to_owned()),
            schema: TableSchema::users(database, table),
            write_timeout,
        }
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, WriteError>
    where
        F: std::future::Future<Output = Result<T, ChError>>,
    {
        match tokio::time::timeout(self.write_timeout, fut).await {
            Ok(res) => res.map_err(classify),
            Err(_) => Err(WriteError::Transient(format!(
                "no answer within {:?}",
                self.write_timeout
            ))),
        }
    }
}

/// Builds the full row for one record.
pub fn to_row(record: &UserRecord, version: u64) -> Row {
    let mut row: Row = REQUIRED_FIELDS
        .iter()
        .map(|name| {
            let v = record.field(name).unwrap_or_default().to_owned();
            (String::from(*name), Value::from(v))
        })
        .collect();
    for name in OPTIONAL_FIELDS {
        let v = record.field(name).unwrap_or_default().to_owned();
        row.push((String::from(name), Value::from(v)));
    }
    row.push((String::from(VERSION_COLUMN), Value::from(version)));
    row
}

/// Sorts driver errors into retryable and final.
fn classify(e: ChError) -> WriteError {
    match e {
        ChError::Io(_) | ChError::Connection(_) | ChError::Driver(_) => {
            WriteError::Transient(e.to_string())
        }
        ChError::Server(ref s) if RETRYABLE_SERVER_CODES.contains(&s.code) => {
            WriteError::Transient(e.to_string())
        }
        _ => WriteError::Permanent(e.to_string()),
    }
}

/// ClickHouse string literal.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn select_columns() -> String {
    REQUIRED_FIELDS
        .iter()
        .chain(OPTIONAL_FIELDS.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl Catalog for ClickHouseSink {
    async fn execute(&self, statement: &str) -> Result<(), DdlFailure> {
        let res = async move {
            let mut ch = self.pool.get_handle().await?;
            ch.execute(statement).await
        }
        .await;
        match res {
            Ok(()) => Ok(()),
            Err(ChError::Server(e))
                if e.code == TABLE_ALREADY_EXISTS || e.code == DATABASE_ALREADY_EXISTS =>
            {
                Err(DdlFailure {
                    already_exists: true,
                    reason: e.message,
                })
            }
            Err(e) => Err(DdlFailure {
                already_exists: false,
                reason: e.to_string(),
            }),
        }
    }

    async fn columns(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<(String, String)>, BootstrapError> {
        let sql = format!(
            "SELECT name, type FROM system.columns WHERE database = {} AND table = {}",
            quote(database),
            quote(table)
        );
        let block = async move {
            let mut ch = self.pool.get_handle().await?;
            ch.query(sql).fetch_all().await
        }
        .await
        .map_err(|e| BootstrapError::Unavailable(e.to_string()))?;
        let mut columns = Vec::new();
        for row in block.rows() {
            let name: String = row
                .get("name")
                .map_err(|e| BootstrapError::Unavailable(e.to_string()))?;
            let ty: String = row
                .get("type")
                .map_err(|e| BootstrapError::Unavailable(e.to_string()))?;
            columns.push((name, ty));
        }
        Ok(columns)
    }
}

#[async_trait]
impl RecordSink for ClickHouseSink {
    async fn ensure_schema(&self) -> Result<(), BootstrapError> {
        let bootstrap = Bootstrap::new(self);
        bootstrap.ensure_namespace(&self.schema).await?;
        bootstrap.ensure_table(&self.schema).await
    }

    async fn upsert(&self, record: &UserRecord) -> Result<(), WriteError> {
        let version = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        let mut block = Block::with_capacity(1);
        block
            .push(to_row(record, version))
            .map_err(|e| WriteError::Permanent(format!("building row {}: {}", record.id, e)))?;
        let table = self.schema.qualified_name();
        self.timed(async move {
            let mut ch = self.pool.get_handle().await?;
            ch.insert(table, block).await
        })
        .await?;
        debug!(id = %record.id, version, "row upserted");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>, WriteError> {
        let sql = format!(
            "SELECT {} FROM {} FINAL WHERE id = {}",
            select_columns(),
            self.schema.qualified_name(),
            quote(id)
        );
        let block = self
            .timed(async move {
                let mut ch = self.pool.get_handle().await?;
                ch.query(sql).fetch_all().await
            })
            .await?;
        let Some(row) = block.rows().next() else {
            return Ok(None);
        };
        let col = |name: &str| -> Result<String, WriteError> {
            row.get::<String, _>(name)
                .map_err(|e| WriteError::Permanent(format!("reading {name}: {e}")))
        };
        let dob = col("date_of_birth")?;
        Ok(Some(UserRecord {
            id: col("id")?,
            first_name: col("first_name")?,
            last_name: col("last_name")?,
            gender: col("gender")?,
            address: col("address")?,
            post_code: col("post_code")?,
            email: col("email")?,
            username: col("username")?,
            date_of_birth: (!dob.is_empty()).then_some(dob),
            registered_date: col("registered_date")?,
            phone: col("phone")?,
            picture_url: col("picture_url")?,
        }))
    }

    async fn count(&self) -> Result<u64, WriteError> {
        let sql = format!("SELECT count() AS n FROM {} FINAL", self.schema.qualified_name());
        let block = self
            .timed(async move {
                let mut ch = self.pool.get_handle().await?;
                ch.query(sql).fetch_all().await
            })
            .await?;
        match block.rows().next() {
            Some(row) => row
                .get::<u64, _>("n")
                .map_err(|e| WriteError::Permanent(e.to_string())),
            None => Ok(0),
        }
    }
}
