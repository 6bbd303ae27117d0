//! Store interface, parameter binding checks, schema provisioning and the
//! PostgreSQL store for propload.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use propload_core::TriState;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection};
use sqlx::query::Query;
use sqlx::{Connection, Postgres, Row};
use thiserror::Error;
use tracing::{error, info, warn};

mod fault;

pub use fault::FailingStore;

pub const CRATE_NAME: &str = "propload-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("statement has {expected} placeholder(s) but {actual} parameter(s) were bound: {sql}")]
    BindingMismatch {
        expected: usize,
        actual: usize,
        sql: String,
    },
    #[error("connecting to store: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("reading schema resource {}: {source}", .path.display())]
    SchemaResource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema statement failed ({reason}): {statement}")]
    Schema { statement: String, reason: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("store rejected write: {0}")]
    Write(String),
    #[error("unsupported statement: {0}")]
    Unsupported(String),
}

impl StoreError {
    /// Errors that mean the pipeline or its environment is broken, not the record.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::BindingMismatch { .. }
            | StoreError::Connection(_)
            | StoreError::SchemaResource { .. }
            | StoreError::Schema { .. }
            | StoreError::Unsupported(_) => true,
            StoreError::Database(_) | StoreError::Write(_) => false,
        }
    }
}

/// Typed statement parameter. Nulls keep their type so the driver can declare it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlValue {
    Int(Option<i64>),
    Float(Option<f64>),
    Decimal(Option<Decimal>),
    Text(Option<String>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::Int(v) => v.is_none(),
            SqlValue::Float(v) => v.is_none(),
            SqlValue::Decimal(v) => v.is_none(),
            SqlValue::Text(v) => v.is_none(),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(Some(value))
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(value: Option<i64>) -> Self {
        SqlValue::Int(value)
    }
}

impl From<Option<f64>> for SqlValue {
    fn from(value: Option<f64>) -> Self {
        SqlValue::Float(value)
    }
}

impl From<Option<Decimal>> for SqlValue {
    fn from(value: Option<Decimal>) -> Self {
        SqlValue::Decimal(value)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        SqlValue::Text(value)
    }
}

impl From<Option<&str>> for SqlValue {
    fn from(value: Option<&str>) -> Self {
        SqlValue::Text(value.map(ToString::to_string))
    }
}

impl From<TriState> for SqlValue {
    fn from(value: TriState) -> Self {
        SqlValue::Text(Some(value.as_str().to_string()))
    }
}

/// Highest `$N` placeholder referenced outside single-quoted literals.
pub fn placeholder_count(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut highest = 0;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    highest = highest.max(n);
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    highest
}

/// SQL text plus its parameters. Construction fails unless the parameter
/// count matches the placeholders, so a mismatch never reaches the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: Cow<'static, str>,
    params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<Cow<'static, str>>, params: Vec<SqlValue>) -> Result<Self, StoreError> {
        let sql = sql.into();
        let expected = placeholder_count(&sql);
        if expected != params.len() {
            return Err(StoreError::BindingMismatch {
                expected,
                actual: params.len(),
                sql: sql.into_owned(),
            });
        }
        Ok(Self { sql, params })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }
}

/// One open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Run a statement, returning the number of affected rows.
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError>;

    /// Run a statement and read the first column of the first row as an id.
    async fn fetch_id(&mut self, statement: &Statement) -> Result<Option<i64>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn StoreTransaction + 'a>, StoreError>;
}

/// Single PostgreSQL connection reused for a whole batch.
#[derive(Debug)]
pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub async fn connect(options: &PgConnectOptions) -> Result<Self, StoreError> {
        let conn = PgConnection::connect_with(options)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self { conn })
    }

    /// Create `schema` if needed and make it the connection's search path.
    pub async fn use_schema(&mut self, schema: &str) -> Result<(), StoreError> {
        let valid = schema
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && schema.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(StoreError::Unsupported(format!("schema name {schema:?}")));
        }
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&mut self.conn)
            .await?;
        sqlx::query(&format!("SET search_path TO {schema}"))
            .execute(&mut self.conn)
            .await?;
        info!(schema, "using schema");
        Ok(())
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn StoreTransaction + 'a>, StoreError> {
        let tx = self.conn.begin().await?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }
}

struct PgStoreTransaction<'c> {
    tx: sqlx::Transaction<'c, Postgres>,
}

fn bind_all(statement: &Statement) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query(statement.sql());
    for param in statement.params() {
        query = match param {
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Decimal(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_deref()),
        };
    }
    query
}

#[async_trait]
impl<'c> StoreTransaction for PgStoreTransaction<'c> {
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        let result = bind_all(statement).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_id(&mut self, statement: &Statement) -> Result<Option<i64>, StoreError> {
        let row = bind_all(statement).fetch_optional(&mut *self.tx).await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>(0)?)),
            None => Ok(None),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgStoreTransaction { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let PgStoreTransaction { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

/// Split a DDL resource into statements, dropping `--` comments and blanks.
/// Quoted literals are copied through untouched, so `'--'` or `'a;b'` survive.
pub fn split_ddl(ddl: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_literal = false;
    let mut chars = ddl.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                current.push(ch);
            }
            '-' if !in_literal && chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            ';' if !in_literal => statements.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    statements.push(current);
    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Run every statement of the DDL resource in one transaction.
///
/// The resource is required; a missing file is a configuration error. Any
/// failing statement rolls back the whole provisioning transaction.
pub async fn ensure_schema<S: Store + ?Sized>(store: &mut S, ddl_path: &Path) -> Result<usize, StoreError> {
    let ddl = tokio::fs::read_to_string(ddl_path)
        .await
        .map_err(|source| StoreError::SchemaResource {
            path: ddl_path.to_path_buf(),
            source,
        })?;
    let statements = split_ddl(&ddl)
        .into_iter()
        .map(|sql| Statement::new(sql, Vec::new()))
        .collect::<Result<Vec<_>, _>>()?;
    if statements.is_empty() {
        return Err(StoreError::Schema {
            statement: ddl_path.display().to_string(),
            reason: "schema resource contains no statements".to_string(),
        });
    }

    let mut tx = store.begin().await?;
    for statement in &statements {
        if let Err(err) = tx.execute(statement).await {
            error!(error = %err, sql = statement.sql(), "schema statement failed");
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rolling back schema transaction failed");
            }
            return Err(StoreError::Schema {
                statement: statement.sql().to_string(),
                reason: err.to_string(),
            });
        }
    }
    tx.commit().await?;

    info!(statements = statements.len(), path = %ddl_path.display(), "schema ensured");
    Ok(statements.len())
}
