//! SQL adapter over the sqlx `Any` driver.
//!
//! One client handles PostgreSQL, MySQL and SQLite; the dialect is detected
//! from the connection URL and only affects transaction-opening statements and
//! error classification. Parameters are JSON values; rows come back as JSON
//! objects keyed by column name.

mod classify;

pub use classify::{classify_mysql_errno, classify_sqlite_code, classify_sqlstate};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool, Column, Executor, Row, TypeInfo, ValueRef};
use tracing::{debug, info, warn};

use crate::cancel::race;
use crate::config::{SqlConfig, ToolkitConfig};
use crate::error::{Classify, Error, ErrorKind};
use crate::policy::{settle, CallOptions, ClientDefaults, Resolved};
use crate::result::{OpResult, QueryPayload, ResultKind, Row as JsonRow};
use crate::transaction::{
    run_in_transaction, ConnectionSource, IsolationLevel, ReservedConnection, Transaction,
    TransactionOptions,
};

/// SQL backends propagate failures by default.
pub const THROWS_BY_DEFAULT: bool = true;

/// SQL dialect, detected from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" => Ok(Dialect::Sqlite),
            _ => Err(Error::new(
                ErrorKind::Connection,
                format!("unsupported database URL scheme: {:?}", scheme),
            )),
        }
    }

    /// Statements that open a transaction at the given isolation level.
    ///
    /// MySQL sets the level for the next transaction before starting it;
    /// PostgreSQL takes it on `BEGIN`. SQLite transactions are always
    /// serializable, so the level only decides whether the write lock is taken
    /// up front.
    pub fn begin_statements(&self, isolation: Option<IsolationLevel>) -> Vec<String> {
        match (self, isolation) {
            (Dialect::Postgres, Some(level)) => {
                vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())]
            }
            (Dialect::Postgres, None) => vec!["BEGIN".to_string()],
            (Dialect::MySql, Some(level)) => vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
                "START TRANSACTION".to_string(),
            ],
            (Dialect::MySql, None) => vec!["START TRANSACTION".to_string()],
            (Dialect::Sqlite, Some(IsolationLevel::Serializable)) => {
                vec!["BEGIN IMMEDIATE".to_string()]
            }
            (Dialect::Sqlite, _) => vec!["BEGIN".to_string()],
        }
    }
}

/// Whether a statement produces a row set rather than an affected count.
fn returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "PRAGMA" | "EXPLAIN" | "DESCRIBE" | "TABLE"
    ) || sql.to_ascii_uppercase().contains(" RETURNING ")
}

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// Driver-level form of one JSON parameter.
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for Param {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Param::Null,
            Value::Bool(b) => Param::Bool(*b),
            Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => Param::Int(i),
                // Beyond i64: text keeps every digit, f64 would not.
                (None, Some(_), _) => Param::Text(n.to_string()),
                (None, None, Some(f)) => Param::Float(f),
                (None, None, None) => Param::Text(n.to_string()),
            },
            Value::String(s) => Param::Text(s.clone()),
            // Arrays and objects travel as JSON text.
            other => Param::Text(other.to_string()),
        }
    }
}

fn bind_json<'q>(query: AnyQuery<'q>, value: &Value) -> AnyQuery<'q> {
    match Param::from(value) {
        Param::Null => query.bind(Option::<String>::None),
        Param::Bool(b) => query.bind(b),
        Param::Int(i) => query.bind(i),
        Param::Float(f) => query.bind(f),
        Param::Text(s) => query.bind(s),
    }
}

fn build_query<'q>(sql: &'q str, params: &[Value]) -> AnyQuery<'q> {
    params.iter().fold(sqlx::query(sql), bind_json)
}

fn decode_column(row: &AnyRow, index: usize) -> Result<Value, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };

    let value = match type_name.as_str() {
        "BOOLEAN" | "BOOL" => Value::Bool(row.try_get::<bool, _>(index)?),
        "SMALLINT" => Value::from(row.try_get::<i16, _>(index)?),
        "INTEGER" | "INT" => Value::from(row.try_get::<i32, _>(index)?),
        "BIGINT" => Value::from(row.try_get::<i64, _>(index)?),
        "REAL" | "FLOAT" => Value::from(row.try_get::<f32, _>(index)?),
        "DOUBLE" => Value::from(row.try_get::<f64, _>(index)?),
        "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(index)?)),
        _ => Value::String(row.try_get::<String, _>(index)?),
    };
    Ok(value)
}

/// Convert a driver row into a JSON object keyed by column name.
pub fn row_to_json(row: &AnyRow) -> Result<JsonRow, sqlx::Error> {
    let mut object = Map::new();
    for column in row.columns() {
        object.insert(
            column.name().to_string(),
            decode_column(row, column.ordinal())?,
        );
    }
    Ok(object)
}

async fn run_statement(
    conn: &mut AnyConnection,
    sql: &str,
    params: &[Value],
) -> Result<QueryPayload, sqlx::Error> {
    if returns_rows(sql) {
        let rows = build_query(sql, params).fetch_all(conn).await?;
        let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>, _>>()?;
        Ok(QueryPayload::from_rows(rows))
    } else {
        let done = build_query(sql, params).execute(conn).await?;
        Ok(QueryPayload::affected(done.rows_affected(), done.last_insert_id()))
    }
}

// ============================================================================
// Client
// ============================================================================

/// Pooled SQL client.
#[derive(Clone)]
pub struct SqlClient {
    pool: AnyPool,
    dialect: Dialect,
    defaults: ClientDefaults,
}

impl std::fmt::Debug for SqlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlClient")
            .field("dialect", &self.dialect)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl SqlClient {
    /// Connect a pool to `url`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        defaults: ClientDefaults,
    ) -> Result<Self, Error> {
        let dialect = Dialect::from_url(url)?;
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(Classify::classify)?;

        info!(dialect = ?dialect, max_connections, "Connected to SQL database");
        Ok(Self {
            pool,
            dialect,
            defaults,
        })
    }

    /// Connect using the `sql` section of the toolkit configuration.
    pub async fn from_config(config: &ToolkitConfig) -> Result<Self, Error> {
        let SqlConfig {
            url,
            max_connections,
            ..
        } = &config.sql;
        let url = url
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::Connection, "sql.url is not configured"))?;
        Self::connect(url, *max_connections, config.sql_defaults()).await
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn defaults(&self) -> &ClientDefaults {
        &self.defaults
    }

    fn resolve(&self, call: &CallOptions) -> Resolved {
        Resolved::new(call, &self.defaults, THROWS_BY_DEFAULT)
    }

    /// Run a statement that returns rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        call: &CallOptions,
    ) -> Result<OpResult<QueryPayload>, Error> {
        debug!(sql, params = params.len(), "sql query");
        settle(ResultKind::Query, &self.resolve(call), async {
            let rows = build_query(sql, params).fetch_all(&self.pool).await?;
            let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>, _>>()?;
            Ok::<_, sqlx::Error>(QueryPayload::from_rows(rows))
        })
        .await
    }

    /// Run a statement for its affected-row count.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[Value],
        call: &CallOptions,
    ) -> Result<OpResult<QueryPayload>, Error> {
        debug!(sql, params = params.len(), "sql execute");
        settle(ResultKind::Execute, &self.resolve(call), async {
            let done = build_query(sql, params).execute(&self.pool).await?;
            Ok::<_, sqlx::Error>(QueryPayload::affected(
                done.rows_affected(),
                done.last_insert_id(),
            ))
        })
        .await
    }

    /// Options for transactions opened by this client.
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            defaults: self.defaults.clone(),
            backend_throws: THROWS_BY_DEFAULT,
            ..TransactionOptions::default()
        }
    }

    /// Reserve a connection and open a transaction on it.
    pub async fn begin(
        &self,
        options: &TransactionOptions,
    ) -> Result<Transaction<SqlConnection>, Error> {
        let conn = race(self.reserve(), options.call.timeout, options.call.signal.as_ref())
            .await
            .map_err(Classify::classify)?;
        Transaction::begin(conn, options).await
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    pub async fn transaction<T, F>(&self, options: TransactionOptions, f: F) -> Result<T, Error>
    where
        F: for<'t> FnOnce(&'t mut Transaction<SqlConnection>) -> BoxFuture<'t, Result<T, Error>>,
    {
        run_in_transaction(self, options, f).await
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(dialect = ?self.dialect, "SQL pool closed");
    }
}

#[async_trait]
impl ConnectionSource for SqlClient {
    type Connection = SqlConnection;

    async fn reserve(&self) -> Result<SqlConnection, sqlx::Error> {
        let conn = self.pool.acquire().await?;
        Ok(SqlConnection {
            conn: Some(conn),
            dialect: self.dialect,
            in_transaction: false,
        })
    }
}

// ============================================================================
// Reserved connection
// ============================================================================

/// Pool connection reserved for one transaction.
pub struct SqlConnection {
    conn: Option<PoolConnection<Any>>,
    dialect: Dialect,
    /// Set once BEGIN is sent, cleared only by a clean COMMIT or ROLLBACK.
    in_transaction: bool,
}

impl std::fmt::Debug for SqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnection")
            .field("dialect", &self.dialect)
            .field("held", &self.conn.is_some())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl SqlConnection {
    fn conn(&mut self) -> Result<&mut AnyConnection, sqlx::Error> {
        self.conn.as_deref_mut().ok_or(sqlx::Error::PoolClosed)
    }
}

#[async_trait]
impl ReservedConnection for SqlConnection {
    type Error = sqlx::Error;

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> Result<(), sqlx::Error> {
        let statements = self.dialect.begin_statements(isolation);
        // Marked first so an interrupted BEGIN is discarded on release.
        self.in_transaction = true;
        let conn = self.conn()?;
        for statement in &statements {
            (&mut *conn).execute(statement.as_str()).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryPayload, sqlx::Error> {
        run_statement(self.conn()?, sql, params).await
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.conn()?.execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.conn()?.execute("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    fn release(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.in_transaction {
            // Never hand a connection with an open transaction back to the pool.
            warn!(dialect = ?self.dialect, "discarding connection with unfinished transaction");
            drop(conn.detach());
        } else {
            drop(conn);
        }
    }
}
