//! Storage access over a runtime-selected backend.
//!
//! [`Database`] wraps an sqlx `Any` pool together with the [`Dialect`] matching the
//! backend the pool talks to. Statements come from the dialect or from the query
//! compiler; this module binds their [`SqlValue`] parameters, runs them, and decodes
//! rows according to the compiled column contract.

mod images;
mod tags;

pub use images::{ImageRecord, NewImage};

use crate::{
    config::Config,
    dialect::{Backend, Dialect, SqlValue},
};
use sqlx::{
    Any, AnyConnection, AnyPool, ColumnIndex, Executor,
    any::{AnyArguments, AnyPoolOptions, AnyRow},
    query::Query,
};
use std::fmt::Debug;
use thiserror::Error;
use tracing::{debug, info};

pub async fn run_migration(pool: &AnyPool, dialect: &dyn Dialect) -> Result<(), DatabaseError> {
    for stmt in dialect.migration() {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(|source| DatabaseError::QueryFailed {
                operation: DbOperation::Migrate,
                sql: stmt.to_string(),
                source,
            })?;
    }

    Ok(())
}

/// A catalog database: a connection pool and the dialect its statements are written in.
///
/// The pool is cheap to clone, so a `Database` can be shared across tasks by value.
#[derive(Debug, Clone)]
pub struct Database {
    pool: AnyPool,
    dialect: &'static dyn Dialect,
}

impl Database {
    /// Opens a pool from `config` and brings the schema up to date.
    pub async fn connect(config: &Config) -> Result<Self, DatabaseError> {
        let backend = config
            .backend()
            .map_err(|e| DatabaseError::Connect {
                url: config.database_url.clone(),
                source: sqlx::Error::Configuration(Box::new(e)),
            })?;

        sqlx::any::install_default_drivers();

        info!(
            subsystem = "database",
            component = "pool",
            op = "create",
            backend = %backend,
            max_connections = config.max_connections,
            connect_timeout_secs = config.connect_timeout.as_secs(),
            "Creating database connection pool"
        );

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if backend == Backend::Sqlite {
                        conn.execute("PRAGMA foreign_keys = ON").await?;
                    }
                    Ok(())
                })
            })
            .connect(&config.database_url)
            .await
            .map_err(|source| DatabaseError::Connect {
                url: config.database_url.clone(),
                source,
            })?;

        Self::with_migration(pool, backend).await
    }

    /// Wraps an existing pool, running the backend's migration first.
    pub async fn with_migration(pool: AnyPool, backend: Backend) -> Result<Self, DatabaseError> {
        let dialect = backend.dialect();
        run_migration(&pool, dialect).await?;

        Ok(Self { pool, dialect })
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn retry<F, Fut, T>(&self, mut op: F) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, DatabaseError>>,
    {
        let max_retries = 3;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    debug!(
                        subsystem = "database",
                        op = "retry",
                        attempt,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs a read statement on the pool, retrying transient failures.
    pub(crate) async fn fetch_all<O>(
        &self,
        sql: &str,
        params: &[SqlValue],
        operation: O,
    ) -> Result<Vec<AnyRow>, DatabaseError>
    where
        O: Fn() -> DbOperation,
    {
        self.retry(|| {
            let query = bind_all(sqlx::query(sql), params);
            let pool = &self.pool;
            let operation = &operation;
            async move {
                query
                    .fetch_all(pool)
                    .await
                    .map_err(|source| DatabaseError::QueryFailed {
                        operation: operation(),
                        sql: sql.to_string(),
                        source,
                    })
            }
        })
        .await
    }

    /// Runs a write statement on the pool once, returning the affected row count.
    pub(crate) async fn execute<O>(
        &self,
        sql: &str,
        params: &[SqlValue],
        operation: O,
    ) -> Result<u64, DatabaseError>
    where
        O: FnOnce() -> DbOperation,
    {
        bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map(|done| done.rows_affected())
            .map_err(|source| DatabaseError::QueryFailed {
                operation: operation(),
                sql: sql.to_string(),
                source,
            })
    }

    /// Opens a write transaction, with the dialect's own `BEGIN` when it has one.
    pub(crate) async fn begin(&self) -> Result<sqlx::Transaction<'static, Any>, DatabaseError> {
        let tx = match self.dialect.begin_write_statement() {
            Some(statement) => self.pool.begin_with(statement).await,
            None => self.pool.begin().await,
        };
        tx.map_err(|source| DatabaseError::TransactionFailed { source })
    }
}

/// Binds parameters in order.
pub(crate) fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Runs a statement inside an open transaction.
pub(crate) async fn execute_in<O>(
    conn: &mut AnyConnection,
    sql: &str,
    params: &[SqlValue],
    operation: O,
) -> Result<u64, DatabaseError>
where
    O: FnOnce() -> DbOperation,
{
    bind_all(sqlx::query(sql), params)
        .execute(&mut *conn)
        .await
        .map(|done| done.rows_affected())
        .map_err(|source| DatabaseError::QueryFailed {
            operation: operation(),
            sql: sql.to_string(),
            source,
        })
}

/// Fetches rows inside an open transaction.
pub(crate) async fn fetch_in<O>(
    conn: &mut AnyConnection,
    sql: &str,
    params: &[SqlValue],
    operation: O,
) -> Result<Vec<AnyRow>, DatabaseError>
where
    O: FnOnce() -> DbOperation,
{
    bind_all(sqlx::query(sql), params)
        .fetch_all(&mut *conn)
        .await
        .map_err(|source| DatabaseError::QueryFailed {
            operation: operation(),
            sql: sql.to_string(),
            source,
        })
}

/// The id from the first row of an `INSERT ... RETURNING id`.
pub(crate) fn returned_id(rows: &[AnyRow]) -> Result<i64, DatabaseError> {
    let row = rows.first().ok_or_else(|| DatabaseError::Decode {
        column: "id".to_string(),
        source: sqlx::Error::RowNotFound,
    })?;
    column::<i64, _>(row, 0)
}

/// Reads one column of a row.
pub(crate) fn column<'r, T, I>(row: &'r AnyRow, index: I) -> Result<T, DatabaseError>
where
    T: sqlx::Decode<'r, Any> + sqlx::Type<Any>,
    I: ColumnIndex<AnyRow> + Debug,
{
    let name = format!("{index:?}");
    sqlx::Row::try_get(row, index).map_err(|source| DatabaseError::Decode {
        column: name,
        source,
    })
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A general SQL query failure, with the operation and statement that failed.
    #[error("Query failed during {operation:?}: sql={sql}")]
    QueryFailed {
        operation: DbOperation,
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    /// A failure to begin or commit a transaction.
    #[error("Failed to operate transaction")]
    TransactionFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to connect to {url}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to decode column {column}")]
    Decode {
        column: String,
        #[source]
        source: sqlx::Error,
    },
}

/// The database operation being performed, attached to [`DatabaseError::QueryFailed`].
#[derive(Debug)]
pub enum DbOperation {
    Migrate,
    /// SELECT / INSERT INTO tags while materializing a tag and its ancestors
    EnsureTag { tag: String },
    /// SELECT FROM tags by key range
    ResolveTag { tag: String },
    DescribeTag { tag: String },
    /// UPDATE / DELETE while moving or merging a subtree
    MoveTag { from: String, to: String },
    RemoveTag { tag: String },
    QueryTags,
    CountTags,
    /// INSERT INTO image_tags
    TagImage { image: i64, tag: String },
    /// DELETE FROM image_tags WHERE ...
    UntagImage { image: i64, tag: String },
    QueryImageTags { image: i64 },
    /// INSERT INTO images
    InsertImage { path: String },
    /// DELETE FROM images WHERE ...
    DeleteImage { image: i64 },
    /// Compiled image search
    QueryImages,
    CountImages,
}

impl DatabaseError {
    fn source_error(&self) -> &sqlx::Error {
        match self {
            DatabaseError::QueryFailed { source, .. }
            | DatabaseError::TransactionFailed { source }
            | DatabaseError::Connect { source, .. }
            | DatabaseError::Decode { source, .. } => source,
        }
    }

    fn is_retryable(&self) -> bool {
        match self.source_error() {
            sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::PoolTimedOut => true,
            // SQLITE_BUSY and its extended codes
            sqlx::Error::Database(e) => matches!(e.code().as_deref(), Some("5" | "261" | "517")),
            _ => false,
        }
    }

    /// Whether the failure is a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self.source_error() {
            sqlx::Error::Database(e) => e.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Database;
    use crate::{config::Config, dialect::Backend};
    use sqlx::any::AnyPoolOptions;

    /// Returns a migrated in-memory SQLite database.
    ///
    /// The pool holds a single connection that never expires, since every new
    /// connection to `sqlite::memory:` would open a different, empty database.
    pub(crate) async fn memory() -> Database {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        Database::with_migration(pool, Backend::Sqlite).await.unwrap()
    }

    /// Returns a migrated SQLite database stored under `dir`, pooled over `connections`.
    pub(crate) async fn file(dir: &std::path::Path, connections: u32) -> Database {
        let url = format!("sqlite://{}?mode=rwc", dir.join("catalog.sqlite3").display());

        Database::connect(&Config::new().database_url(url).max_connections(connections))
            .await
            .unwrap()
    }
}
