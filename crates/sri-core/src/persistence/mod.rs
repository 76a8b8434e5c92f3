//! Persistence interfaces and backends for sri-core.
//!
//! Every resource lives in its own table of JSON documents:
//!
//! | Column | Meaning |
//! |--------|---------|
//! | `key` | primary key, last path segment of the permalink |
//! | `body` | JSON document (without `$$meta`) |
//! | `version` | starts at 1, incremented by every write |
//! | `created` / `modified` | timestamps |
//! | `deleted` | soft-delete marker |
//!
//! A request never talks to a pool directly. The lifecycle driver acquires one
//! [`DbSession`] (a plain connection for read-only requests, a transaction
//! otherwise) and shares it with every job of the request through a
//! [`DbHandle`].

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresDatabase;
pub use self::sqlite::SqliteDatabase;

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// How a request uses the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    /// Plain connection, no transaction. Used when every operation is read-only.
    Task,
    /// One transaction, committed or rolled back exactly once.
    Transaction,
}

/// Stored document as read from a resource table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRow {
    /// Primary key.
    pub key: String,
    /// JSON document text.
    pub body: String,
    /// Write counter.
    pub version: i64,
    /// When the document was inserted.
    pub created: DateTime<Utc>,
    /// When the document was last written.
    pub modified: DateTime<Utc>,
    /// Soft-delete marker.
    pub deleted: bool,
}

impl DocumentRow {
    /// Parse the stored JSON document.
    pub fn document(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Comparison operators understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `=`
    Eq,
    /// null-safe `<>`
    NotEq,
    /// `>`
    Greater,
    /// `>=`
    GreaterOrEqual,
    /// `<`
    Less,
    /// `<=`
    LessOrEqual,
    /// membership in a list (value is a JSON array)
    In,
    /// case-insensitive substring match
    Contains,
}

impl Operator {
    /// SQL comparison token for the scalar operators.
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::In => "IN",
            Self::Contains => "LIKE",
        }
    }
}

/// One WHERE-clause fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Compare a top-level document property.
    Field {
        /// Property name.
        field: String,
        /// Operator.
        op: Operator,
        /// Typed comparison value (array for [`Operator::In`]).
        value: Value,
    },
    /// Restrict to these keys.
    KeyIn(Vec<String>),
    /// Documents written at or after this instant.
    ModifiedSince(DateTime<Utc>),
}

/// Soft-delete visibility of a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletedFilter {
    /// Only live documents (default).
    #[default]
    Exclude,
    /// Only soft-deleted documents.
    Only,
    /// Both.
    Include,
}

/// Sort key of a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderField {
    /// The `key` column.
    Key,
    /// The `created` column.
    Created,
    /// The `modified` column.
    Modified,
    /// A top-level document property.
    Property(String),
}

impl OrderField {
    /// Map an `orderBy` entry to a sort key.
    pub fn parse(name: &str) -> Self {
        match name {
            "key" => Self::Key,
            "$$meta.created" => Self::Created,
            "$$meta.modified" => Self::Modified,
            other => Self::Property(other.to_string()),
        }
    }
}

/// Backend-neutral SELECT description built by the list handler and filters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    /// AND-ed conditions.
    pub conditions: Vec<Condition>,
    /// Sort keys; `key` is always appended as tie-break.
    pub order_by: Vec<OrderField>,
    /// Sort descending.
    pub descending: bool,
    /// Page size.
    pub limit: Option<u32>,
    /// Rows to skip.
    pub offset: u32,
    /// Soft-delete visibility.
    pub deleted: DeletedFilter,
}

impl SelectQuery {
    /// Empty query: every live document ordered by key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition.
    pub fn push(&mut self, condition: Condition) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    /// Add a property comparison.
    pub fn where_field(&mut self, field: impl Into<String>, op: Operator, value: Value) -> &mut Self {
        self.push(Condition::Field {
            field: field.into(),
            op,
            value,
        })
    }
}

/// A connection pool that hands out sessions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Short backend name for logs (`sqlite`, `postgres`).
    fn backend(&self) -> &'static str;

    /// Create the resource table if it does not exist.
    async fn ensure_table(&self, table: &str) -> Result<()>;

    /// Acquire a task (plain connection) or a transaction.
    async fn acquire(&self, mode: DbMode) -> Result<Box<dyn DbSession>>;
}

/// One task or transaction.
#[allow(missing_docs)]
#[async_trait]
pub trait DbSession: Send {
    fn mode(&self) -> DbMode;

    async fn fetch(&mut self, table: &str, key: &str) -> Result<Option<DocumentRow>>;

    async fn insert(&mut self, table: &str, key: &str, body: &Value) -> Result<DocumentRow>;

    /// Replace the body and bump the version. `None` when the key does not exist.
    async fn update(&mut self, table: &str, key: &str, body: &Value)
    -> Result<Option<DocumentRow>>;

    /// Mark as deleted. `false` when the key is missing or already deleted.
    async fn soft_delete(&mut self, table: &str, key: &str) -> Result<bool>;

    async fn select(&mut self, table: &str, query: &SelectQuery) -> Result<Vec<DocumentRow>>;

    async fn count(&mut self, table: &str, query: &SelectQuery) -> Result<i64>;

    /// Commit a transaction; releases a task.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back a transaction; releases a task.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// How a request's session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Transaction committed.
    Committed,
    /// Transaction rolled back.
    RolledBack,
    /// Task connection handed back to the pool.
    Released,
}

impl Completion {
    /// Timing entry name.
    pub fn timing_name(self) -> &'static str {
        match self {
            Self::Committed => "db-commit",
            Self::RolledBack => "db-rollback",
            Self::Released => "db-release",
        }
    }
}

/// Shared, cloneable access to the request's single session.
///
/// Every job of a request holds a clone. Queries are serialized on an async
/// mutex; isolation between conflicting writes is left to the database.
#[derive(Clone)]
pub struct DbHandle {
    mode: DbMode,
    session: Arc<Mutex<Option<Box<dyn DbSession>>>>,
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle").field("mode", &self.mode).finish()
    }
}

fn finished() -> Error {
    Error::Internal("database session already finished".to_string())
}

impl DbHandle {
    /// Wrap a freshly acquired session.
    pub fn new(session: Box<dyn DbSession>) -> Self {
        Self {
            mode: session.mode(),
            session: Arc::new(Mutex::new(Some(session))),
        }
    }

    /// Task or transaction.
    pub fn mode(&self) -> DbMode {
        self.mode
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.mode {
            DbMode::Transaction => Ok(()),
            DbMode::Task => Err(Error::Internal(
                "write attempted on a read-only task".to_string(),
            )),
        }
    }

    /// Fetch one document by key.
    pub async fn fetch(&self, table: &str, key: &str) -> Result<Option<DocumentRow>> {
        let mut guard = self.session.lock().await;
        guard.as_mut().ok_or_else(finished)?.fetch(table, key).await
    }

    /// Insert a new document.
    pub async fn insert(&self, table: &str, key: &str, body: &Value) -> Result<DocumentRow> {
        self.ensure_writable()?;
        let mut guard = self.session.lock().await;
        guard.as_mut().ok_or_else(finished)?.insert(table, key, body).await
    }

    /// Replace a document.
    pub async fn update(&self, table: &str, key: &str, body: &Value) -> Result<Option<DocumentRow>> {
        self.ensure_writable()?;
        let mut guard = self.session.lock().await;
        guard.as_mut().ok_or_else(finished)?.update(table, key, body).await
    }

    /// Soft-delete a document.
    pub async fn soft_delete(&self, table: &str, key: &str) -> Result<bool> {
        self.ensure_writable()?;
        let mut guard = self.session.lock().await;
        guard.as_mut().ok_or_else(finished)?.soft_delete(table, key).await
    }

    /// Run a select.
    pub async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<DocumentRow>> {
        let mut guard = self.session.lock().await;
        guard.as_mut().ok_or_else(finished)?.select(table, query).await
    }

    /// Count the rows a select would return without paging.
    pub async fn count(&self, table: &str, query: &SelectQuery) -> Result<i64> {
        let mut guard = self.session.lock().await;
        guard.as_mut().ok_or_else(finished)?.count(table, query).await
    }

    /// End the session: commit when `commit` is set, roll back otherwise.
    ///
    /// Tasks are always just released. A second call fails.
    pub async fn finish(&self, commit: bool) -> Result<Completion> {
        let session = self.session.lock().await.take().ok_or_else(finished)?;
        match (session.mode(), commit) {
            (DbMode::Task, _) => {
                session.rollback().await?;
                Ok(Completion::Released)
            }
            (DbMode::Transaction, true) => {
                session.commit().await?;
                Ok(Completion::Committed)
            }
            (DbMode::Transaction, false) => {
                session.rollback().await?;
                Ok(Completion::RolledBack)
            }
        }
    }
}

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid identifier regex"));

/// Table and property names must be plain identifiers.
///
/// Table names are spliced into SQL, so this check is what keeps them safe.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern and wrap it in `%…%`.
pub(crate) fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Text form used when a LIKE or string comparison needs a plain string.
pub(crate) fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
