//! SQLite-backed document storage.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::error::{Error, Result};

use super::{
    Condition, Database, DbMode, DbSession, DeletedFilter, DocumentRow, Operator, OrderField,
    SelectQuery, contains_pattern, validate_identifier, value_as_text,
};

const COLUMNS: &str = "key, body, version, created, modified, deleted";

/// SQLite-backed [`Database`].
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Configuration(format!("failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database.
    ///
    /// Limited to a single connection that is never recycled; an in-memory
    /// database lives only as long as its connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Connect from a `sqlite:` URL. `sqlite::memory:` yields [`in_memory`](Self::in_memory).
    pub async fn connect(url: &str) -> Result<Self> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        validate_identifier(table)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created TEXT NOT NULL,
                modified TEXT NOT NULL,
                deleted BOOLEAN NOT NULL DEFAULT 0
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn acquire(&self, mode: DbMode) -> Result<Box<dyn DbSession>> {
        let conn = match mode {
            DbMode::Task => Conn::Task(self.pool.acquire().await?),
            DbMode::Transaction => Conn::Transaction(self.pool.begin().await?),
        };
        Ok(Box::new(SqliteSession { conn }))
    }
}

enum Conn {
    Task(PoolConnection<Sqlite>),
    Transaction(Transaction<'static, Sqlite>),
}

struct SqliteSession {
    conn: Conn,
}

impl SqliteSession {
    fn conn(&mut self) -> &mut SqliteConnection {
        match &mut self.conn {
            Conn::Task(c) => &mut **c,
            Conn::Transaction(t) => &mut **t,
        }
    }
}

fn push_scalar(qb: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Bool(b) => qb.push_bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => qb.push_bind(i),
            None => qb.push_bind(n.as_f64().unwrap_or_default()),
        },
        other => qb.push_bind(value_as_text(other)),
    };
}

fn push_field(qb: &mut QueryBuilder<'_, Sqlite>, field: &str) {
    qb.push("json_extract(body, ")
        .push_bind(format!("$.{}", field))
        .push(")");
}

fn push_where(qb: &mut QueryBuilder<'_, Sqlite>, query: &SelectQuery) {
    qb.push(" WHERE 1 = 1");
    match query.deleted {
        DeletedFilter::Exclude => {
            qb.push(" AND deleted = ").push_bind(false);
        }
        DeletedFilter::Only => {
            qb.push(" AND deleted = ").push_bind(true);
        }
        DeletedFilter::Include => {}
    }

    for condition in &query.conditions {
        match condition {
            Condition::KeyIn(keys) if keys.is_empty() => {
                qb.push(" AND 1 = 0");
            }
            Condition::KeyIn(keys) => {
                qb.push(" AND key IN (");
                let mut list = qb.separated(", ");
                for key in keys {
                    list.push_bind(key.clone());
                }
                qb.push(")");
            }
            Condition::ModifiedSince(since) => {
                qb.push(" AND modified >= ").push_bind(*since);
            }
            Condition::Field { field, op, value } => {
                qb.push(" AND ");
                match (op, value) {
                    (Operator::Eq, Value::Null) => {
                        push_field(qb, field);
                        qb.push(" IS NULL");
                    }
                    (Operator::NotEq, _) => {
                        push_field(qb, field);
                        qb.push(" IS NOT ");
                        push_scalar(qb, value);
                    }
                    (Operator::In, Value::Array(items)) if items.is_empty() => {
                        qb.push("1 = 0");
                    }
                    (Operator::In, Value::Array(items)) => {
                        push_field(qb, field);
                        qb.push(" IN (");
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                qb.push(", ");
                            }
                            push_scalar(qb, item);
                        }
                        qb.push(")");
                    }
                    (Operator::Contains, _) => {
                        qb.push("LOWER(");
                        push_field(qb, field);
                        qb.push(") LIKE ")
                            .push_bind(contains_pattern(&value_as_text(value)))
                            .push(" ESCAPE '\\'");
                    }
                    _ => {
                        push_field(qb, field);
                        qb.push(" ").push(op.sql()).push(" ");
                        push_scalar(qb, value);
                    }
                }
            }
        }
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Sqlite>, query: &SelectQuery) {
    let direction = if query.descending { " DESC" } else { " ASC" };
    qb.push(" ORDER BY ");
    for field in &query.order_by {
        match field {
            OrderField::Key => continue,
            OrderField::Created => {
                qb.push("created");
            }
            OrderField::Modified => {
                qb.push("modified");
            }
            OrderField::Property(name) => push_field(qb, name),
        }
        qb.push(direction).push(", ");
    }
    qb.push("key").push(direction);
}

#[async_trait]
impl DbSession for SqliteSession {
    fn mode(&self) -> DbMode {
        match self.conn {
            Conn::Task(_) => DbMode::Task,
            Conn::Transaction(_) => DbMode::Transaction,
        }
    }

    async fn fetch(&mut self, table: &str, key: &str) -> Result<Option<DocumentRow>> {
        validate_identifier(table)?;
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {COLUMNS} FROM {table} WHERE key = ?"
        ))
        .bind(key)
        .fetch_optional(self.conn())
        .await?;
        Ok(row)
    }

    async fn insert(&mut self, table: &str, key: &str, body: &Value) -> Result<DocumentRow> {
        validate_identifier(table)?;
        let now = Utc::now();
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            INSERT INTO {table} (key, body, version, created, modified, deleted)
            VALUES (?, ?, 1, ?, ?, 0)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(key)
        .bind(serde_json::to_string(body)?)
        .bind(now)
        .bind(now)
        .fetch_one(self.conn())
        .await?;
        Ok(row)
    }

    async fn update(
        &mut self,
        table: &str,
        key: &str,
        body: &Value,
    ) -> Result<Option<DocumentRow>> {
        validate_identifier(table)?;
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            UPDATE {table}
            SET body = ?, version = version + 1, modified = ?
            WHERE key = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(serde_json::to_string(body)?)
        .bind(Utc::now())
        .bind(key)
        .fetch_optional(self.conn())
        .await?;
        Ok(row)
    }

    async fn soft_delete(&mut self, table: &str, key: &str) -> Result<bool> {
        validate_identifier(table)?;
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET deleted = 1, version = version + 1, modified = ?
            WHERE key = ? AND deleted = 0
            "#
        ))
        .bind(Utc::now())
        .bind(key)
        .execute(self.conn())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn select(&mut self, table: &str, query: &SelectQuery) -> Result<Vec<DocumentRow>> {
        validate_identifier(table)?;
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM {table}"));
        push_where(&mut qb, query);
        push_order(&mut qb, query);
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        } else if query.offset > 0 {
            qb.push(" LIMIT -1");
        }
        if query.offset > 0 {
            qb.push(" OFFSET ").push_bind(i64::from(query.offset));
        }

        let rows = qb
            .build_query_as::<DocumentRow>()
            .fetch_all(self.conn())
            .await?;
        Ok(rows)
    }

    async fn count(&mut self, table: &str, query: &SelectQuery) -> Result<i64> {
        validate_identifier(table)?;
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {table}"));
        push_where(&mut qb, query);
        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(self.conn())
            .await?;
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if let Conn::Transaction(tx) = self.conn {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        if let Conn::Transaction(tx) = self.conn {
            tx.rollback().await?;
        }
        Ok(())
    }
}
