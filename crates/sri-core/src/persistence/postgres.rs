// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed document storage.
//!
//! Bodies are stored as text and cast to `jsonb` when filtering, so both
//! backends share one table shape. Comparison values are bound as `jsonb`,
//! which keeps numbers numeric and strings textual without per-type casts.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};

use crate::error::Result;

use super::{
    Condition, Database, DbMode, DbSession, DeletedFilter, DocumentRow, Operator, OrderField,
    SelectQuery, contains_pattern, validate_identifier, value_as_text,
};

const COLUMNS: &str = "key, body, version, created, modified, deleted";

/// PostgreSQL-backed [`Database`].
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    /// Create a new Postgres-backed database from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with default pool settings.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        validate_identifier(table)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                version BIGINT NOT NULL DEFAULT 1,
                created TIMESTAMPTZ NOT NULL,
                modified TIMESTAMPTZ NOT NULL,
                deleted BOOLEAN NOT NULL DEFAULT FALSE
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
        Ok(Box::new(PostgresSession { conn }))
    }
}

enum Conn {
    Task(PoolConnection<Postgres>),
    Transaction(Transaction<'static, Postgres>),
}

struct PostgresSession {
    conn: Conn,
}

impl PostgresSession {
    fn conn(&mut self) -> &mut PgConnection {
        match &mut self.conn {
            Conn::Task(c) => &mut **c,
            Conn::Transaction(t) => &mut **t,
        }
    }
}

fn push_json_field(qb: &mut QueryBuilder<'_, Postgres>, field: &str) {
    qb.push("(body::jsonb -> ").push_bind(field.to_string()).push(")");
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, query: &SelectQuery) {
    qb.push(" WHERE TRUE");
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
            Condition::KeyIn(keys) => {
                qb.push(" AND key = ANY(").push_bind(keys.clone()).push(")");
            }
            Condition::ModifiedSince(since) => {
                qb.push(" AND modified >= ").push_bind(*since);
            }
            Condition::Field { field, op, value } => {
                qb.push(" AND ");
                match (op, value) {
                    (Operator::Eq, Value::Null) => {
                        push_json_field(qb, field);
                        qb.push(" IS NULL");
                    }
                    (Operator::NotEq, _) => {
                        push_json_field(qb, field);
                        qb.push(" IS DISTINCT FROM ")
                            .push_bind(Json(value.clone()))
                            .push("::jsonb");
                    }
                    (Operator::In, Value::Array(items)) => {
                        push_json_field(qb, field);
                        qb.push(" = ANY(")
                            .push_bind(items.iter().cloned().map(Json).collect::<Vec<_>>())
                            .push("::jsonb[])");
                    }
                    (Operator::Contains, _) => {
                        qb.push("LOWER(body::jsonb ->> ")
                            .push_bind(field.clone())
                            .push(") LIKE ")
                            .push_bind(contains_pattern(&value_as_text(value)))
                            .push(" ESCAPE '\\'");
                    }
                    _ => {
                        push_json_field(qb, field);
                        qb.push(" ")
                            .push(op.sql())
                            .push(" ")
                            .push_bind(Json(value.clone()))
                            .push("::jsonb");
                    }
                }
            }
        }
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, query: &SelectQuery) {
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
            OrderField::Property(name) => push_json_field(qb, name),
        }
        qb.push(direction).push(", ");
    }
    qb.push("key").push(direction);
}

#[async_trait]
impl DbSession for PostgresSession {
    fn mode(&self) -> DbMode {
        match self.conn {
            Conn::Task(_) => DbMode::Task,
            Conn::Transaction(_) => DbMode::Transaction,
        }
    }

    async fn fetch(&mut self, table: &str, key: &str) -> Result<Option<DocumentRow>> {
        validate_identifier(table)?;
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {COLUMNS} FROM {table} WHERE key = $1"
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
            VALUES ($1, $2, 1, $3, $3, FALSE)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(key)
        .bind(serde_json::to_string(body)?)
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
            SET body = $1, version = version + 1, modified = $2
            WHERE key = $3
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
            SET deleted = TRUE, version = version + 1, modified = $1
            WHERE key = $2 AND deleted = FALSE
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
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM {table}"));
        push_where(&mut qb, query);
        push_order(&mut qb, query);
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
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
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {table}"));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::DbHandle;
    use serde_json::json;
    use uuid::Uuid;

    // Helper to get a test database with a fresh table
    async fn test_db() -> Option<(PostgresDatabase, String)> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let db = PostgresDatabase::connect(&url).await.ok()?;
        let table = format!("t_{}", Uuid::new_v4().simple());
        db.ensure_table(&table).await.ok()?;
        Some((db, table))
    }

    async fn drop_table(db: &PostgresDatabase, table: &str) {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(db.pool())
            .await
            .ok();
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let Some((db, table)) = test_db().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let handle = DbHandle::new(db.acquire(DbMode::Transaction).await.unwrap());
        let row = handle.insert(&table, "a", &json!({"n": 1})).await.unwrap();
        assert_eq!(row.version, 1);
        let row = handle
            .update(&table, "a", &json!({"n": 2}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.version, 2);
        assert!(handle.soft_delete(&table, "a").await.unwrap());
        handle.finish(true).await.unwrap();

        let handle = DbHandle::new(db.acquire(DbMode::Task).await.unwrap());
        let row = handle.fetch(&table, "a").await.unwrap().unwrap();
        assert!(row.deleted);
        assert_eq!(row.version, 3);
        handle.finish(false).await.unwrap();

        drop_table(&db, &table).await;
    }

    #[tokio::test]
    async fn test_select_with_jsonb_filters() {
        let Some((db, table)) = test_db().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let handle = DbHandle::new(db.acquire(DbMode::Transaction).await.unwrap());
        handle
            .insert(&table, "a", &json!({"name": "Ann", "age": 31}))
            .await
            .unwrap();
        handle
            .insert(&table, "b", &json!({"name": "Bob", "age": 9}))
            .await
            .unwrap();

        let mut query = SelectQuery::new();
        query.where_field("age", Operator::Greater, json!(10));
        let rows = handle.select(&table, &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "a");

        let mut query = SelectQuery::new();
        query.where_field("name", Operator::In, json!(["Bob", "Zed"]));
        assert_eq!(handle.count(&table, &query).await.unwrap(), 1);

        let mut query = SelectQuery::new();
        query.where_field("name", Operator::Contains, json!("an"));
        assert_eq!(handle.count(&table, &query).await.unwrap(), 1);

        handle.finish(false).await.unwrap();
        drop_table(&db, &table).await;
    }
}
