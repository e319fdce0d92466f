//! Durable key-value persistence.
//!
//! Everything the gateway persists (credentials, API keys, config, stats,
//! request logs, compression summaries) is namespaced JSON in one store.
//! The [`KeyValueStore`] trait is the seam: the default backend is a
//! single-table SQLite database via sqlx, but anything honoring the CRUD
//! contract slots in.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub const NS_CREDENTIALS: &str = "credentials";
pub const NS_APIKEYS: &str = "apikeys";
pub const NS_CONFIG: &str = "config";
pub const NS_STATS: &str = "stats";
pub const NS_LOGS: &str = "logs";
pub const NS_SUMMARIES: &str = "summaries";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, ns: &str, key: &str, value: &Value) -> anyhow::Result<()>;
    async fn get(&self, ns: &str, key: &str) -> anyhow::Result<Option<Value>>;
    async fn delete(&self, ns: &str, key: &str) -> anyhow::Result<bool>;
    async fn list(&self, ns: &str) -> anyhow::Result<Vec<(String, Value)>>;
    /// Delete up to `limit` entries in `ns` last updated before
    /// `cutoff_epoch_secs`. Returns how many went away.
    async fn prune_older_than(
        &self,
        ns: &str,
        cutoff_epoch_secs: i64,
        limit: u32,
    ) -> anyhow::Result<u64>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                ns TEXT NOT NULL,
                k TEXT NOT NULL,
                v TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (ns, k)
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::connect("sqlite::memory:").await
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn put(&self, ns: &str, key: &str, value: &Value) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (ns, k, v, updated_at) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (ns, k) DO UPDATE SET v = excluded.v, updated_at = excluded.updated_at
            "#,
        )
        .bind(ns)
        .bind(key)
        .bind(value.to_string())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, ns: &str, key: &str) -> anyhow::Result<Option<Value>> {
        let row = sqlx::query("SELECT v FROM kv WHERE ns = ?1 AND k = ?2")
            .bind(ns)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| serde_json::from_str(&r.get::<String, _>(0)).ok()))
    }

    async fn delete(&self, ns: &str, key: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE ns = ?1 AND k = ?2")
            .bind(ns)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, ns: &str) -> anyhow::Result<Vec<(String, Value)>> {
        let rows = sqlx::query("SELECT k, v FROM kv WHERE ns = ?1 ORDER BY k")
            .bind(ns)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let key: String = r.get(0);
                let value: String = r.get(1);
                serde_json::from_str(&value).ok().map(|v| (key, v))
            })
            .collect())
    }

    async fn prune_older_than(
        &self,
        ns: &str,
        cutoff_epoch_secs: i64,
        limit: u32,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM kv WHERE rowid IN (
                SELECT rowid FROM kv
                WHERE ns = ?1 AND updated_at < ?2
                ORDER BY updated_at ASC
                LIMIT ?3
            )
            "#,
        )
        .bind(ns)
        .bind(cutoff_epoch_secs)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
