use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::info;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::{Error, Result};

/// 共享计数存储，语义与 Redis 的 INCR / EXPIRE 一致
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 原子地自增并返回自增后的值，不存在或已过期的键从 1 开始
    async fn incr(&self, key: &str) -> Result<u64>;

    /// 设置键的过期时间
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// 键的剩余存活时间，键不存在或没有设置过期时间时返回 None
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

/// 基于 SQLite 文件的共享计数存储
///
/// 同一主机上的多个进程打开同一个文件即可共享计数，
/// 每个操作都是单条语句，由 SQLite 的写锁保证原子性
pub struct SqliteCounterStore {
    pool: SqlitePool,
}

impl SqliteCounterStore {
    pub async fn open(filename: impl AsRef<Path>) -> Result<Self> {
        let filename = filename.as_ref();
        info!("打开共享计数存储: {}", filename.display());

        let options = SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(200))
            .filename(filename)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_millis(500))
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counter (
                key TEXT PRIMARY KEY NOT NULL,
                count INTEGER NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn incr(&self, key: &str) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        // NOTE: SET 子句中引用的列均为更新前的旧值
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO counter (key, count, expires_at) VALUES (?1, 1, NULL)
            ON CONFLICT(key) DO UPDATE SET
                count = CASE WHEN expires_at IS NOT NULL AND expires_at <= ?2 THEN 1 ELSE count + 1 END,
                expires_at = CASE WHEN expires_at IS NOT NULL AND expires_at <= ?2 THEN NULL ELSE expires_at END
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::CounterStore(e.to_string()))?;
        Ok(count as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        sqlx::query("UPDATE counter SET expires_at = ? WHERE key = ?")
            .bind(expires_at)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::CounterStore(e.to_string()))?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Utc::now().timestamp_millis();
        let expires_at: Option<Option<i64>> =
            sqlx::query_scalar("SELECT expires_at FROM counter WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::CounterStore(e.to_string()))?;
        Ok(expires_at.flatten().map(|t| Duration::from_millis((t - now).max(0) as u64)))
    }
}
