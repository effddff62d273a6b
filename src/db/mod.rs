//! 人脸元数据库
//!
//! 每条记录的 ID 即向量文件中的行号，见 [`crate::index`]

use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

pub mod crud;
pub mod model;

pub use model::*;

pub type Database = SqlitePool;

/// 打开元数据库并执行迁移
pub async fn init_db(filename: impl AsRef<Path>) -> Result<Database, sqlx::Error> {
    let filename = filename.as_ref();
    info!("打开元数据库: {}", filename.display());

    let options = SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // 多个进程同时读写同一个库时等待写锁，而不是立刻返回 SQLITE_BUSY
        .busy_timeout(Duration::from_secs(5))
        .filename(filename)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(num_cpus::get().max(4) as u32)
        .connect_with(options)
        .await?;

    sqlx::migrate!().run(&pool).await?;
    debug!("元数据库迁移完成");

    Ok(pool)
}

/// 把 WAL 中的内容写回主库并清空 WAL
pub async fn checkpoint(db: &Database) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(db).await?;
    Ok(())
}
