use chrono::{DateTime, Utc};
use sqlx::{Executor, Result, Sqlite};

use super::{FaceRecord, RowStats};
use crate::fingerprint::ImageFingerprint;

const FACE_COLUMNS: &str = "id, content_hash, average_hash, perceptual_hash, source_uri, \
                            discovered_at, model_version, tombstoned";

/// 添加人脸记录，id 必须与向量所在行一致
pub async fn add_face<'c, E>(
    executor: E,
    id: i64,
    fingerprint: &ImageFingerprint,
    source_uri: &str,
    discovered_at: DateTime<Utc>,
    model_version: &str,
) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO face (id, content_hash, average_hash, perceptual_hash, source_uri, discovered_at, model_version)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(&fingerprint.content_hash)
    .bind(&fingerprint.average_hash)
    .bind(&fingerprint.perceptual_hash)
    .bind(source_uri)
    .bind(discovered_at)
    .bind(model_version)
    .execute(executor)
    .await?;
    Ok(())
}

/// 查找未删除的同源同内容记录
pub async fn find_face<'c, E>(executor: E, content_hash: &str, source_uri: &str) -> Result<Option<i64>>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_scalar(
        r#"
        SELECT id FROM face WHERE content_hash = ? AND source_uri = ? AND tombstoned = 0
        "#,
    )
    .bind(content_hash)
    .bind(source_uri)
    .fetch_optional(executor)
    .await
}

pub async fn get_face<'c, E>(executor: E, id: i64) -> Result<Option<FaceRecord>>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_as(&format!("SELECT {FACE_COLUMNS} FROM face WHERE id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// 标记为已删除，向量行保留，查询时跳过
pub async fn tombstone_face<'c, E>(executor: E, id: i64) -> Result<bool>
where
    E: Executor<'c, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE face SET tombstoned = 1 WHERE id = ? AND tombstoned = 0")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn tombstoned_ids<'c, E>(executor: E) -> Result<Vec<i64>>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT id FROM face WHERE tombstoned = 1").fetch_all(executor).await
}

pub async fn row_stats<'c, E>(executor: E) -> Result<RowStats>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_as("SELECT COUNT(*) AS count, MAX(id) AS max_id FROM face").fetch_one(executor).await
}
