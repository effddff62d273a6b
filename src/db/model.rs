use chrono::{DateTime, Utc};

use crate::fingerprint::ImageFingerprint;

/// 人脸元数据记录
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FaceRecord {
    /// 向量文件中的行号
    pub id: i64,
    /// 图片 blake3 哈希
    pub content_hash: String,
    pub average_hash: String,
    pub perceptual_hash: String,
    /// 图片来源
    pub source_uri: String,
    pub discovered_at: DateTime<Utc>,
    /// 生成向量的模型版本
    pub model_version: String,
    pub tombstoned: bool,
}

impl FaceRecord {
    pub fn fingerprint(&self) -> ImageFingerprint {
        ImageFingerprint {
            content_hash: self.content_hash.clone(),
            average_hash: self.average_hash.clone(),
            perceptual_hash: self.perceptual_hash.clone(),
        }
    }
}

/// 元数据与向量行数的对账结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct RowStats {
    pub count: i64,
    pub max_id: Option<i64>,
}
