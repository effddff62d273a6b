use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::spawn_blocking;
use utoipa::ToSchema;

use crate::config::{ConfDir, FingerprintOptions, IndexOptions};
use crate::db::init_db;
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::fingerprint::{HASH_BITS, ImageFingerprint, fingerprint};
use crate::hamming::similarity;
use crate::index::{AddOutcome, FaceIndex, FaceMetadata};
use crate::metrics;

/// 为了在按内容去重后仍能凑满 top_k，向索引多取的倍数
const OVERFETCH: usize = 4;

/// 在阻塞线程池中计算指纹
async fn fingerprint_blocking(data: &[u8]) -> Result<ImageFingerprint> {
    let data = data.to_vec();
    spawn_blocking(move || fingerprint(&data)).await?
}

/// 入库流程中的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Decode,
    Embed,
    Index,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Embed => "embed",
            Self::Index => "index",
        }
    }
}

/// 单张图片的入库结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum IngestOutcome {
    Indexed { id: i64 },
    /// 相同内容和来源已经入库
    Duplicate { id: i64 },
    /// 图片本身的问题，在某个阶段被拒绝
    Rejected { stage: IngestStage, reason: String },
}

impl IngestOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Indexed { .. } => "indexed",
            Self::Duplicate { .. } => "duplicate",
            Self::Rejected { stage, .. } => stage.as_str(),
        }
    }

    fn rejected(stage: IngestStage, err: Error) -> Self {
        Self::Rejected { stage, reason: err.to_string() }
    }
}

/// 搜索结果
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SearchHit {
    pub id: i64,
    /// 相似度，范围 0 到 1
    pub similarity_score: f32,
    pub source_uri: String,
    pub discovered_at: DateTime<Utc>,
    /// pHash 是否也判定为相似
    pub corroborated: bool,
}

/// 人脸库：指纹、向量化与索引的组合
pub struct FaceDB {
    index: FaceIndex,
    embedder: Arc<dyn Embedder>,
    phash_threshold: u32,
}

impl FaceDB {
    pub fn new(index: FaceIndex, embedder: Arc<dyn Embedder>, phash_threshold: u32) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(Error::DimensionMismatch {
                expected: index.dimension(),
                actual: embedder.dimension(),
            });
        }
        Ok(Self { index, embedder, phash_threshold })
    }

    /// 打开配置目录下的人脸库
    pub async fn open(
        conf_dir: &ConfDir,
        index: &IndexOptions,
        fingerprint: &FingerprintOptions,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        std::fs::create_dir_all(conf_dir.path())?;
        let db = init_db(conf_dir.database()).await?;
        let index = FaceIndex::open(db, conf_dir.vectors(), index.dim, index.metric).await?;
        Self::new(index, embedder, fingerprint.phash_threshold)
    }

    pub fn index(&self) -> &FaceIndex {
        &self.index
    }

    /// 入库一张图片
    ///
    /// 图片本身的问题以 [`IngestOutcome::Rejected`] 返回，只有存储层的错误才返回 `Err`
    pub async fn ingest(&self, data: &[u8], source_uri: &str) -> Result<IngestOutcome> {
        let outcome = self.ingest_inner(data, source_uri).await?;
        match &outcome {
            IngestOutcome::Indexed { id } => debug!("入库 {} -> {}", source_uri, id),
            IngestOutcome::Duplicate { id } => debug!("重复图片 {} -> {}", source_uri, id),
            IngestOutcome::Rejected { stage, reason } => {
                info!("{} 在 {} 阶段被拒绝: {}", source_uri, stage.as_str(), reason)
            }
        }
        metrics::inc_ingest(outcome.label());
        Ok(outcome)
    }

    async fn ingest_inner(&self, data: &[u8], source_uri: &str) -> Result<IngestOutcome> {
        let fp = match fingerprint_blocking(data).await {
            Ok(fp) => fp,
            Err(e @ Error::Decode(_)) => return Ok(IngestOutcome::rejected(IngestStage::Decode, e)),
            Err(e) => return Err(e),
        };

        // 在向量化之前先去重，省掉一次模型调用
        if let Some(id) = self.index.contains(&fp.content_hash, source_uri).await? {
            return Ok(IngestOutcome::Duplicate { id });
        }

        let vector = match self.embedder.embed(data).await {
            Ok(vector) => vector,
            Err(e) => return Ok(IngestOutcome::rejected(IngestStage::Embed, e)),
        };

        let metadata = FaceMetadata {
            fingerprint: fp,
            source_uri: source_uri.to_owned(),
            discovered_at: Utc::now(),
            model_version: self.embedder.model_version().to_owned(),
        };
        match self.index.add(&vector, &metadata).await {
            Ok(AddOutcome::Inserted(id)) => Ok(IngestOutcome::Indexed { id }),
            Ok(AddOutcome::Duplicate(id)) => Ok(IngestOutcome::Duplicate { id }),
            Err(e @ (Error::DimensionMismatch { .. } | Error::InvalidArgument(_))) => {
                Ok(IngestOutcome::rejected(IngestStage::Index, e))
            }
            Err(e) => Err(e),
        }
    }

    /// 搜索与图片相似的人脸
    ///
    /// 结果按相似度降序排列，内容相同的结果只保留最好的一个
    pub async fn query(&self, data: &[u8], top_k: usize) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Err(Error::InvalidArgument("top_k 必须大于 0".to_owned()));
        }
        let start = Instant::now();

        let fp = fingerprint_blocking(data).await?;
        let vector = self.embedder.embed(data).await?;
        let neighbors = self.index.search(&vector, top_k.saturating_mul(OVERFETCH)).await?;

        let metric = self.index.metric();
        let mut hits = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            let meta = neighbor.metadata;
            let mut score = metric.score(neighbor.distance);
            let corroborated = match fp.perceptual_distance(&meta.fingerprint) {
                Ok(d) if d <= self.phash_threshold => {
                    score = score.max(similarity(d, HASH_BITS));
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    warn!("记录 {} 的 pHash 无效: {}", neighbor.id, e);
                    false
                }
            };
            hits.push((meta.fingerprint.content_hash, SearchHit {
                id: neighbor.id,
                similarity_score: score,
                source_uri: meta.source_uri,
                discovered_at: meta.discovered_at,
                corroborated,
            }));
        }

        // 稳定排序，分数相同时保持距离顺序
        hits.sort_by(|a, b| b.1.similarity_score.total_cmp(&a.1.similarity_score));
        let mut seen = HashSet::new();
        let hits = hits
            .into_iter()
            .filter(|(content_hash, _)| seen.insert(content_hash.clone()))
            .map(|(_, hit)| hit)
            .take(top_k)
            .collect::<Vec<_>>();

        metrics::inc_search_duration(start.elapsed().as_secs_f32());
        if let Some(best) = hits.first() {
            metrics::inc_search_max_score(best.similarity_score);
        }
        Ok(hits)
    }
}
