//! 人脸向量索引
//!
//! 向量保存在只追加的平面文件中，元数据保存在 SQLite，两者以行号关联。
//! 写入顺序为先落盘向量再写元数据，崩溃后可能在文件末尾留下孤立的向量，
//! 此时 [`FaceIndex::open`] 拒绝加载，需要运行 [`FaceIndex::repair`]。

mod vectors;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::spawn_blocking;

pub use self::vectors::VectorFile;
use crate::db::{self, Database, FaceRecord, crud};
use crate::error::{Error, Result};
use crate::fingerprint::ImageFingerprint;

/// 距离度量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// 余弦距离，向量写入前归一化，距离为 `1 - dot`
    Cosine,
    /// 欧氏距离的平方
    L2sq,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::L2sq => "l2sq",
        }
    }

    fn code(&self) -> u32 {
        match self {
            Self::Cosine => 0,
            Self::L2sq => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Cosine),
            1 => Some(Self::L2sq),
            _ => None,
        }
    }

    /// 写入或查询前的预处理
    pub fn prepare(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidArgument("向量包含 NaN 或无穷大".to_owned()));
        }
        match self {
            Self::Cosine => {
                let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm == 0.0 {
                    return Err(Error::InvalidArgument("零向量无法归一化".to_owned()));
                }
                Ok(vector.iter().map(|x| x / norm).collect())
            }
            Self::L2sq => Ok(vector.to_vec()),
        }
    }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => {
                let dot = a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
                (1.0 - dot).max(0.0)
            }
            Self::L2sq => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        }
    }

    /// 将距离映射到 [0, 1] 的相似度，越大越相似
    pub fn score(&self, distance: f32) -> f32 {
        match self {
            Self::Cosine => (1.0 - distance / 2.0).clamp(0.0, 1.0),
            Self::L2sq => 1.0 / (1.0 + distance.max(0.0)),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 与向量一同保存的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceMetadata {
    pub fingerprint: ImageFingerprint,
    pub source_uri: String,
    pub discovered_at: DateTime<Utc>,
    pub model_version: String,
}

impl From<FaceRecord> for FaceMetadata {
    fn from(record: FaceRecord) -> Self {
        Self {
            fingerprint: record.fingerprint(),
            source_uri: record.source_uri,
            discovered_at: record.discovered_at,
            model_version: record.model_version,
        }
    }
}

/// 搜索结果
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// 向量 ID
    pub id: i64,
    /// 与查询向量的距离
    pub distance: f32,
    pub metadata: FaceMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted(i64),
    /// 相同内容和来源已经存在，返回已有的 ID
    Duplicate(i64),
}

impl AddOutcome {
    pub fn id(&self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) => *id,
        }
    }
}

/// 修复结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// 丢弃的不完整行的字节数
    pub partial_bytes: u64,
    /// 丢弃的没有元数据的向量数
    pub orphan_vectors: u64,
}

struct Rows {
    data: Vec<f32>,
    tombstoned: Vec<bool>,
}

impl Rows {
    /// 精确扫描，返回距离最近的 `top_k` 行，按 (距离, 行号) 升序
    fn nearest(&self, query: &[f32], dim: usize, metric: Metric, top_k: usize) -> Vec<(f32, usize)> {
        let mut hits = self
            .data
            .par_chunks_exact(dim)
            .enumerate()
            .filter(|(i, _)| !self.tombstoned[*i])
            .map(|(i, row)| (metric.distance(query, row), i))
            .collect::<Vec<_>>();
        let cmp = |a: &(f32, usize), b: &(f32, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
        if hits.len() > top_k {
            hits.select_nth_unstable_by(top_k - 1, cmp);
            hits.truncate(top_k);
        }
        hits.sort_unstable_by(cmp);
        hits
    }
}

fn read(rows: &RwLock<Rows>) -> RwLockReadGuard<'_, Rows> {
    rows.read().unwrap_or_else(|e| e.into_inner())
}

/// 在阻塞线程池中修改内存中的行，等待写锁不占用异步线程
async fn update<T, F>(rows: &Arc<RwLock<Rows>>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Rows) -> T + Send + 'static,
{
    let rows = rows.clone();
    Ok(spawn_blocking(move || f(&mut rows.write().unwrap_or_else(|e| e.into_inner()))).await?)
}

/// 持有写锁完成一次写入：查重、追加向量、写元数据、更新内存
async fn append(
    db: Database,
    mut file: OwnedMutexGuard<VectorFile>,
    rows: Arc<RwLock<Rows>>,
    vector: Vec<f32>,
    metadata: FaceMetadata,
) -> Result<AddOutcome> {
    let fp = &metadata.fingerprint;
    if let Some(id) = crud::find_face(&db, &fp.content_hash, &metadata.source_uri).await? {
        return Ok(AddOutcome::Duplicate(id));
    }

    // 文件行数以内存为准
    let loaded = update(&rows, |rows| rows.tombstoned.len() as u64).await?;
    if file.rows() > loaded {
        warn!("向量文件有 {} 行，内存中只有 {} 行，截断多余的行", file.rows(), loaded);
        file.truncate(loaded)?;
    } else if file.rows() < loaded {
        return Err(Error::CorruptIndex(format!(
            "向量文件有 {} 行，内存中有 {} 行",
            file.rows(),
            loaded
        )));
    }

    let row = file.append(&vector)?;
    let id = row as i64;
    let result = crud::add_face(
        &db,
        id,
        fp,
        &metadata.source_uri,
        metadata.discovered_at,
        &metadata.model_version,
    )
    .await;
    if let Err(e) = result {
        warn!("写入元数据失败，回滚向量 {}: {}", id, e);
        file.truncate(row)?;
        return Err(e.into());
    }

    update(&rows, move |rows| {
        rows.data.extend_from_slice(&vector);
        rows.tombstoned.push(false);
    })
    .await?;
    Ok(AddOutcome::Inserted(id))
}

pub struct FaceIndex {
    db: Database,
    dim: usize,
    metric: Metric,
    /// 串行化写入，保证行号与元数据一致
    writer: Arc<Mutex<VectorFile>>,
    rows: Arc<RwLock<Rows>>,
}

impl FaceIndex {
    /// 打开索引，向量数量与元数据不一致时返回 [`Error::CorruptIndex`]
    pub async fn open(
        db: Database,
        path: impl AsRef<Path>,
        dim: usize,
        metric: Metric,
    ) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidArgument("向量维度必须大于 0".to_owned()));
        }
        let path = path.as_ref();
        let (file, data) = VectorFile::open(path, dim, metric)?;

        let stats = crud::row_stats(&db).await?;
        let rows = file.rows() as i64;
        if stats.count != rows || stats.max_id.unwrap_or(-1) != rows - 1 {
            return Err(Error::CorruptIndex(format!(
                "向量文件有 {} 行，元数据有 {} 条",
                rows, stats.count
            )));
        }

        let mut tombstoned = vec![false; rows as usize];
        for id in crud::tombstoned_ids(&db).await? {
            tombstoned[id as usize] = true;
        }
        info!("加载索引: {} 条向量，维度 {}，{}", rows, dim, metric);

        Ok(Self {
            db,
            dim,
            metric,
            writer: Arc::new(Mutex::new(file)),
            rows: Arc::new(RwLock::new(Rows { data, tombstoned })),
        })
    }

    /// 以元数据为准修复向量文件
    ///
    /// 只能丢弃多余的向量，元数据引用了不存在的向量时仍然返回 [`Error::CorruptIndex`]
    pub async fn repair(
        db: &Database,
        path: impl AsRef<Path>,
        dim: usize,
        metric: Metric,
    ) -> Result<RepairReport> {
        let path = path.as_ref();
        let mut report = RepairReport::default();
        if path.exists() {
            report.partial_bytes = VectorFile::truncate_partial(path, dim, metric)?;
        }
        let (mut file, _) = VectorFile::open(path, dim, metric)?;

        let stats = crud::row_stats(db).await?;
        if stats.max_id.unwrap_or(-1) + 1 != stats.count {
            return Err(Error::CorruptIndex("元数据行号不连续，无法自动修复".to_owned()));
        }

        let rows = file.rows();
        let count = stats.count as u64;
        if rows > count {
            warn!("丢弃 {} 条没有元数据的向量", rows - count);
            file.truncate(count)?;
            report.orphan_vectors = rows - count;
        } else if rows < count {
            return Err(Error::CorruptIndex(format!(
                "元数据有 {count} 条，向量文件只有 {rows} 行，无法自动修复"
            )));
        }
        Ok(report)
    }

    fn read_rows(&self) -> RwLockReadGuard<'_, Rows> {
        read(&self.rows)
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// 未删除的向量数量
    pub fn count(&self) -> usize {
        self.read_rows().tombstoned.iter().filter(|t| !**t).count()
    }

    /// 查找相同内容和来源的记录
    pub async fn contains(&self, content_hash: &str, source_uri: &str) -> Result<Option<i64>> {
        Ok(crud::find_face(&self.db, content_hash, source_uri).await?)
    }

    /// 添加向量，相同内容和来源的记录已存在时不重复写入
    ///
    /// 拿到写锁之后的步骤在独立任务中执行，调用方放弃等待时写入仍会完整结束
    pub async fn add(&self, vector: &[f32], metadata: &FaceMetadata) -> Result<AddOutcome> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch { expected: self.dim, actual: vector.len() });
        }
        let vector = self.metric.prepare(vector)?;
        let file = self.writer.clone().lock_owned().await;
        let task = append(self.db.clone(), file, self.rows.clone(), vector, metadata.clone());
        tokio::spawn(task).await?
    }

    /// 精确搜索最近的 `top_k` 个向量，按距离升序排列，距离相同时 ID 小的在前
    pub async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
        if top_k == 0 {
            return Err(Error::InvalidArgument("top_k 必须大于 0".to_owned()));
        }
        if query.len() != self.dim {
            return Err(Error::DimensionMismatch { expected: self.dim, actual: query.len() });
        }
        let query = self.metric.prepare(query)?;

        // 扫描在阻塞线程池中进行，不占用异步运行时
        let (rows, dim, metric) = (self.rows.clone(), self.dim, self.metric);
        let hits = spawn_blocking(move || {
            let guard = read(&rows);
            guard.nearest(&query, dim, metric, top_k)
        })
        .await?;

        let mut neighbors = Vec::with_capacity(hits.len());
        for (distance, i) in hits {
            let id = i as i64;
            let record = crud::get_face(&self.db, id)
                .await?
                .ok_or_else(|| Error::CorruptIndex(format!("向量 {id} 缺少元数据")))?;
            if record.tombstoned {
                continue;
            }
            neighbors.push(Neighbor { id, distance, metadata: record.into() });
        }
        Ok(neighbors)
    }

    /// 标记删除，向量保留在文件中但不再出现在搜索结果里
    pub async fn tombstone(&self, id: i64) -> Result<bool> {
        let file = self.writer.clone().lock_owned().await;
        let (db, rows) = (self.db.clone(), self.rows.clone());
        tokio::spawn(async move {
            let _file = file;
            let changed = crud::tombstone_face(&db, id).await?;
            if changed {
                update(&rows, move |rows| {
                    if let Some(t) = rows.tombstoned.get_mut(id as usize) {
                        *t = true;
                    }
                })
                .await?;
            }
            Ok::<_, Error>(changed)
        })
        .await?
    }

    /// 将向量文件和数据库日志全部刷到磁盘
    pub async fn persist(&self) -> Result<()> {
        self.writer.lock().await.sync()?;
        db::checkpoint(&self.db).await?;
        Ok(())
    }
}
