use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;

use super::{CrawlItem, CrawlerRegistry, SourceKind};
use crate::error::{Error, Result};
use crate::facedb::{FaceDB, IngestOutcome};

/// 带随机抖动的指数退避
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// 连续延后多少次后放弃这个账号
    pub max_deferrals: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(500), max: Duration::from_secs(30), max_deferrals: 20 }
    }
}

impl Backoff {
    /// 第 `attempt` 次退避的时长，在 `[d/2, d)` 之间随机
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1 << attempt.min(16));
        let capped = exp.min(self.max);
        capped.mul_f64(rand::rng().random_range(0.5..1.0))
    }
}

/// 一个待抓取的账号
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlJob {
    pub kind: SourceKind,
    pub profile_ref: String,
}

impl CrawlJob {
    /// 解析账号列表，每行为 `平台 账号`，忽略空行和 # 开头的注释
    pub fn parse_list(content: &str) -> Result<Vec<Self>> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::parse)
            .collect()
    }
}

impl FromStr for CrawlJob {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(profile_ref), None) => {
                Ok(Self { kind: kind.parse()?, profile_ref: profile_ref.to_owned() })
            }
            _ => Err(Error::InvalidArgument(format!("无效的账号行: {s}"))),
        }
    }
}

impl fmt::Display for CrawlJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.profile_ref)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Completed,
    /// 平台屏蔽了抓取，需要人工处理，不会自动重试
    Blocked,
    /// 连续延后次数过多，放弃本次抓取
    Abandoned,
}

/// 单个账号的抓取统计
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub job: CrawlJob,
    pub indexed: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub skipped: u64,
    pub deferrals: u64,
    pub status: CrawlStatus,
}

impl CrawlReport {
    fn new(job: CrawlJob) -> Self {
        Self {
            job,
            indexed: 0,
            duplicates: 0,
            rejected: 0,
            skipped: 0,
            deferrals: 0,
            status: CrawlStatus::Completed,
        }
    }
}

pub struct CrawlScheduler {
    registry: Arc<CrawlerRegistry>,
    db: Arc<FaceDB>,
    backoff: Backoff,
}

impl CrawlScheduler {
    pub fn new(registry: Arc<CrawlerRegistry>, db: Arc<FaceDB>, backoff: Backoff) -> Self {
        Self { registry, db, backoff }
    }

    /// 抓取一个账号并入库
    ///
    /// 平台屏蔽体现在 [`CrawlReport::status`] 中，只有存储层错误和列出图片失败才返回 `Err`
    pub async fn crawl(&self, kind: SourceKind, profile_ref: &str) -> Result<CrawlReport> {
        let crawler = self.registry.get(kind)?;
        let mut report =
            CrawlReport::new(CrawlJob { kind, profile_ref: profile_ref.to_owned() });
        let mut stream = crawler.fetch_candidates(profile_ref);
        let mut consecutive = 0;

        while let Some(item) = stream.next().await {
            match item {
                Ok(CrawlItem::Candidate(candidate)) => {
                    consecutive = 0;
                    match self.db.ingest(&candidate.data, &candidate.source_uri).await? {
                        IngestOutcome::Indexed { .. } => report.indexed += 1,
                        IngestOutcome::Duplicate { .. } => report.duplicates += 1,
                        IngestOutcome::Rejected { .. } => report.rejected += 1,
                    }
                }
                Ok(CrawlItem::Skipped { url, reason }) => {
                    consecutive = 0;
                    debug!("跳过 {}: {}", url, reason);
                    report.skipped += 1;
                }
                Ok(CrawlItem::Deferred { url, reason }) => {
                    report.deferrals += 1;
                    if consecutive >= self.backoff.max_deferrals {
                        warn!("{} 连续延后 {} 次，放弃抓取: {}", report.job, consecutive, reason);
                        report.status = CrawlStatus::Abandoned;
                        break;
                    }
                    let delay = self.backoff.delay(consecutive);
                    consecutive += 1;
                    debug!("{} 延后 {:?}: {}", url, delay, reason);
                    sleep(delay).await;
                }
                Err(Error::PlatformBlocked { .. }) => {
                    report.status = CrawlStatus::Blocked;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "{} 抓取结束 {:?}: 入库 {}，重复 {}，拒绝 {}，跳过 {}",
            report.job,
            report.status,
            report.indexed,
            report.duplicates,
            report.rejected,
            report.skipped
        );
        Ok(report)
    }

    /// 并发抓取多个账号，返回顺序与完成顺序一致
    pub async fn crawl_many(
        &self,
        jobs: Vec<CrawlJob>,
        concurrency: usize,
    ) -> Vec<(CrawlJob, Result<CrawlReport>)> {
        stream::iter(jobs)
            .map(|job| async move {
                let result = self.crawl(job.kind, &job.profile_ref).await;
                (job, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            max_deferrals: 5,
        };
        for _ in 0..20 {
            let d = backoff.delay(0);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
            let d = backoff.delay(10);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_secs(1));
        }
        assert!(backoff.delay(u32::MAX) <= Duration::from_secs(1));
    }

    #[test]
    fn test_parse_jobs() {
        let jobs = CrawlJob::parse_list(
            "# 注释\ninstagram alice\n\n  twitter   bob  \n",
        )
        .unwrap();
        assert_eq!(jobs, vec![
            CrawlJob { kind: SourceKind::Instagram, profile_ref: "alice".into() },
            CrawlJob { kind: SourceKind::Twitter, profile_ref: "bob".into() },
        ]);

        assert!(matches!(CrawlJob::parse_list("myspace tom"), Err(Error::UnsupportedSource(_))));
        assert!(matches!(CrawlJob::parse_list("instagram"), Err(Error::InvalidArgument(_))));
        assert!(matches!(CrawlJob::parse_list("tiktok a b"), Err(Error::InvalidArgument(_))));
    }
}
