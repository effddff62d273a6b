//! 社交平台抓取：代理池、按域名限速、逐个抓取的状态机，以及调度器

mod fetch;
mod lister;
mod proxy;
mod scheduler;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub use self::fetch::*;
pub use self::lister::*;
pub use self::proxy::*;
pub use self::scheduler::*;
use crate::error::{Error, Result};
use crate::ratelimit::DomainRateLimiter;

/// 支持的来源平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Instagram,
    Twitter,
    Facebook,
    Tiktok,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [Self::Instagram, Self::Twitter, Self::Facebook, Self::Tiktok];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instagram => "instagram",
            Self::Twitter => "twitter",
            Self::Facebook => "facebook",
            Self::Tiktok => "tiktok",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instagram" => Ok(Self::Instagram),
            "twitter" => Ok(Self::Twitter),
            "facebook" => Ok(Self::Facebook),
            "tiktok" => Ok(Self::Tiktok),
            _ => Err(Error::UnsupportedSource(s.to_owned())),
        }
    }
}

/// 抓取到的候选图片
#[derive(Debug, Clone)]
pub struct Candidate {
    pub data: Vec<u8>,
    pub source_uri: String,
}

/// 抓取流中的一项
#[derive(Debug)]
pub enum CrawlItem {
    Candidate(Candidate),
    /// 没有代理或域名预算耗尽，调用方退避后再次拉取，流会重试同一个地址
    Deferred { url: String, reason: Error },
    /// 单个地址放弃抓取，流继续处理下一个地址
    Skipped { url: String, reason: String },
}

/// 平台相关的资料页解析能力，列出一个账号下的所有图片地址
///
/// 各平台的页面解析逻辑不在本 crate 中实现，由外部提供
#[async_trait]
pub trait MediaLister: Send + Sync {
    async fn list_media(&self, profile_ref: &str) -> Result<Vec<String>>;
}

/// 单个平台的抓取器
pub trait Crawler: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// 惰性地抓取账号下的候选图片，可以从头重新开始，但不能从中间恢复
    fn fetch_candidates<'a>(&'a self, profile_ref: &'a str) -> BoxStream<'a, Result<CrawlItem>>;
}

/// 抓取器共用的外部依赖
pub struct CrawlContext {
    pub proxies: Arc<ProxyManager>,
    pub limiter: Arc<DomainRateLimiter>,
    pub http: Arc<dyn HttpFetch>,
    pub policy: FetchPolicy,
}

/// 通用的社交平台抓取器：平台差异只体现在 [`MediaLister`] 上
pub struct SocialCrawler {
    kind: SourceKind,
    lister: Arc<dyn MediaLister>,
    ctx: Arc<CrawlContext>,
}

impl SocialCrawler {
    pub fn new(kind: SourceKind, lister: Arc<dyn MediaLister>, ctx: Arc<CrawlContext>) -> Self {
        Self { kind, lister, ctx }
    }
}

struct CrawlCursor {
    queue: Option<VecDeque<String>>,
    consecutive_blocks: u32,
    done: bool,
}

impl Crawler for SocialCrawler {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn fetch_candidates<'a>(&'a self, profile_ref: &'a str) -> BoxStream<'a, Result<CrawlItem>> {
        let cursor = CrawlCursor { queue: None, consecutive_blocks: 0, done: false };
        Box::pin(stream::unfold(cursor, move |mut cur| async move {
            if cur.done {
                return None;
            }

            // 第一次拉取时才去列出图片地址
            if cur.queue.is_none() {
                match self.lister.list_media(profile_ref).await {
                    Ok(urls) => {
                        debug!("{} {} 共 {} 张图片", self.kind, profile_ref, urls.len());
                        cur.queue = Some(urls.into());
                    }
                    Err(e) => {
                        cur.done = true;
                        return Some((Err(e), cur));
                    }
                }
            }

            let queue = cur.queue.as_mut()?;
            let url = queue.front()?.clone();
            let mut task = FetchTask::new(&url, self.ctx.policy.max_retries);
            let item = match task.run(&self.ctx).await {
                FetchOutcome::Fetched(data) => {
                    queue.pop_front();
                    cur.consecutive_blocks = 0;
                    CrawlItem::Candidate(Candidate { data, source_uri: url })
                }
                // 不出队，下一次拉取时重试同一个地址
                FetchOutcome::Deferred(reason) => CrawlItem::Deferred { url, reason },
                FetchOutcome::Skipped(reason) => {
                    queue.pop_front();
                    CrawlItem::Skipped { url, reason }
                }
                FetchOutcome::Blocked => {
                    queue.pop_front();
                    cur.consecutive_blocks += 1;
                    if cur.consecutive_blocks >= self.ctx.policy.block_threshold {
                        warn!("{} 连续 {} 次被拦截: {}", self.kind, cur.consecutive_blocks, profile_ref);
                        cur.done = true;
                        let err =
                            Error::PlatformBlocked { kind: self.kind, profile: profile_ref.to_owned() };
                        return Some((Err(err), cur));
                    }
                    CrawlItem::Skipped { url, reason: "blocked".to_owned() }
                }
            };
            Some((Ok(item), cur))
        }))
    }
}

/// 来源平台到抓取器的映射
#[derive(Default)]
pub struct CrawlerRegistry {
    crawlers: [Option<Arc<dyn Crawler>>; 4],
}

impl CrawlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, crawler: Arc<dyn Crawler>) {
        let kind = crawler.kind();
        self.crawlers[kind.index()] = Some(crawler);
    }

    /// 为每个平台注册一个通用抓取器
    pub fn with_listers(
        listers: impl IntoIterator<Item = (SourceKind, Arc<dyn MediaLister>)>,
        ctx: Arc<CrawlContext>,
    ) -> Self {
        let mut registry = Self::new();
        for (kind, lister) in listers {
            registry.register(Arc::new(SocialCrawler::new(kind, lister, ctx.clone())));
        }
        registry
    }

    pub fn get(&self, kind: SourceKind) -> Result<Arc<dyn Crawler>> {
        self.crawlers[kind.index()]
            .clone()
            .ok_or_else(|| Error::UnsupportedSource(kind.to_string()))
    }

    /// 按平台名称查找，未知平台返回 [`Error::UnsupportedSource`]
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn Crawler>> {
        self.get(kind.parse()?)
    }
}
