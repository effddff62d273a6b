use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use log::{error, info};

use super::{SubCommandExtend, open_facedb};
use crate::config::{CrawlOptions, FingerprintOptions, IndexOptions, Opts};
use crate::crawl::*;
use crate::ratelimit::DomainRateLimiter;

#[derive(Parser, Debug, Clone)]
pub struct CrawlCommand {
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub fingerprint: FingerprintOptions,
    #[command(flatten)]
    pub crawl: CrawlOptions,
    /// 账号列表文件，每行为 `平台 账号`
    pub profiles: PathBuf,
}

impl SubCommandExtend for CrawlCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let content = tokio::fs::read_to_string(&self.profiles).await?;
        let jobs = CrawlJob::parse_list(&content)?;
        info!("共 {} 个账号", jobs.len());

        let proxies = ProxyManager::load(
            &self.crawl.proxies,
            self.crawl.proxy_failure_threshold,
            Duration::from_secs(self.crawl.proxy_cooldown),
        )?;
        if proxies.is_empty() {
            bail!("代理列表为空: {}", self.crawl.proxies.display());
        }

        let timeout = Duration::from_secs(self.crawl.fetch_timeout);
        let ctx = Arc::new(CrawlContext {
            proxies: Arc::new(proxies),
            limiter: Arc::new(DomainRateLimiter::new(
                self.crawl.domain_limit,
                Duration::from_secs(self.crawl.domain_window),
            )),
            http: Arc::new(ReqwestFetch::new(timeout, &self.crawl.user_agent)),
            policy: self.crawl.fetch_policy(),
        });

        let listers = SourceKind::ALL
            .into_iter()
            .map(|kind| -> Result<(SourceKind, Arc<dyn MediaLister>)> {
                let lister = RemoteLister::new(&self.crawl.lister_url, kind, timeout)?;
                Ok((kind, Arc::new(lister)))
            })
            .collect::<Result<Vec<_>>>()?;
        let registry = CrawlerRegistry::with_listers(listers, ctx.clone());

        let db = Arc::new(open_facedb(opts, &self.index, &self.fingerprint).await?);
        let scheduler = CrawlScheduler::new(Arc::new(registry), db.clone(), self.crawl.backoff());

        let results = scheduler.crawl_many(jobs, self.crawl.concurrency).await;
        db.index().persist().await?;

        let mut failed = 0;
        for (job, result) in results {
            match result {
                Ok(report) => println!("{}", serde_json::to_string(&report)?),
                Err(e) => {
                    failed += 1;
                    error!("{} 抓取失败: {}", job, e);
                }
            }
        }
        for proxy in ctx.proxies.snapshot() {
            if proxy.health_state != HealthState::Healthy {
                info!("代理 {} 状态: {:?}", proxy.endpoint, proxy.health_state);
            }
        }
        if failed > 0 {
            bail!("{} 个账号抓取失败", failed);
        }
        Ok(())
    }
}
