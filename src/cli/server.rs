use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use log::info;
use tokio::net::TcpListener;
use tokio::time::{Duration, interval};

use super::open_facedb;
use crate::cli::SubCommandExtend;
use crate::config::{FingerprintOptions, GuardOptions, IndexOptions};
use crate::ratelimit::{AbuseGuard, DistributedGuard, MemoryGuard, SqliteCounterStore, TieredGuard};
use crate::{Opts, server};

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub fingerprint: FingerprintOptions,
    #[command(flatten)]
    pub guard: GuardOptions,
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,
    /// 未指定 top_k 时返回的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = 10)]
    pub top_k: usize,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let db = open_facedb(opts, &self.index, &self.fingerprint).await?;

        let guard: Arc<dyn AbuseGuard> = if self.guard.distributed {
            let store = SqliteCounterStore::open(opts.conf_dir.counters()).await?;
            info!("使用共享计数库: {}", opts.conf_dir.counters().display());
            Arc::new(DistributedGuard::new(store, "search"))
        } else {
            let guard = Arc::new(MemoryGuard::new());
            // 定期清理过期窗口，避免内存随调用方数量增长
            tokio::spawn({
                let guard = guard.clone();
                async move {
                    let mut ticker = interval(Duration::from_secs(60));
                    loop {
                        ticker.tick().await;
                        guard.purge_expired();
                    }
                }
            });
            guard
        };

        // 创建应用状态
        let state = server::AppState::new(
            db,
            TieredGuard::new(guard, self.guard.tiers()),
            self.guard.trusted_proxies.clone(),
            self.top_k,
        );

        // 创建应用
        let app = server::create_app(state);

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

        Ok(())
    }
}
