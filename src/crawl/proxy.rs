use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// 连续失败过多，冷却结束前不会被选中
    Cooling,
    /// 冷却期间再次失败，只能手动恢复
    Banned,
}

/// 出口代理及其健康状态，只由 [`ProxyManager`] 修改
#[derive(Debug, Clone, Serialize)]
pub struct ProxyIdentity {
    pub endpoint: String,
    pub health_state: HealthState,
    #[serde(skip)]
    pub last_used_at: Option<Instant>,
    #[serde(skip)]
    pub cooling_since: Option<Instant>,
    pub failure_count: u32,
}

impl ProxyIdentity {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            health_state: HealthState::Healthy,
            last_used_at: None,
            cooling_since: None,
            failure_count: 0,
        }
    }
}

/// 一次代理租用，只是对管理器内部代理的引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    slot: usize,
    pub endpoint: String,
}

/// 代理池
///
/// 每个代理一把锁，轮询游标为原子变量，不存在整个池子的全局锁
pub struct ProxyManager {
    proxies: Vec<Mutex<ProxyIdentity>>,
    cursor: AtomicUsize,
    failure_threshold: u32,
    cooldown: Duration,
}

impl ProxyManager {
    pub fn new(
        endpoints: impl IntoIterator<Item = String>,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        let proxies = endpoints
            .into_iter()
            .map(|endpoint| Mutex::new(ProxyIdentity::new(endpoint)))
            .collect::<Vec<_>>();
        Self { proxies, cursor: AtomicUsize::new(0), failure_threshold: failure_threshold.max(1), cooldown }
    }

    /// 从文件加载代理列表，每行一个，忽略空行和 # 开头的注释
    pub fn load(
        path: impl AsRef<Path>,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let endpoints = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect::<Vec<_>>();
        info!("加载了 {} 个代理: {}", endpoints.len(), path.as_ref().display());
        Ok(Self::new(endpoints, failure_threshold, cooldown))
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// 轮询选择一个可用代理，没有可用代理时立即失败
    pub fn acquire(&self) -> Result<ProxyLease> {
        self.acquire_at(Instant::now())
    }

    pub fn acquire_at(&self, now: Instant) -> Result<ProxyLease> {
        let n = self.proxies.len();
        if n == 0 {
            return Err(Error::NoAvailableProxy);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let slot = (start + i) % n;
            let mut proxy = lock(&self.proxies[slot]);
            self.refresh(&mut proxy, now);
            if proxy.health_state == HealthState::Healthy {
                proxy.last_used_at = Some(now);
                return Ok(ProxyLease { slot, endpoint: proxy.endpoint.clone() });
            }
        }
        Err(Error::NoAvailableProxy)
    }

    /// 汇报请求结果，驱动状态机
    pub fn report_outcome(&self, lease: &ProxyLease, success: bool) {
        self.report_outcome_at(lease, success, Instant::now())
    }

    pub fn report_outcome_at(&self, lease: &ProxyLease, success: bool, now: Instant) {
        let Some(proxy) = self.proxies.get(lease.slot) else {
            return;
        };
        let mut proxy = lock(proxy);
        self.refresh(&mut proxy, now);

        if success {
            if proxy.health_state == HealthState::Healthy {
                proxy.failure_count = 0;
            }
            return;
        }

        proxy.failure_count += 1;
        match proxy.health_state {
            HealthState::Healthy if proxy.failure_count >= self.failure_threshold => {
                warn!("代理 {} 连续失败 {} 次，进入冷却", proxy.endpoint, proxy.failure_count);
                proxy.health_state = HealthState::Cooling;
                proxy.cooling_since = Some(now);
                metrics::inc_proxy_transition("cooling");
            }
            HealthState::Cooling => {
                warn!("代理 {} 冷却期间再次失败，已封禁", proxy.endpoint);
                proxy.health_state = HealthState::Banned;
                proxy.cooling_since = None;
                metrics::inc_proxy_transition("banned");
            }
            _ => {}
        }
    }

    /// 手动解除封禁
    pub fn reset(&self, endpoint: &str) -> bool {
        for proxy in &self.proxies {
            let mut proxy = lock(proxy);
            if proxy.endpoint == endpoint {
                info!("代理 {} 已手动恢复", proxy.endpoint);
                *proxy = ProxyIdentity::new(proxy.endpoint.clone());
                metrics::inc_proxy_transition("healthy");
                return true;
            }
        }
        false
    }

    /// 当前所有代理状态的快照
    pub fn snapshot(&self) -> Vec<ProxyIdentity> {
        let now = Instant::now();
        self.proxies
            .iter()
            .map(|proxy| {
                let mut proxy = lock(proxy);
                self.refresh(&mut proxy, now);
                proxy.clone()
            })
            .collect()
    }

    /// 冷却结束的代理恢复为健康状态
    fn refresh(&self, proxy: &mut ProxyIdentity, now: Instant) {
        if proxy.health_state != HealthState::Cooling {
            return;
        }
        let elapsed = proxy.cooling_since.map(|t| now.saturating_duration_since(t));
        if elapsed.is_some_and(|d| d >= self.cooldown) {
            info!("代理 {} 冷却结束", proxy.endpoint);
            proxy.health_state = HealthState::Healthy;
            proxy.cooling_since = None;
            proxy.failure_count = 0;
            metrics::inc_proxy_transition("healthy");
        }
    }
}

/// 单个代理的锁只在很短的临界区内持有，中毒时直接沿用内部数据
fn lock(proxy: &Mutex<ProxyIdentity>) -> std::sync::MutexGuard<'_, ProxyIdentity> {
    proxy.lock().unwrap_or_else(|e| e.into_inner())
}
