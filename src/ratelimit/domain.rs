use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;

use super::window::FixedWindow;

/// 按目标域名限速的礼貌性节流器
///
/// 每个域名独立计数，不同域名落在 DashMap 的不同分片上，互不阻塞。
/// 被拒绝的调用方应当自行退避，而不是原地自旋。
pub struct DomainRateLimiter {
    windows: DashMap<String, FixedWindow>,
    limit: u64,
    window: Duration,
}

impl DomainRateLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { windows: DashMap::new(), limit, window }
    }

    /// 尝试消耗一次请求预算，非阻塞
    pub fn try_acquire(&self, domain: &str) -> bool {
        self.try_acquire_at(domain, Instant::now())
    }

    pub fn try_acquire_at(&self, domain: &str, now: Instant) -> bool {
        // entry 持有分片写锁，检查和计数在同一临界区内完成
        let allowed = self
            .windows
            .entry(domain.to_ascii_lowercase())
            .or_insert_with(|| FixedWindow::new(now))
            .try_hit(now, self.limit, self.window);
        if !allowed {
            debug!("域名 {domain} 预算耗尽");
        }
        allowed
    }

    /// 清理已过期的窗口，避免长时间运行后域名表无限增长
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.windows.retain(|_, w| !w.is_expired(now, self.window));
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
