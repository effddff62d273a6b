use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};

use super::store::CounterStore;
use super::window::FixedWindow;
use crate::metrics;

/// 请求滥用防护，固定窗口算法
#[async_trait]
pub trait AbuseGuard: Send + Sync {
    /// 在 window 时间窗口内，key 的请求次数不超过 limit 时放行
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> bool;
}

/// 进程内防护，计数保存在内存中
///
/// 同一个键的检查和计数在 DashMap 分片锁内完成，并发请求不会同时越过限额
#[derive(Default)]
pub struct MemoryGuard {
    windows: DashMap<(String, Duration), FixedWindow>,
}

impl MemoryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_at(&self, key: &str, limit: u64, window: Duration, now: Instant) -> bool {
        self.windows
            .entry((key.to_owned(), window))
            .or_insert_with(|| FixedWindow::new(now))
            .try_hit(now, limit, window)
    }

    /// 清理已过期的窗口
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.windows.retain(|(_, window), w| !w.is_expired(now, *window));
    }
}

#[async_trait]
impl AbuseGuard for MemoryGuard {
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> bool {
        self.allow_at(key, limit, window, Instant::now())
    }
}

/// 跨进程防护，计数保存在共享存储中
///
/// 共享存储不可用时放行请求：主服务的可用性优先于防护
pub struct DistributedGuard<S> {
    store: S,
    prefix: String,
}

impl<S: CounterStore> DistributedGuard<S> {
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into() }
    }

    async fn missing_ttl(&self, key: &str) -> bool {
        match self.store.ttl(key).await {
            Ok(ttl) => ttl.is_none(),
            Err(e) => {
                warn!("查询过期时间失败 {key}: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl<S: CounterStore> AbuseGuard for DistributedGuard<S> {
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> bool {
        let key = format!("{}:{}:{}", self.prefix, window.as_secs(), key);
        let count = match self.store.incr(&key).await {
            Ok(count) => count,
            Err(e) => {
                warn!("计数存储不可用，放行请求 {key}: {e}");
                metrics::inc_guard_fail_open();
                return true;
            }
        };
        // 窗口内的第一次写入负责设置过期时间，超限时确认过期时间存在，
        // 避免第一次设置失败后调用方被永久拦截
        if count == 1 || (count > limit && self.missing_ttl(&key).await) {
            if let Err(e) = self.store.expire(&key, window).await {
                warn!("设置过期时间失败 {key}: {e}");
            }
        }
        count <= limit
    }
}


/// 调用方标识，由来源 IP 和设备 ID 组成
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerKey {
    pub ip: String,
    pub device_id: String,
}

impl CallerKey {
    pub fn new(ip: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self { ip: ip.into(), device_id: device_id.into() }
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.ip, self.device_id)
    }
}

/// 单个限速档位
#[derive(Debug, Clone)]
pub struct Tier {
    pub name: &'static str,
    pub limit: u64,
    pub window: Duration,
}

impl Tier {
    pub fn per_minute(limit: u64) -> Self {
        Self { name: "minute", limit, window: Duration::from_secs(60) }
    }

    pub fn per_day(limit: u64) -> Self {
        Self { name: "day", limit, window: Duration::from_secs(86400) }
    }
}

/// 多档位防护，所有档位都放行时才放行
pub struct TieredGuard {
    guard: Arc<dyn AbuseGuard>,
    tiers: Vec<Tier>,
}

impl TieredGuard {
    pub fn new(guard: Arc<dyn AbuseGuard>, tiers: Vec<Tier>) -> Self {
        Self { guard, tiers }
    }

    /// 检查调用方，被拒绝时返回拒绝的档位
    pub async fn check(&self, caller: &CallerKey) -> Result<(), &Tier> {
        let key = caller.to_string();
        for tier in &self.tiers {
            if !self.guard.allow(&key, tier.limit, tier.window).await {
                debug!("调用方 {key} 触发 {} 档限速", tier.name);
                metrics::inc_guard_rejected(tier.name);
                return Err(tier);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::{Error, Result};
    use crate::ratelimit::SqliteCounterStore;

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn incr(&self, _key: &str) -> Result<u64> {
            Err(Error::CounterStore("connection refused".into()))
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
            Err(Error::CounterStore("connection refused".into()))
        }

        async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
            Err(Error::CounterStore("connection refused".into()))
        }
    }

    /// 前几次设置过期时间失败，其余操作转发给 SQLite
    struct FlakyExpire {
        inner: SqliteCounterStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl CounterStore for FlakyExpire {
        async fn incr(&self, key: &str) -> Result<u64> {
            self.inner.incr(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
            let fail = self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if fail.is_ok() {
                return Err(Error::CounterStore("timeout".into()));
            }
            self.inner.expire(key, ttl).await
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            self.inner.ttl(key).await
        }
    }

    #[test]
    fn test_memory_guard_limit() {
        let guard = MemoryGuard::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(60);
        assert!(guard.allow_at("k", 2, window, t0));
        assert!(guard.allow_at("k", 2, window, t0 + Duration::from_secs(1)));
        assert!(!guard.allow_at("k", 2, window, t0 + Duration::from_secs(2)));
        assert!(guard.allow_at("k", 2, window, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_memory_guard_windows_separate() {
        let guard = MemoryGuard::new();
        let t0 = Instant::now();
        assert!(guard.allow_at("k", 1, Duration::from_secs(60), t0));
        // 同一个键在不同粒度下独立计数
        assert!(guard.allow_at("k", 1, Duration::from_secs(86400), t0));
        assert!(!guard.allow_at("k", 1, Duration::from_secs(60), t0));
    }

    #[tokio::test]
    async fn test_distributed_fail_open() {
        let guard = DistributedGuard::new(UnreachableStore, "search");
        for _ in 0..100 {
            assert!(guard.allow("k", 1, Duration::from_secs(60)).await);
        }
    }

    #[tokio::test]
    async fn test_distributed_window_resets_after_expire_failure() {
        let dir = tempfile::tempdir().unwrap();
        let inner = SqliteCounterStore::open(dir.path().join("counters.db")).await.unwrap();
        let guard = DistributedGuard::new(FlakyExpire { inner, failures: AtomicU32::new(1) }, "search");
        let window = Duration::from_secs(1);

        // 第一次设置过期时间失败
        assert!(guard.allow("k", 1, window).await);
        assert!(!guard.allow("k", 1, window).await);
        assert!(!guard.allow("k", 1, window).await);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(guard.allow("k", 1, window).await);
    }

    #[tokio::test]
    async fn test_tiered_guard() {
        let guard = TieredGuard::new(
            Arc::new(MemoryGuard::new()),
            vec![Tier::per_minute(3), Tier::per_day(4)],
        );
        let caller = CallerKey::new("1.2.3.4", "device-a");
        for _ in 0..3 {
            assert!(guard.check(&caller).await.is_ok());
        }
        assert_eq!(guard.check(&caller).await.unwrap_err().name, "minute");

        // 其他设备不受影响
        let other = CallerKey::new("1.2.3.4", "device-b");
        assert!(guard.check(&other).await.is_ok());
    }

    #[tokio::test]
    async fn test_tiered_guard_day_limit() {
        let guard = TieredGuard::new(
            Arc::new(MemoryGuard::new()),
            vec![Tier::per_minute(10), Tier::per_day(2)],
        );
        let caller = CallerKey::new("1.2.3.4", "device-a");
        assert!(guard.check(&caller).await.is_ok());
        assert!(guard.check(&caller).await.is_ok());
        assert_eq!(guard.check(&caller).await.unwrap_err().name, "day");
    }
}
