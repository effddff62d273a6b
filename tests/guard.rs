use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use assert_fs::TempDir;
use faceseek::ratelimit::*;
use futures::future::join_all;
use rstest::*;

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

#[tokio::test]
async fn memory_guard_concurrent_callers() {
    let guard = Arc::new(MemoryGuard::new());
    let tasks = (0..32).map(|_| {
        let guard = guard.clone();
        tokio::spawn(async move { guard.allow("1.2.3.4|dev", 5, Duration::from_secs(60)).await })
    });
    let allowed = join_all(tasks).await.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    // 并发请求不会越过限额
    assert_eq!(allowed, 5);
}

#[rstest]
#[tokio::test]
async fn distributed_guard_shared_between_processes(temp_dir: TempDir) -> Result<()> {
    let path = temp_dir.path().join("counters.db");
    let a = DistributedGuard::new(SqliteCounterStore::open(&path).await?, "search");
    let b = DistributedGuard::new(SqliteCounterStore::open(&path).await?, "search");
    let window = Duration::from_secs(60);

    assert!(a.allow("k", 3, window).await);
    assert!(b.allow("k", 3, window).await);
    assert!(a.allow("k", 3, window).await);
    assert!(!b.allow("k", 3, window).await);
    assert!(!a.allow("k", 3, window).await);

    assert!(b.allow("other", 3, window).await);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn distributed_guard_window_expires(temp_dir: TempDir) -> Result<()> {
    let store = SqliteCounterStore::open(temp_dir.path().join("counters.db")).await?;
    let guard = DistributedGuard::new(store, "search");
    let window = Duration::from_secs(1);

    assert!(guard.allow("k", 1, window).await);
    assert!(!guard.allow("k", 1, window).await);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(guard.allow("k", 1, window).await);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn tiered_distributed_guard(temp_dir: TempDir) -> Result<()> {
    let store = SqliteCounterStore::open(temp_dir.path().join("counters.db")).await?;
    let guard = TieredGuard::new(
        Arc::new(DistributedGuard::new(store, "search")),
        vec![Tier::per_minute(2), Tier::per_day(3)],
    );
    let caller = CallerKey::new("203.0.113.9", "anonymous");

    assert!(guard.check(&caller).await.is_ok());
    assert!(guard.check(&caller).await.is_ok());
    assert_eq!(guard.check(&caller).await.unwrap_err().name, "minute");
    assert!(guard.check(&CallerKey::new("203.0.113.9", "dev-1")).await.is_ok());
    Ok(())
}
