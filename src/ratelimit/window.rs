use std::time::{Duration, Instant};

/// 固定窗口计数器
///
/// 窗口过期后的第一次请求会开启新窗口并将计数置为 1
#[derive(Debug, Clone, Copy)]
pub struct FixedWindow {
    pub window_start: Instant,
    pub count: u64,
}

impl FixedWindow {
    pub fn new(now: Instant) -> Self {
        Self { window_start: now, count: 0 }
    }

    /// 检查并计数，调用方需保证对同一个窗口的访问是互斥的
    pub fn try_hit(&mut self, now: Instant, limit: u64, window: Duration) -> bool {
        if now.saturating_duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count < limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_limit() {
        let t0 = Instant::now();
        let window = Duration::from_secs(60);
        let mut w = FixedWindow::new(t0);
        let r = (0..3)
            .map(|i| w.try_hit(t0 + Duration::from_secs(i), 2, window))
            .collect::<Vec<_>>();
        assert_eq!(r, [true, true, false]);
        assert_eq!(w.count, 2);
    }

    #[test]
    fn test_window_reset() {
        let t0 = Instant::now();
        let window = Duration::from_secs(60);
        let mut w = FixedWindow::new(t0);
        assert!(w.try_hit(t0, 1, window));
        assert!(!w.try_hit(t0 + Duration::from_secs(59), 1, window));
        assert!(w.try_hit(t0 + Duration::from_secs(60), 1, window));
        assert_eq!(w.count, 1);
    }

    #[test]
    fn test_zero_limit() {
        let t0 = Instant::now();
        let mut w = FixedWindow::new(t0);
        assert!(!w.try_hit(t0, 0, Duration::from_secs(1)));
        assert!(!w.try_hit(t0 + Duration::from_secs(2), 0, Duration::from_secs(1)));
    }
}
