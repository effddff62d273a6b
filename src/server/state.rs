use std::net::IpAddr;
use std::sync::Arc;

use crate::FaceDB;
use crate::ratelimit::TieredGuard;

/// 应用状态
pub struct AppState {
    /// 人脸库
    pub db: FaceDB,
    /// 搜索接口的限速
    pub guard: TieredGuard,
    /// 允许读取 `X-Forwarded-For` 的代理地址
    pub trusted_proxies: Vec<IpAddr>,
    /// 未指定时返回的结果数量
    pub top_k: usize,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        db: FaceDB,
        guard: TieredGuard,
        trusted_proxies: Vec<IpAddr>,
        top_k: usize,
    ) -> Arc<Self> {
        Arc::new(AppState { db, guard, trusted_proxies, top_k })
    }
}
