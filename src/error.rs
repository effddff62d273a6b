use thiserror::Error;

use crate::crawl::SourceKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// faceseek 核心错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// 图片无法解码
    #[error("图片解码失败: {0}")]
    Decode(#[from] image::ImageError),

    #[error("向量维度不匹配: 期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 索引文件与元数据不一致，需要人工修复
    #[error("索引损坏: {0}")]
    CorruptIndex(String),

    #[error("没有可用的代理")]
    NoAvailableProxy,

    #[error("域名请求预算已耗尽: {0}")]
    BudgetDenied(String),

    /// 平台返回登录墙、验证码等，需要运维人员介入
    #[error("平台 {kind} 已屏蔽抓取: {profile}")]
    PlatformBlocked { kind: SourceKind, profile: String },

    #[error("不支持的来源: {0}")]
    UnsupportedSource(String),

    #[error("计数存储不可用: {0}")]
    CounterStore(String),

    #[error("向量化失败: {0}")]
    Embed(String),

    #[error("请求失败: {0}")]
    Fetch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("后台任务失败: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// 是否为暂时性的背压错误，调用方应当退避后重试
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoAvailableProxy | Self::BudgetDenied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient() {
        assert!(Error::NoAvailableProxy.is_transient());
        assert!(Error::BudgetDenied("example.com".into()).is_transient());
        assert!(!Error::CorruptIndex("x".into()).is_transient());
        assert!(!Error::UnsupportedSource("myspace".into()).is_transient());
    }
}
