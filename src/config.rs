use std::convert::Infallible;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::crawl::{Backoff, FetchPolicy};
use crate::fingerprint::DEFAULT_PHASH_THRESHOLD;
use crate::index::Metric;
use crate::ratelimit::Tier;

static CONF_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "faceseek", "faceseek")
        .map(|dirs| dirs.config_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "faceseek".to_owned())
});

fn default_config_dir() -> &'static str {
    CONF_DIR.as_str()
}

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 向量维度，必须与向量化模型的输出一致
    #[arg(long, value_name = "N", default_value_t = 512)]
    pub dim: usize,
    /// 距离度量，建库后不可更改
    #[arg(long, value_enum, default_value_t = Metric::Cosine)]
    pub metric: Metric,
    /// 向量化服务地址
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:9000/embed")]
    pub embed_url: String,
    /// 向量化模型版本，随向量一同保存
    #[arg(long, value_name = "VERSION", default_value = "unknown")]
    pub model_version: String,
    /// 向量化请求超时，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub embed_timeout: u64,
}

impl IndexOptions {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct FingerprintOptions {
    /// pHash 汉明距离不超过该值时认为两张图片相互印证，范围从 0 到 64
    #[arg(long, value_name = "N", default_value_t = DEFAULT_PHASH_THRESHOLD, value_parser = clap::value_parser!(u32).range(0..=64))]
    pub phash_threshold: u32,
}

#[derive(Parser, Debug, Clone)]
pub struct CrawlOptions {
    /// 代理列表文件，每行一个代理地址
    #[arg(long, value_name = "FILE")]
    pub proxies: PathBuf,
    /// 列出账号图片的解析服务地址
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:9100/list")]
    pub lister_url: String,
    /// 代理连续失败多少次后进入冷却
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub proxy_failure_threshold: u32,
    /// 代理冷却时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub proxy_cooldown: u64,
    /// 每个域名在一个窗口内允许的请求数
    #[arg(long, value_name = "N", default_value_t = 30)]
    pub domain_limit: u64,
    /// 域名限速窗口，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub domain_window: u64,
    /// 单次抓取中网络错误的重试次数
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub max_retries: u32,
    /// 连续被拦截多少次后判定平台已屏蔽
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub block_threshold: u32,
    /// 抓取请求超时，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 20)]
    pub fetch_timeout: u64,
    #[arg(long, default_value = concat!("faceseek/", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,
    /// 退避的初始时长，单位为毫秒
    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub backoff_base: u64,
    /// 退避的最大时长，单位为毫秒
    #[arg(long, value_name = "MS", default_value_t = 30_000)]
    pub backoff_max: u64,
    /// 连续延后多少次后放弃一个账号
    #[arg(long, value_name = "N", default_value_t = 20)]
    pub max_deferrals: u32,
    /// 同时抓取的账号数量
    #[arg(short = 'j', long, value_name = "N", default_value_t = 4)]
    pub concurrency: usize,
}

impl CrawlOptions {
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy { max_retries: self.max_retries, block_threshold: self.block_threshold.max(1) }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.backoff_base),
            max: Duration::from_millis(self.backoff_max),
            max_deferrals: self.max_deferrals,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct GuardOptions {
    /// 每个调用方每分钟允许的搜索次数
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub per_minute: u64,
    /// 每个调用方每天允许的搜索次数
    #[arg(long, value_name = "N", default_value_t = 200)]
    pub per_day: u64,
    /// 使用配置目录下的共享计数库，多个进程共享同一份限额
    #[arg(long)]
    pub distributed: bool,
    /// 受信任的反向代理地址，只有来自这些地址的请求才读取 X-Forwarded-For，可重复指定
    #[arg(long = "trusted-proxy", value_name = "IP")]
    pub trusted_proxies: Vec<IpAddr>,
}

impl GuardOptions {
    pub fn tiers(&self) -> Vec<Tier> {
        vec![Tier::per_minute(self.per_minute), Tier::per_day(self.per_day)]
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "faceseek", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// faceseek 配置文件目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 添加目录下的图片到人脸库
    Add(AddCommand),
    /// 从人脸库中搜索图片
    Search(SearchCommand),
    /// 抓取社交平台账号并入库
    Crawl(CrawlCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
    /// 以元数据为准修复向量文件
    Repair(RepairCommand),
    /// 检查代理列表
    Proxies(ProxiesCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回元数据库文件的路径
    pub fn database(&self) -> PathBuf {
        self.path.join("faceseek.db")
    }

    /// 返回向量文件的路径
    pub fn vectors(&self) -> PathBuf {
        self.path.join("vectors.bin")
    }

    /// 返回共享计数库的路径
    pub fn counters(&self) -> PathBuf {
        self.path.join("counters.db")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Opts::command().debug_assert();
    }

    #[test]
    fn test_conf_dir() {
        let conf_dir: ConfDir = "/tmp/fs".parse().unwrap();
        assert_eq!(conf_dir.database(), Path::new("/tmp/fs/faceseek.db"));
        assert_eq!(conf_dir.vectors(), Path::new("/tmp/fs/vectors.bin"));
        assert_eq!(conf_dir.counters(), Path::new("/tmp/fs/counters.db"));
    }
}
