use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use reqwest::Url;

use super::{CrawlContext, ProxyLease};
use crate::error::{Error, Result};

/// 抓取策略
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// 单次抓取中网络错误的重试次数，超过后才汇报为代理失败
    pub max_retries: u32,
    /// 连续被拦截多少次后判定平台已屏蔽
    pub block_threshold: u32,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self { max_retries: 3, block_threshold: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// 通过指定代理发起 GET 请求的能力
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// 返回 Err 表示网络层失败（连接、超时等），HTTP 错误码通过 status 返回
    async fn get(&self, url: &str, proxy: &ProxyLease) -> Result<FetchResponse>;
}

/// 基于 reqwest 的实现，每个代理复用一个 Client
pub struct ReqwestFetch {
    clients: DashMap<String, reqwest::Client>,
    timeout: Duration,
    user_agent: String,
}

impl ReqwestFetch {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self { clients: DashMap::new(), timeout, user_agent: user_agent.into() }
    }

    fn client(&self, endpoint: &str) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(endpoint) {
            return Ok(client.clone());
        }
        let proxy = reqwest::Proxy::all(endpoint).map_err(|e| Error::Fetch(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        self.clients.insert(endpoint.to_owned(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn get(&self, url: &str, proxy: &ProxyLease) -> Result<FetchResponse> {
        let client = self.client(&proxy.endpoint)?;
        let resp = client.get(url).send().await.map_err(|e| Error::Fetch(e.to_string()))?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp.bytes().await.map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(FetchResponse { status, content_type, body: body.to_vec() })
    }
}

/// 响应分类
#[derive(Debug)]
enum Response {
    Image(Vec<u8>),
    /// 登录墙、验证码、限流
    Blocked,
    /// 服务端暂时性错误，按网络错误处理
    Transient(String),
    /// 资源不存在等，代理本身没问题
    Gone(u16),
}

fn classify(resp: FetchResponse) -> Response {
    match resp.status {
        200..=299 => {
            // 返回 html 而不是图片，通常是被重定向到了登录页或验证码页
            let is_html = resp.content_type.as_deref().is_some_and(|t| t.starts_with("text/html"));
            if is_html { Response::Blocked } else { Response::Image(resp.body) }
        }
        401 | 403 | 429 => Response::Blocked,
        500..=599 => Response::Transient(format!("HTTP {}", resp.status)),
        status => Response::Gone(status),
    }
}

/// 单次抓取的最终结果
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(Vec<u8>),
    /// 暂时无法发起请求，由调用方决定何时重试
    Deferred(Error),
    Skipped(String),
    Blocked,
}

/// 抓取状态
#[derive(Debug)]
pub enum FetchState {
    AcquiringProxy,
    BudgetCheck(ProxyLease),
    Fetching(ProxyLease),
    ReportingOutcome(ProxyLease, Attempt),
    /// 换一个代理重新开始
    Retry,
    Done(FetchOutcome),
}

/// 一次请求尝试的结果，决定如何向代理池汇报
#[derive(Debug)]
pub enum Attempt {
    Image(Vec<u8>),
    Blocked,
    Gone(u16),
    NetworkFailure(String),
}

impl FetchState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AcquiringProxy => "acquiring_proxy",
            Self::BudgetCheck(_) => "budget_check",
            Self::Fetching(_) => "fetching",
            Self::ReportingOutcome(..) => "reporting_outcome",
            Self::Retry => "retry",
            Self::Done(FetchOutcome::Fetched(_)) => "done",
            Self::Done(FetchOutcome::Deferred(_)) => "deferred",
            Self::Done(FetchOutcome::Skipped(_)) => "skipped",
            Self::Done(FetchOutcome::Blocked) => "blocked",
        }
    }
}

/// 单个地址的抓取状态机
///
/// `acquiring_proxy → budget_check → fetching → reporting_outcome → done | retry | blocked`，
/// 拿不到代理或预算时直接结束为 deferred
pub struct FetchTask {
    url: String,
    max_retries: u32,
    /// 同一代理上的网络错误重试次数
    retries: u32,
    /// 因代理失败而更换代理的次数
    rotations: u32,
    trace: Vec<&'static str>,
}

impl FetchTask {
    pub fn new(url: impl Into<String>, max_retries: u32) -> Self {
        Self { url: url.into(), max_retries, retries: 0, rotations: 0, trace: vec![] }
    }

    /// 经过的状态序列，用于审计和测试
    pub fn trace(&self) -> &[&'static str] {
        &self.trace
    }

    pub async fn run(&mut self, ctx: &CrawlContext) -> FetchOutcome {
        let domain = match Url::parse(&self.url) {
            Ok(url) => match url.host_str() {
                Some(host) => host.to_owned(),
                None => return FetchOutcome::Skipped(format!("地址缺少域名: {}", self.url)),
            },
            Err(e) => return FetchOutcome::Skipped(format!("无效地址 {}: {e}", self.url)),
        };

        let mut state = FetchState::AcquiringProxy;
        loop {
            self.trace.push(state.name());
            state = match state {
                FetchState::Done(outcome) => return outcome,
                state => self.step(state, &domain, ctx).await,
            };
        }
    }

    async fn step(&mut self, state: FetchState, domain: &str, ctx: &CrawlContext) -> FetchState {
        match state {
            FetchState::AcquiringProxy => match ctx.proxies.acquire() {
                Ok(lease) => FetchState::BudgetCheck(lease),
                Err(e) => FetchState::Done(FetchOutcome::Deferred(e)),
            },
            FetchState::BudgetCheck(lease) => {
                if ctx.limiter.try_acquire(domain) {
                    FetchState::Fetching(lease)
                } else {
                    FetchState::Done(FetchOutcome::Deferred(Error::BudgetDenied(domain.to_owned())))
                }
            }
            FetchState::Fetching(lease) => {
                let attempt = match ctx.http.get(&self.url, &lease).await.map(classify) {
                    Ok(Response::Image(data)) => Attempt::Image(data),
                    Ok(Response::Blocked) => Attempt::Blocked,
                    Ok(Response::Gone(status)) => Attempt::Gone(status),
                    Ok(Response::Transient(reason)) => self.network_failure(reason),
                    Err(e) => self.network_failure(e.to_string()),
                };
                match attempt {
                    // 网络错误先在同一个代理上重试，重试仍要遵守域名预算
                    Attempt::NetworkFailure(_) if self.retries <= self.max_retries => {
                        FetchState::BudgetCheck(lease)
                    }
                    attempt => FetchState::ReportingOutcome(lease, attempt),
                }
            }
            FetchState::ReportingOutcome(lease, attempt) => {
                let success = matches!(attempt, Attempt::Image(_) | Attempt::Gone(_));
                ctx.proxies.report_outcome(&lease, success);
                match attempt {
                    Attempt::Image(data) => FetchState::Done(FetchOutcome::Fetched(data)),
                    Attempt::Gone(status) => {
                        FetchState::Done(FetchOutcome::Skipped(format!("HTTP {status}")))
                    }
                    Attempt::Blocked => FetchState::Done(FetchOutcome::Blocked),
                    Attempt::NetworkFailure(reason) => {
                        debug!("代理 {} 抓取 {} 失败: {reason}", lease.endpoint, self.url);
                        if self.rotations < self.max_retries {
                            FetchState::Retry
                        } else {
                            FetchState::Done(FetchOutcome::Skipped(reason))
                        }
                    }
                }
            }
            FetchState::Retry => {
                self.rotations += 1;
                self.retries = 0;
                FetchState::AcquiringProxy
            }
            FetchState::Done(outcome) => FetchState::Done(outcome),
        }
    }

    fn network_failure(&mut self, reason: String) -> Attempt {
        self.retries += 1;
        Attempt::NetworkFailure(reason)
    }
}
