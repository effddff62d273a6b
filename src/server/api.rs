use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum_typed_multipart::TypedMultipart;
use log::info;

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::facedb::{IngestOutcome, IngestStage};
use crate::metrics;
use crate::ratelimit::CallerKey;

/// 从请求头和对端地址中提取调用方标识
///
/// 只有对端是受信任的代理时才读取 `X-Forwarded-For`，从右往左取第一个不受信任的地址
pub fn caller_key(headers: &HeaderMap, peer: Option<SocketAddr>, trusted: &[IpAddr]) -> CallerKey {
    let ip = match peer {
        Some(peer) if trusted.contains(&peer.ip()) => {
            forwarded_client(headers, trusted).unwrap_or_else(|| peer.ip().to_string())
        }
        Some(peer) => peer.ip().to_string(),
        None => "unknown".to_owned(),
    };
    let device_id = headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous");
    CallerKey::new(ip, device_id)
}

fn forwarded_client(headers: &HeaderMap, trusted: &[IpAddr]) -> Option<String> {
    let hops = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>();
    hops.into_iter()
        .rev()
        .find(|hop| hop.parse::<IpAddr>().map_or(true, |ip| !trusted.contains(&ip)))
        .map(str::to_owned)
}

/// 搜索接口的限速中间件
pub async fn guard_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let caller = caller_key(req.headers(), peer, &state.trusted_proxies);
    if let Err(tier) = state.guard.check(&caller).await {
        return Err(AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            anyhow::anyhow!("请求过于频繁，已触发 {} 档限速", tier.name),
        ));
    }
    Ok(next.run(req).await)
}

/// 搜索一张图片
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    params(
        ("X-Device-Id" = Option<String>, Header, description = "设备 ID"),
    ),
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "图片无法解码或参数无效"),
        (status = 429, description = "请求过于频繁"),
        (status = 502, description = "向量化服务失败或返回的维度不符"),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let start = Instant::now();
    let top_k = data.top_k.unwrap_or(state.top_k);

    info!("正在搜索上传图片");
    let result = state.db.query(&data.file, top_k).await?;

    Ok(Json(SearchResponse { time: start.elapsed().as_millis() as u64, result }))
}

/// 添加图片到人脸库
#[utoipa::path(
    post,
    path = "/add",
    request_body(content = AddForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = IngestOutcome),
        (status = 400, body = IngestOutcome, description = "图片被拒绝"),
    )
)]
pub async fn add_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<AddRequest>,
) -> Result<(StatusCode, Json<IngestOutcome>)> {
    if data.source_uri.trim().is_empty() {
        return Err(AppError::new(StatusCode::BAD_REQUEST, anyhow::anyhow!("source_uri 不能为空")));
    }
    let outcome = state.db.ingest(&data.file, &data.source_uri).await?;
    let status = match &outcome {
        IngestOutcome::Rejected { stage: IngestStage::Embed, .. } => StatusCode::BAD_GATEWAY,
        IngestOutcome::Rejected { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// Prometheus 指标
#[utoipa::path(get, path = "/metrics", responses((status = 200, body = String)))]
pub async fn metrics_handler() -> String {
    metrics::gather_text()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_key() {
        let peer = Some("10.1.2.3:5555".parse().unwrap());
        let mut headers = HeaderMap::new();
        assert_eq!(caller_key(&headers, peer, &[]), CallerKey::new("10.1.2.3", "anonymous"));
        assert_eq!(caller_key(&headers, None, &[]), CallerKey::new("unknown", "anonymous"));

        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-device-id", "dev-42".parse().unwrap());
        assert_eq!(caller_key(&headers, peer, &[]), CallerKey::new("10.1.2.3", "dev-42"));
    }

    #[test]
    fn test_caller_key_behind_proxy() {
        let proxy: IpAddr = "10.1.2.3".parse().unwrap();
        let inner: IpAddr = "10.0.0.1".parse().unwrap();
        let peer = Some(SocketAddr::new(proxy, 5555));
        let mut headers = HeaderMap::new();

        // 代理没有带上转发头时退回对端地址
        assert_eq!(caller_key(&headers, peer, &[proxy]), CallerKey::new("10.1.2.3", "anonymous"));

        // 客户端自己伪造的最左侧地址被忽略
        headers.insert("x-forwarded-for", "1.1.1.1, 203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(caller_key(&headers, peer, &[proxy, inner]), CallerKey::new("203.0.113.9", "anonymous"));
        assert_eq!(caller_key(&headers, peer, &[proxy]), CallerKey::new("10.0.0.1", "anonymous"));

        // 对端不在信任列表中时不读取转发头
        let stranger = Some("198.51.100.7:4000".parse().unwrap());
        assert_eq!(caller_key(&headers, stranger, &[proxy]), CallerKey::new("198.51.100.7", "anonymous"));
    }
}
