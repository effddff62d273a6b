mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::api::caller_key;
pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(api::search_handler, api::add_handler, api::metrics_handler),
    components(schemas(
        types::SearchForm,
        types::SearchResponse,
        types::AddForm,
        crate::facedb::SearchHit,
        crate::facedb::IngestOutcome,
        crate::facedb::IngestStage,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    let guard = middleware::from_fn_with_state(state.clone(), api::guard_middleware);
    Router::new()
        .route("/search", post(api::search_handler).route_layer(guard))
        .route("/add", post(api::add_handler))
        .route("/metrics", get(api::metrics_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 上传限制：10M
        .layer(RequestBodyLimitLayer::new(1024 * 1024 * 10))
        .with_state(state)
}
