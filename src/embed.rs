//! 人脸向量化
//!
//! 模型推理不在本 crate 中实现，通过 [`Embedder`] 接入外部服务

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};

/// 将图片转换为固定维度的向量
#[async_trait]
pub trait Embedder: Send + Sync {
    /// 向量维度
    fn dimension(&self) -> usize;

    /// 模型版本，随向量一同保存
    fn model_version(&self) -> &str;

    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>>;
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// 通过 HTTP 调用的向量化服务
///
/// 以 `application/octet-stream` 提交图片原始字节，服务返回 `{"embedding": [...]}`
pub struct RemoteEmbedder {
    client: reqwest::Client,
    endpoint: String,
    dim: usize,
    model_version: String,
}

impl RemoteEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        dim: usize,
        model_version: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Embed(e.to_string()))?;
        Ok(Self { client, endpoint: endpoint.into(), dim, model_version: model_version.into() })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn embed(&self, image: &[u8]) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Embed(e.to_string()))?;
        let body = response.json::<EmbedResponse>().await.map_err(|e| Error::Embed(e.to_string()))?;
        debug!("向量化完成: {} 维", body.embedding.len());
        if body.embedding.len() != self.dim {
            return Err(Error::DimensionMismatch { expected: self.dim, actual: body.embedding.len() });
        }
        Ok(body.embedding)
    }
}
