use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Url;
use serde::Deserialize;

use super::{MediaLister, SourceKind};
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct ListResponse {
    media: Vec<String>,
}

/// 通过外部解析服务列出账号下的图片
///
/// 请求 `GET {endpoint}/{kind}/{profile}`，服务返回 `{"media": [...]}`
pub struct RemoteLister {
    client: reqwest::Client,
    endpoint: Url,
    kind: SourceKind,
}

impl RemoteLister {
    pub fn new(endpoint: &str, kind: SourceKind, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::InvalidArgument(format!("无效的地址 {endpoint}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::InvalidArgument(format!("无效的地址: {endpoint}")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self { client, endpoint, kind })
    }

    fn url(&self, profile_ref: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(self.kind.as_str()).push(profile_ref);
        }
        url
    }
}

#[async_trait]
impl MediaLister for RemoteLister {
    async fn list_media(&self, profile_ref: &str) -> Result<Vec<String>> {
        let url = self.url(profile_ref);
        debug!("列出图片: {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Fetch(e.to_string()))?;
        let body = response.json::<ListResponse>().await.map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(body.media)
    }
}
