//! Ingestion Client
//!
//! HTTP client of the remote ingestion service. One session is posted per request; the response
//! carries the server's validation verdict.
use crate::{
    api::controller::IngestionApi,
    core::constants::UPLOAD_PATH,
    model::{queue::UploadResponse, session::Session},
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::trace;
use std::time::Duration;

/// Characters of an error body kept in the failure message.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpIngestionClient {
    client: reqwest::Client,
    upload_url: String,
    token: Option<String>,
}

impl HttpIngestionClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("HTTP client init failed")?;
        Ok(Self {
            client,
            upload_url: format!("{}{}", base_url.trim_end_matches('/'), UPLOAD_PATH),
            token,
        })
    }

    pub fn upload_url(&self) -> &str {
        &self.upload_url
    }
}

fn describe(e: reqwest::Error) -> anyhow::Error {
    if e.is_timeout() {
        anyhow!("upload timed out")
    } else if e.is_connect() {
        anyhow!("ingestion service unreachable: {}", e)
    } else {
        anyhow!("network error: {}", e)
    }
}

#[async_trait]
impl IngestionApi for HttpIngestionClient {
    async fn upload(&self, session: &Session) -> Result<UploadResponse> {
        let mut request = self.client.post(&self.upload_url).json(session);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        trace!("POST {} for session {}", self.upload_url, session.id);
        let response = request.send().await.map_err(describe)?;
        let status = response.status();
        let body = response.text().await.map_err(describe)?;
        if !status.is_success() {
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(anyhow!(
                "server returned HTTP {}: {}",
                status.as_u16(),
                body.trim()
            ));
        }
        serde_json::from_str(&body).map_err(|e| anyhow!("malformed response: {}", e))
    }
}
