use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::error::FetchError;

/// Raw outcome of a single GET: status code and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, body: body.into() }
    }
}

/// The single network operation the fetcher depends on.
///
/// Implementations report connection-level problems as
/// [`FetchError::Transport`]; any HTTP status is returned as a response.
#[async_trait]
pub trait HttpTransport: Send + Sync + Debug {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let res = self.http.get(url).send().await.map_err(describe)?;
        let status = res.status().as_u16();
        let body = res.bytes().await.map_err(describe)?;
        Ok(HttpResponse { status, body: body.to_vec() })
    }
}

// URLs carry API keys; keep them out of error messages.
fn describe(err: reqwest::Error) -> FetchError {
    let err = err.without_url();
    if err.is_timeout() {
        FetchError::Transport(format!("request timed out: {err}"))
    } else if err.is_connect() {
        FetchError::Transport(format!("connection failed: {err}"))
    } else {
        FetchError::Transport(err.to_string())
    }
}
