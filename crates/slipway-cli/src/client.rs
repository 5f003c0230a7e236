//! Minimal HTTP/1 client for the daemon's REST API.

use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use slipway_api::ApiResponse;
use tracing::debug;

/// Outcome of one API call: HTTP status plus the decoded envelope.
#[derive(Debug)]
pub struct Reply<T> {
    pub status: StatusCode,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> Reply<T> {
    /// The payload of a successful call, or the server's error message.
    pub fn into_data(self) -> anyhow::Result<T> {
        match (self.data, self.error) {
            (Some(data), _) if self.status.is_success() => Ok(data),
            (_, Some(error)) => bail!("{} ({})", error, self.status),
            _ => bail!("daemon answered {} without a body", self.status),
        }
    }
}

pub struct ApiClient {
    /// host:port of the daemon.
    address: String,
    timeout: Duration,
}

impl ApiClient {
    /// Accepts `http://host:port`, `host:port`, with or without a trailing
    /// slash.
    pub fn new(server: &str, timeout: Duration) -> anyhow::Result<Self> {
        let address = server
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        if server.starts_with("https://") {
            bail!("https is not supported: {server}");
        }
        if address.is_empty() || address.contains('/') {
            bail!("invalid server address: {server}");
        }
        Ok(Self { address, timeout })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<Reply<T>> {
        self.call(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<Reply<T>> {
        self.call(Method::POST, path, body).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<Reply<T>> {
        tokio::time::timeout(self.timeout, self.send(method, path, body))
            .await
            .with_context(|| format!("daemon at {} did not answer within {:?}", self.address, self.timeout))?
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<Reply<T>> {
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("cannot reach daemon at {}", self.address))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let payload = match &body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };
        let req = http::Request::builder()
            .method(method.clone())
            .uri(path)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .header("user-agent", "slipway-cli/0.1")
            .body(Full::new(payload))?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        debug!(%method, %path, %status, bytes = bytes.len(), "api call");

        let envelope: ApiResponse<T> = serde_json::from_slice(&bytes)
            .with_context(|| format!("unexpected response from {method} {path} ({status})"))?;
        Ok(Reply {
            status,
            data: envelope.data,
            error: envelope.error,
        })
    }
}
