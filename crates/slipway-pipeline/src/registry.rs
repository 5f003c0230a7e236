//! Artifact registry lookups.

use std::time::Duration;

use async_trait::async_trait;
use slipway_core::ArtifactRef;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("registry lookup failed: {0}")]
    Lookup(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Confirms that a published artifact exists.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    async fn lookup(&self, artifact: &ArtifactRef) -> RegistryResult<()>;
}

/// Accepts every well-formed reference without asking anyone.
pub struct TrustingRegistry;

#[async_trait]
impl ArtifactRegistry for TrustingRegistry {
    async fn lookup(&self, _artifact: &ArtifactRef) -> RegistryResult<()> {
        Ok(())
    }
}

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI distribution API over plain HTTP:
/// `HEAD /v2/<repository>/manifests/<tag>`.
pub struct HttpRegistry {
    /// Overrides the host:port taken from the artifact reference.
    endpoint: Option<String>,
    timeout: Duration,
}

impl HttpRegistry {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    async fn head(&self, address: &str, path: &str) -> RegistryResult<http::StatusCode> {
        let uri = format!("http://{address}{path}");
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| RegistryError::Lookup(format!("connect {address}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RegistryError::Lookup(format!("handshake: {e}")))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("HEAD")
            .uri(&uri)
            .header("host", address)
            .header("accept", MANIFEST_ACCEPT)
            .header("user-agent", "slipway/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| RegistryError::Lookup(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| RegistryError::Lookup(format!("request: {e}")))?;
        debug!(%uri, status = %resp.status(), "registry lookup");
        Ok(resp.status())
    }
}

#[async_trait]
impl ArtifactRegistry for HttpRegistry {
    async fn lookup(&self, artifact: &ArtifactRef) -> RegistryResult<()> {
        let address = self.endpoint.as_deref().unwrap_or(&artifact.registry);
        let path = format!("/v2/{}/manifests/{}", artifact.repository, artifact.tag);

        let status = tokio::time::timeout(self.timeout, self.head(address, &path))
            .await
            .map_err(|_| RegistryError::Lookup(format!("timed out after {:?}", self.timeout)))??;

        if status.is_success() {
            Ok(())
        } else if status == http::StatusCode::NOT_FOUND {
            Err(RegistryError::NotFound(artifact.image()))
        } else {
            Err(RegistryError::Lookup(format!("registry answered {status}")))
        }
    }
}
