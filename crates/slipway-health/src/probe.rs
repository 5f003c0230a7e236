//! Health probe backends.
//!
//! [`HealthProbe::check`] answers `Healthy`, `Unhealthy` or `Unknown` for a
//! single instance. `Unknown` means "could not tell": the instance is still
//! starting, or the probe itself failed to connect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slipway_core::config::{HealthConfig, ProbeKind};
use slipway_state::{HealthStatus, InstanceStatus};
use slipway_traffic::{BackendError, SchedulerApi};
use tracing::debug;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, instance: &str) -> HealthStatus;
}

/// Derives health from the scheduler's view of the instance.
pub struct SchedulerProbe {
    scheduler: Arc<dyn SchedulerApi>,
}

impl SchedulerProbe {
    pub fn new(scheduler: Arc<dyn SchedulerApi>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl HealthProbe for SchedulerProbe {
    async fn check(&self, instance: &str) -> HealthStatus {
        match self.scheduler.describe_instance(instance).await {
            Ok(desc) => match desc.status {
                InstanceStatus::Running => HealthStatus::Healthy,
                InstanceStatus::Pending => HealthStatus::Unknown,
                InstanceStatus::Stopping | InstanceStatus::Stopped | InstanceStatus::Failed => {
                    HealthStatus::Unhealthy
                }
            },
            // An instance the scheduler no longer knows is gone.
            Err(BackendError::NotFound(_)) => HealthStatus::Unhealthy,
            Err(e) => {
                debug!(%instance, error = %e, "describe_instance failed");
                HealthStatus::Unknown
            }
        }
    }
}

/// HTTP GET of a fixed path on each instance's address.
pub struct HttpProbe {
    scheduler: Arc<dyn SchedulerApi>,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(scheduler: Arc<dyn SchedulerApi>, path: &str, timeout: Duration) -> Self {
        Self {
            scheduler,
            path: path.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, instance: &str) -> HealthStatus {
        let address = match self.scheduler.describe_instance(instance).await {
            Ok(desc) => match desc.address {
                Some(address) => address,
                None => return HealthStatus::Unknown,
            },
            Err(BackendError::NotFound(_)) => return HealthStatus::Unhealthy,
            Err(_) => return HealthStatus::Unknown,
        };
        http_check(&address, &self.path, self.timeout).await
    }
}

/// Build the probe selected by `[health] probe`.
pub fn probe_from_config(config: &HealthConfig, scheduler: Arc<dyn SchedulerApi>) -> Arc<dyn HealthProbe> {
    match config.probe {
        ProbeKind::Scheduler => Arc::new(SchedulerProbe::new(scheduler)),
        ProbeKind::Http => Arc::new(HttpProbe::new(scheduler, &config.path, config.timeout())),
    }
}

/// Perform an HTTP health check against `address`.
///
/// Returns `Healthy` for 2xx, `Unhealthy` for any other status, and
/// `Unknown` if the connection fails or the request times out.
pub async fn http_check(address: &str, path: &str, timeout: Duration) -> HealthStatus {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return HealthStatus::Unknown;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return HealthStatus::Unknown;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "slipway-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "invalid health probe request");
                return HealthStatus::Unknown;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => HealthStatus::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                HealthStatus::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                HealthStatus::Unknown
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        HealthStatus::Unknown
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_state::{PoolSlot, StateStore, TaskDefinition};
    use slipway_traffic::{LocalScheduler, PoolSpec};

    async fn scheduler_with_instance(startup: Duration) -> (Arc<LocalScheduler>, String) {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = Arc::new(LocalScheduler::new(store, startup, 9000));
        let handles = scheduler
            .create_instances(&PoolSpec {
                service: "api".to_string(),
                pool: PoolSlot::Green,
                generation: 1,
                task: TaskDefinition {
                    image: "registry.example.com/team/api:v2".to_string(),
                    version: "v2".to_string(),
                    cpu: 256,
                    memory_mib: 512,
                    container_port: 8080,
                    manifest: serde_json::json!({}),
                },
                count: 1,
            })
            .await
            .unwrap();
        (scheduler, handles[0].clone())
    }

    #[tokio::test]
    async fn scheduler_probe_maps_status() {
        let (scheduler, handle) = scheduler_with_instance(Duration::ZERO).await;
        let probe = SchedulerProbe::new(scheduler.clone());
        assert_eq!(probe.check(&handle).await, HealthStatus::Healthy);

        scheduler.set_status(&handle, InstanceStatus::Failed).unwrap();
        assert_eq!(probe.check(&handle).await, HealthStatus::Unhealthy);
        assert_eq!(probe.check("missing").await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn pending_instance_is_unknown() {
        let (scheduler, handle) = scheduler_with_instance(Duration::from_secs(3600)).await;
        let probe = SchedulerProbe::new(scheduler);
        assert_eq!(probe.check(&handle).await, HealthStatus::Unknown);
    }

    async fn serve(status: http::StatusCode) -> String {
        let app = axum::Router::new().route("/healthz", axum::routing::get(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn http_check_2xx_is_healthy() {
        let address = serve(http::StatusCode::OK).await;
        assert_eq!(
            http_check(&address, "/healthz", Duration::from_secs(2)).await,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn http_check_5xx_is_unhealthy() {
        let address = serve(http::StatusCode::SERVICE_UNAVAILABLE).await;
        assert_eq!(
            http_check(&address, "/healthz", Duration::from_secs(2)).await,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn http_check_connection_refused_is_unknown() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert_eq!(
            http_check(&address, "/healthz", Duration::from_secs(2)).await,
            HealthStatus::Unknown
        );
    }
}
