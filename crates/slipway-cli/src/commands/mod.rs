//! Subcommand implementations. Each returns the process exit code.

pub mod follow;

use serde_json::json;
use slipway_api::StatusView;
use slipway_core::FailureCategory;
use slipway_deploy::RollbackAction;
use slipway_state::{QueueEntry, SignalEntry};
use tokio::time::Instant;

use crate::client::ApiClient;
use follow::Follow;

/// `slipway deploy <version>`
pub async fn deploy(client: &ApiClient, version: &str, wait: Option<Follow>) -> anyhow::Result<i32> {
    let reply = client
        .post::<QueueEntry>("/api/v1/deployments", Some(json!({ "version": version })))
        .await?;
    if reply.status == http::StatusCode::UNPROCESSABLE_ENTITY {
        eprintln!("{}", reply.error.unwrap_or_else(|| format!("invalid artifact {version}")));
        return Ok(FailureCategory::InvalidArtifact.exit_code());
    }
    let entry = reply.into_data()?;
    println!("queued {} as request #{}", entry.request.version, entry.seq);

    match wait {
        Some(follow) => follow::request(client, entry.seq, follow).await,
        None => Ok(0),
    }
}

/// `slipway status`
pub async fn status(client: &ApiClient) -> anyhow::Result<i32> {
    let view: StatusView = client.get("/api/v1/status").await?.into_data()?;
    println!("daemon:     {}", client.address());
    println!("service:    {}", view.service);
    println!("production: {}", view.production.map_or("none".to_string(), |p| p.to_string()));
    println!("test:       {}", view.test.map_or("none".to_string(), |p| p.to_string()));

    for pool in &view.pools {
        let healthy = pool
            .health
            .values()
            .filter(|h| **h == slipway_state::HealthStatus::Healthy)
            .count();
        println!(
            "  {:<6} {:<10} {:<12} {}/{} instances, {} healthy{}",
            pool.id.as_str(),
            format!("{:?}", pool.role).to_lowercase(),
            pool.version.as_deref().unwrap_or("-"),
            pool.current_count(),
            pool.desired_count,
            healthy,
            if pool.under_validation { ", under validation" } else { "" },
        );
    }

    match &view.active {
        Some(active) => println!("active:     {} {} ({})", active.id, active.version(), active.phase),
        None => println!("active:     none"),
    }
    if let Some(last) = &view.last_completed {
        println!("last:       {} {}", last.id, last.version());
    }
    if !view.queued.is_empty() {
        let queued: Vec<String> = view
            .queued
            .iter()
            .map(|e| format!("#{} {}", e.seq, e.request.version))
            .collect();
        println!("queued:     {}", queued.join(", "));
    }
    Ok(0)
}

/// `slipway rollback`
pub async fn rollback(client: &ApiClient, wait: Option<Follow>) -> anyhow::Result<i32> {
    let action: RollbackAction = client.post("/api/v1/rollback", None).await?.into_data()?;
    match (action, wait) {
        (RollbackAction::Signalled { deployment_id }, wait) => {
            println!("rollback requested for {deployment_id}");
            match wait {
                Some(follow) => {
                    let deadline = Instant::now() + follow.timeout;
                    follow::deployment(client, &deployment_id, follow, deadline, None).await
                }
                None => Ok(0),
            }
        }
        (RollbackAction::Queued { seq, version }, wait) => {
            println!("queued previous version {version} as request #{seq}");
            match wait {
                Some(follow) => follow::request(client, seq, follow).await,
                None => Ok(0),
            }
        }
    }
}

/// `slipway cancel`
pub async fn cancel(client: &ApiClient, wait: Option<Follow>) -> anyhow::Result<i32> {
    let entry = signal(client, "cancel", None).await?;
    println!("cancel requested for {}", entry.deployment_id);
    match wait {
        Some(follow) => {
            let deadline = Instant::now() + follow.timeout;
            follow::deployment(client, &entry.deployment_id, follow, deadline, None).await
        }
        None => Ok(0),
    }
}

/// `slipway approve`
pub async fn approve(client: &ApiClient) -> anyhow::Result<i32> {
    let entry = signal(client, "approve", None).await?;
    println!("approved {}", entry.deployment_id);
    Ok(0)
}

/// `slipway reject`
pub async fn reject(client: &ApiClient, reason: Option<String>) -> anyhow::Result<i32> {
    let body = reason.map(|reason| json!({ "reason": reason }));
    let entry = signal(client, "reject", body).await?;
    println!("rejected {}", entry.deployment_id);
    Ok(0)
}

async fn signal(client: &ApiClient, action: &str, body: Option<serde_json::Value>) -> anyhow::Result<SignalEntry> {
    client.post(&format!("/api/v1/active/{action}"), body).await?.into_data()
}
