//! Polling a queued request or a deployment until it settles.

use std::time::Duration;

use anyhow::bail;
use slipway_api::RequestView;
use slipway_core::FailureCategory;
use slipway_state::{DeploymentPhase, DeploymentRecord, QueueStatus};
use tokio::time::Instant;

use crate::client::ApiClient;

/// How long and how often to poll.
#[derive(Debug, Clone, Copy)]
pub struct Follow {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Exit code for a finished deployment.
pub fn exit_code(record: &DeploymentRecord) -> i32 {
    record.failure_category().map_or(0, FailureCategory::exit_code)
}

/// Wait for the request to leave the queue, then follow its deployment.
pub async fn request(client: &ApiClient, seq: u64, follow: Follow) -> anyhow::Result<i32> {
    let deadline = Instant::now() + follow.timeout;
    let mut last_phase = None;
    loop {
        let view: RequestView = client.get(&format!("/api/v1/requests/{seq}")).await?.into_data()?;
        match view.entry.status {
            QueueStatus::Queued => {}
            QueueStatus::Skipped { reason } => {
                println!("request #{seq} skipped: {reason}");
                return Ok(0);
            }
            QueueStatus::Superseded { by_seq } => {
                println!("request #{seq} superseded by #{by_seq}");
                return Ok(0);
            }
            QueueStatus::PipelineFailed { error } => {
                eprintln!("request #{seq} failed: {error}");
                return Ok(FailureCategory::Pipeline.exit_code());
            }
            QueueStatus::Admitted { deployment_id } => {
                if let Some(record) = view.deployment {
                    report_phase(&record, &mut last_phase);
                    if record.is_terminal() {
                        return Ok(finish(&record));
                    }
                    return deployment(client, &deployment_id, follow, deadline, last_phase).await;
                }
            }
        }
        if Instant::now() >= deadline {
            bail!("request #{seq} still queued after {:?}", follow.timeout);
        }
        tokio::time::sleep(follow.interval).await;
    }
}

/// Poll a deployment until it reaches a terminal phase.
pub async fn deployment(
    client: &ApiClient,
    id: &str,
    follow: Follow,
    deadline: Instant,
    mut last_phase: Option<DeploymentPhase>,
) -> anyhow::Result<i32> {
    loop {
        let record: DeploymentRecord = client.get(&format!("/api/v1/deployments/{id}")).await?.into_data()?;
        report_phase(&record, &mut last_phase);
        if record.is_terminal() {
            return Ok(finish(&record));
        }
        if Instant::now() >= deadline {
            bail!("deployment {id} still {} after {:?}", record.phase, follow.timeout);
        }
        tokio::time::sleep(follow.interval).await;
    }
}

fn report_phase(record: &DeploymentRecord, last: &mut Option<DeploymentPhase>) {
    if *last != Some(record.phase) {
        println!("{} {}: {}", record.id, record.version(), record.phase);
        *last = Some(record.phase);
    }
}

fn finish(record: &DeploymentRecord) -> i32 {
    if let Some(outcome) = &record.outcome {
        println!("{}", outcome.summary);
        if let Some(remediation) = &outcome.remediation {
            eprintln!("manual intervention required:");
            eprintln!("  production pool: {}", slot(remediation.production_pool));
            eprintln!("  orphaned pool:   {}", slot(remediation.orphaned_pool));
            eprintln!("  last state:      {}", remediation.last_state);
            eprintln!("  last error:      {}", remediation.last_error);
        }
    }
    let code = exit_code(record);
    if let Some(category) = record.failure_category() {
        eprintln!("deployment {} ended with {} (exit {code})", record.id, category.label());
    }
    code
}

fn slot(slot: Option<slipway_state::PoolSlot>) -> String {
    slot.map_or("none".to_string(), |s| s.to_string())
}
