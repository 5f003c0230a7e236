//! Admission coordinator and operator commands over the local backends.

use std::sync::Arc;
use std::time::Duration;

use slipway_core::SlipwayConfig;
use slipway_core::config::QueuePolicy;
use slipway_deploy::{Coordinator, DeployError, MachineDeps, MachineSettings, Operator, RollbackAction};
use slipway_health::SchedulerProbe;
use slipway_pipeline::{ArtifactEventListener, Pipeline, TrustingRegistry};
use slipway_state::*;
use slipway_traffic::{ControllerSettings, LocalLoadBalancer, LocalScheduler, SchedulerApi, TrafficController};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

fn config() -> SlipwayConfig {
    let mut config = SlipwayConfig::scaffold("api", "registry.example.com/team/api");
    config.health.interval = "5ms".into();
    config.traffic.window = "5ms".into();
    config.traffic.provision_timeout = "2s".into();
    config.traffic.backoff_base = "1ms".into();
    config.traffic.backoff_max = "2ms".into();
    config.traffic.drain_grace = "0ms".into();
    config.shift.bake = "5ms".into();
    config.pipeline.backoff_base = "1ms".into();
    config.pipeline.backoff_max = "2ms".into();
    config.backend.startup_delay = "0ms".into();
    config
}

struct Service {
    store: StateStore,
    deps: MachineDeps,
    config: Arc<SlipwayConfig>,
    wake: Arc<Notify>,
    listener: Arc<ArtifactEventListener>,
}

impl Service {
    fn new(config: SlipwayConfig) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler: Arc<dyn SchedulerApi> = Arc::new(LocalScheduler::new(store.clone(), Duration::ZERO, 9000));
        let balancer = Arc::new(LocalLoadBalancer::new(store.clone()));
        let traffic = Arc::new(TrafficController::new(
            "api",
            store.clone(),
            scheduler.clone(),
            balancer,
            ControllerSettings::from_config(&config),
        ));
        let mut settings = MachineSettings::from_config(&config);
        settings.signal_poll = Duration::from_millis(5);
        let deps = MachineDeps {
            store: store.clone(),
            traffic,
            probe: Arc::new(SchedulerProbe::new(scheduler)),
            settings,
        };
        let wake = Arc::new(Notify::new());
        let listener = Arc::new(ArtifactEventListener::new(
            &config,
            store.clone(),
            Arc::new(TrustingRegistry),
            wake.clone(),
        ));
        Self {
            store,
            deps,
            config: Arc::new(config),
            wake,
            listener,
        }
    }

    fn coordinator(&self) -> Coordinator {
        let pipeline = Pipeline::new(self.store.clone(), self.config.clone());
        Coordinator::new(&self.config, pipeline, self.deps.clone(), self.wake.clone())
            .with_idle_poll(Duration::from_millis(10))
    }

    fn start(&self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(self.coordinator().run(rx));
        (tx, task)
    }

    fn operator(&self) -> Operator {
        Operator::new("api", self.store.clone(), self.listener.clone())
    }

    async fn submit(&self, version: &str) -> QueueEntry {
        self.listener.submit_version(version, RequestSource::Operator).await.unwrap()
    }

    fn finished(&self) -> Vec<DeploymentRecord> {
        let mut done: Vec<_> = self
            .store
            .list_deployments("api")
            .unwrap()
            .into_iter()
            .filter(DeploymentRecord::is_terminal)
            .collect();
        done.sort_by_key(|d| d.request_seq);
        done
    }

    async fn wait_for(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !check(self) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn entry(&self, seq: u64) -> QueueEntry {
        self.store.get_queue_entry("api", seq).unwrap().unwrap()
    }
}

async fn stop(tx: watch::Sender<bool>, task: JoinHandle<()>) {
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn queued_requests_run_one_at_a_time_in_order() {
    let svc = Service::new(config());
    for version in ["v1", "v2", "v3"] {
        svc.submit(version).await;
    }

    let (tx, task) = svc.start();
    svc.wait_for("three deployments", |s| s.finished().len() == 3).await;
    stop(tx, task).await;

    let done = svc.finished();
    let versions: Vec<_> = done.iter().map(|d| d.version().to_string()).collect();
    assert_eq!(versions, ["v1", "v2", "v3"]);
    assert!(done.iter().all(|d| d.phase == DeploymentPhase::Completed));
    for pair in done.windows(2) {
        assert!(
            pair[1].started_at_ms >= pair[0].updated_at_ms,
            "{} started before {} finished",
            pair[1].id,
            pair[0].id
        );
    }

    // v3 landed on blue again: blue, green, blue.
    let pools: Vec<_> = done.iter().map(|d| d.candidate_pool.unwrap()).collect();
    assert_eq!(pools, [PoolSlot::Blue, PoolSlot::Green, PoolSlot::Blue]);
    assert_eq!(svc.deps.traffic.production_pool().await.unwrap(), Some(PoolSlot::Blue));
    assert!(svc.store.list_instances("api-green-").unwrap().is_empty());
}

#[tokio::test]
async fn keep_latest_supersedes_older_requests() {
    let mut config = config();
    config.queue.policy = QueuePolicy::KeepLatest;
    let svc = Service::new(config);
    let v1 = svc.submit("v1").await;
    let v2 = svc.submit("v2").await;
    let v3 = svc.submit("v3").await;

    let (tx, task) = svc.start();
    svc.wait_for("one deployment", |s| s.finished().len() == 1).await;
    stop(tx, task).await;

    assert_eq!(svc.entry(v1.seq).status, QueueStatus::Superseded { by_seq: v3.seq });
    assert_eq!(svc.entry(v2.seq).status, QueueStatus::Superseded { by_seq: v3.seq });
    assert!(matches!(svc.entry(v3.seq).status, QueueStatus::Admitted { .. }));
    let done = svc.finished();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].version(), "v3");
}

#[tokio::test]
async fn resubmitting_the_production_version_is_skipped() {
    let svc = Service::new(config());
    svc.submit("v1").await;
    let (tx, task) = svc.start();
    svc.wait_for("v1", |s| s.finished().len() == 1).await;
    let generation = svc.deps.traffic.pool(PoolSlot::Blue).unwrap().generation;

    let again = svc.submit("v1").await;
    svc.wait_for("skip", |s| matches!(s.entry(again.seq).status, QueueStatus::Skipped { .. }))
        .await;
    stop(tx, task).await;

    assert_eq!(svc.finished().len(), 1);
    assert_eq!(svc.deps.traffic.pool(PoolSlot::Blue).unwrap().generation, generation);
    assert_eq!(svc.deps.traffic.pool(PoolSlot::Green).unwrap().generation, 0);
}

#[tokio::test]
async fn skip_follows_the_pool_production_serves() {
    let svc = Service::new(config());
    svc.submit("v1").await;
    svc.submit("v2").await;
    let (tx, task) = svc.start();
    svc.wait_for("v1 and v2", |s| s.finished().len() == 2).await;
    stop(tx, task).await;

    // Hand remediation: v1 put back on blue and given production, while the
    // last completed deployment is still v2.
    let v1 = svc.finished().remove(0).descriptor;
    let traffic = &svc.deps.traffic;
    traffic.provision_candidate(PoolSlot::Blue, "manual", &v1).await.unwrap();
    traffic.shift_production(PoolSlot::Blue).await.unwrap();
    traffic.set_under_validation(PoolSlot::Blue, false).await.unwrap();

    let (tx, task) = svc.start();
    let same = svc.submit("v1").await;
    svc.wait_for("v1 skip", |s| matches!(s.entry(same.seq).status, QueueStatus::Skipped { .. }))
        .await;
    let back = svc.submit("v2").await;
    svc.wait_for("v2 redeploy", |s| s.finished().len() == 3).await;
    stop(tx, task).await;

    assert!(matches!(svc.entry(back.seq).status, QueueStatus::Admitted { .. }));
    let redeploy = svc.finished().pop().unwrap();
    assert_eq!(redeploy.version(), "v2");
    assert_eq!(redeploy.phase, DeploymentPhase::Completed);
    assert_eq!(traffic.production_pool().await.unwrap(), Some(PoolSlot::Green));
}

#[tokio::test]
async fn pipeline_failure_is_recorded_on_the_entry() {
    let mut config = config();
    config.task.manifest_template = Some(r#"{"zone": "{{zone}}"}"#.to_string());
    config.pipeline.max_attempts = 2;
    let svc = Service::new(config);
    let entry = svc.submit("v1").await;

    let (tx, task) = svc.start();
    svc.wait_for("pipeline failure", |s| {
        matches!(s.entry(entry.seq).status, QueueStatus::PipelineFailed { .. })
    })
    .await;
    stop(tx, task).await;

    match svc.entry(entry.seq).status {
        QueueStatus::PipelineFailed { error } => assert!(error.contains("configure"), "{error}"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(svc.store.list_deployments("api").unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_deployment_resumes_before_new_admissions() {
    let svc = Service::new(config());
    let first = svc.submit("v1").await;
    let second = svc.submit("v2").await;

    // A previous process admitted v1 and recorded Provisioning.
    let record = Pipeline::new(svc.store.clone(), svc.config.clone()).run(&first).await.unwrap();
    let mut entry = first.clone();
    entry.status = QueueStatus::Admitted {
        deployment_id: record.id.clone(),
    };
    svc.store.put_queue_entry(&entry).unwrap();
    let mut record = record;
    record.phase = DeploymentPhase::Provisioning;
    record.candidate_pool = Some(PoolSlot::Blue);
    svc.store.put_deployment(&record).unwrap();

    let (tx, task) = svc.start();
    svc.wait_for("both deployments", |s| s.finished().len() == 2).await;
    stop(tx, task).await;

    let resumed = svc.store.get_deployment(&record.id).unwrap().unwrap();
    assert_eq!(resumed.phase, DeploymentPhase::Completed);
    assert_eq!(resumed.history[0].from, DeploymentPhase::Provisioning);
    let done = svc.finished();
    assert_eq!(done[1].request_seq, second.seq);
    assert_eq!(done[1].version(), "v2");
}

#[tokio::test]
async fn admitted_request_without_deployment_is_rerun() {
    let svc = Service::new(config());
    let mut entry = svc.submit("v1").await;
    entry.status = QueueStatus::Admitted {
        deployment_id: slipway_pipeline::deployment_id(&entry.request),
    };
    svc.store.put_queue_entry(&entry).unwrap();

    let (tx, task) = svc.start();
    svc.wait_for("v1", |s| s.finished().len() == 1).await;
    stop(tx, task).await;

    let done = svc.finished();
    assert_eq!(done[0].id, slipway_pipeline::deployment_id(&entry.request));
    assert_eq!(done[0].phase, DeploymentPhase::Completed);
}

#[tokio::test]
async fn shutdown_leaves_active_deployment_resumable() {
    let mut config = config();
    config.shift.bake = "30s".into();
    let svc = Service::new(config);
    svc.submit("v1").await;

    let (tx, task) = svc.start();
    svc.wait_for("bake", |s| {
        s.store
            .active_deployment("api")
            .unwrap()
            .is_some_and(|d| d.phase == DeploymentPhase::Baking)
    })
    .await;
    stop(tx, task).await;

    let active = svc.store.active_deployment("api").unwrap().unwrap();
    assert_eq!(active.phase, DeploymentPhase::Baking);
}

// ── Operator ───────────────────────────────────────────────────────

#[tokio::test]
async fn signals_need_an_active_deployment() {
    let svc = Service::new(config());
    let err = svc.operator().cancel().unwrap_err();
    assert!(matches!(err, DeployError::NoActiveDeployment(service) if service == "api"));
    assert!(matches!(
        svc.operator().rollback().await.unwrap_err(),
        DeployError::NothingToRollBack(_)
    ));
}

#[tokio::test]
async fn rollback_with_nothing_in_flight_redeploys_previous_version() {
    let svc = Service::new(config());
    let op = svc.operator();
    op.deploy("v1").await.unwrap();
    op.deploy("v2").await.unwrap();

    let (tx, task) = svc.start();
    svc.wait_for("v1 and v2", |s| s.finished().len() == 2).await;
    assert_eq!(op.previous_version().unwrap(), "v1");

    let action = op.rollback().await.unwrap();
    let RollbackAction::Queued { seq, version } = action else {
        panic!("expected a queued rollback, got {action:?}");
    };
    assert_eq!(version, "v1");
    assert_eq!(svc.entry(seq).request.source, RequestSource::Rollback);

    svc.wait_for("rollback deployment", |s| s.finished().len() == 3).await;
    stop(tx, task).await;

    let done = svc.finished();
    assert_eq!(done[2].version(), "v1");
    assert_eq!(done[2].phase, DeploymentPhase::Completed);
    assert_eq!(svc.deps.traffic.production_pool().await.unwrap(), Some(PoolSlot::Blue));
}

#[tokio::test]
async fn rollback_during_deployment_signals_it() {
    let mut config = config();
    config.shift.bake = "30s".into();
    let svc = Service::new(config);
    let op = svc.operator();
    op.deploy("v1").await.unwrap();

    let (tx, task) = svc.start();
    svc.wait_for("bake", |s| {
        s.store
            .active_deployment("api")
            .unwrap()
            .is_some_and(|d| d.phase == DeploymentPhase::Baking)
    })
    .await;

    let action = op.rollback().await.unwrap();
    let RollbackAction::Signalled { deployment_id } = action else {
        panic!("expected a signalled rollback, got {action:?}");
    };
    svc.wait_for("rollback", |s| s.finished().len() == 1).await;
    stop(tx, task).await;

    let done = svc.store.get_deployment(&deployment_id).unwrap().unwrap();
    // First deployment: nothing to return to.
    assert_eq!(done.phase, DeploymentPhase::Failed);
    assert!(done.failure.unwrap().message.contains("rollback requested"));
}
