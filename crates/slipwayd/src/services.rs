//! Assembles the orchestrator's components for one service.

use std::sync::Arc;

use axum::Router;
use slipway_api::ApiState;
use slipway_autoscale::{Autoscaler, ScalingPolicy, StoreMetrics};
use slipway_core::SlipwayConfig;
use slipway_deploy::{Coordinator, MachineDeps, MachineSettings, Operator};
use slipway_health::probe_from_config;
use slipway_pipeline::{ArtifactEventListener, ArtifactRegistry, HttpRegistry, Pipeline, TrustingRegistry};
use slipway_state::StateStore;
use slipway_traffic::{ControllerSettings, LocalLoadBalancer, LocalScheduler, SchedulerApi, TrafficController};
use tokio::sync::Notify;
use tracing::info;

pub struct Services {
    pub config: Arc<SlipwayConfig>,
    pub store: StateStore,
    pub traffic: Arc<TrafficController>,
    pub listener: Arc<ArtifactEventListener>,
    pub operator: Arc<Operator>,
    pub deps: MachineDeps,
    /// Shared by the listener (notify) and the coordinator (wait).
    pub wake: Arc<Notify>,
}

impl Services {
    /// Wire every component against the local scheduler and load balancer.
    pub fn assemble(config: SlipwayConfig, store: StateStore) -> Self {
        let service = config.service.name.clone();

        let scheduler: Arc<dyn SchedulerApi> = Arc::new(LocalScheduler::new(
            store.clone(),
            config.backend.startup_delay(),
            config.backend.base_port,
        ));
        let balancer = Arc::new(LocalLoadBalancer::new(store.clone()));
        let traffic = Arc::new(TrafficController::new(
            &service,
            store.clone(),
            scheduler.clone(),
            balancer,
            ControllerSettings::from_config(&config),
        ));
        info!(%service, "traffic controller initialized");

        let probe = probe_from_config(&config.health, scheduler);
        info!(probe = ?config.health.probe, "health probe initialized");

        let registry: Arc<dyn ArtifactRegistry> = if config.registry.verify {
            Arc::new(HttpRegistry::new(config.registry.endpoint.clone(), config.registry.timeout()))
        } else {
            Arc::new(TrustingRegistry)
        };
        info!(verify = config.registry.verify, "artifact registry initialized");

        let wake = Arc::new(Notify::new());
        let listener = Arc::new(ArtifactEventListener::new(&config, store.clone(), registry, wake.clone()));
        let operator = Arc::new(Operator::new(&service, store.clone(), listener.clone()));

        let deps = MachineDeps {
            store: store.clone(),
            traffic: traffic.clone(),
            probe,
            settings: MachineSettings::from_config(&config),
        };

        Self {
            config: Arc::new(config),
            store,
            traffic,
            listener,
            operator,
            deps,
            wake,
        }
    }

    pub fn router(&self) -> Router {
        slipway_api::build_router(ApiState {
            service: self.config.service.name.clone(),
            store: self.store.clone(),
            traffic: self.traffic.clone(),
            listener: self.listener.clone(),
            operator: self.operator.clone(),
        })
    }

    pub fn coordinator(&self) -> Coordinator {
        let pipeline = Pipeline::new(self.store.clone(), self.config.clone());
        Coordinator::new(&self.config, pipeline, self.deps.clone(), self.wake.clone())
    }

    pub fn autoscaler(&self) -> Autoscaler {
        let metrics = Arc::new(StoreMetrics::new(self.store.clone(), &self.config.service.name));
        Autoscaler::new(
            self.traffic.clone(),
            metrics,
            ScalingPolicy::from_config(&self.config),
            self.config.autoscale.window(),
        )
    }
}
