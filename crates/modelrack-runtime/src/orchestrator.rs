//! Launch orchestration.
//!
//! Sequences resolve → select engine → allocate → supervise and reports
//! either a ready model uid or a single stage-attributed failure. Identical
//! concurrent launch requests join the in-flight launch instead of starting
//! redundant work: at most one launch sequence runs per model identity.

use crate::allocator::{AllocatorStatistics, DeviceAllocator};
use crate::resolver::SourceResolver;
use crate::retry::RetryConfig;
use crate::selector::EngineRegistry;
use crate::supervisor::{ShmPolicy, WorkerHandle, WorkerRuntime, WorkerState, WorkerSupervisor};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use modelrack_core::config::RackConfig;
use modelrack_core::error::{LaunchError, LaunchResult, LaunchStage, StageError};
use modelrack_core::hardware::AcceleratorInfo;
use modelrack_core::model::{ModelId, ModelSpec, generate_model_uid};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Outcome shared between a launch leader and joined duplicates.
type LaunchOutcome = Result<String, StageError>;

/// Public record of one launched model.
#[derive(Debug, Clone)]
pub struct DeploymentInfo {
    pub model_uid: String,
    pub model_id: ModelId,
    pub engine: String,
    pub units: u64,
    pub state: WorkerState,
    pub last_error: Option<String>,
    pub launched_at: DateTime<Utc>,
}

struct Deployment {
    model_id: ModelId,
    engine: String,
    units: u64,
    handle: WorkerHandle,
    launched_at: DateTime<Utc>,
}

/// Role the current caller plays for one launch identity.
enum LaunchRole {
    Leader(watch::Sender<Option<LaunchOutcome>>),
    Follower(watch::Receiver<Option<LaunchOutcome>>),
}

/// Removes an in-flight entry on drop, but only while the entry still belongs
/// to this leader's channel. A fresh leader may have re-inserted the key by
/// the time a stale guard or follower gets around to cleaning up.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, watch::Receiver<Option<LaunchOutcome>>>,
    key: &'a str,
    rx: watch::Receiver<Option<LaunchOutcome>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .remove_if(self.key, |_, stored| stored.same_channel(&self.rx));
    }
}

/// Composes the resolver, selector, allocator, and supervisor into the
/// model launch pipeline.
pub struct LaunchOrchestrator {
    config: RackConfig,
    hardware: AcceleratorInfo,
    resolver: Arc<SourceResolver>,
    registry: Arc<EngineRegistry>,
    allocator: Arc<DeviceAllocator>,
    supervisor: Arc<WorkerSupervisor>,
    deployments: DashMap<String, Deployment>,
    in_flight: DashMap<String, watch::Receiver<Option<LaunchOutcome>>>,
}

impl LaunchOrchestrator {
    /// Wire up the pipeline. The registry and resolver are populated by the
    /// caller at startup and read-only afterward; the worker runtime is the
    /// external process/container runtime.
    pub fn new(
        config: RackConfig,
        hardware: AcceleratorInfo,
        resolver: SourceResolver,
        registry: EngineRegistry,
        runtime: Arc<dyn WorkerRuntime>,
    ) -> LaunchResult<Self> {
        config.validate()?;
        let allocator = Arc::new(DeviceAllocator::from_hardware(
            &hardware,
            config.capacity_units,
            config.safety_margin,
        ));
        let supervisor = Arc::new(WorkerSupervisor::new(
            runtime,
            allocator.clone(),
            RetryConfig::exponential(config.retry_attempts, config.retry_base_ms),
            Duration::from_millis(config.launch_timeout_ms),
            ShmPolicy {
                size_bytes: config.shm_size_bytes,
                max_bytes: config.shm_max_bytes,
            },
        ));
        tracing::info!(
            devices = hardware.devices.len(),
            bind = %config.bind_address,
            "launch orchestrator initialized"
        );
        Ok(Self {
            config,
            hardware,
            resolver: Arc::new(resolver),
            registry: Arc::new(registry),
            allocator,
            supervisor,
            deployments: DashMap::new(),
            in_flight: DashMap::new(),
        })
    }

    /// Launch a model and wait for its worker to become ready.
    ///
    /// Returns the uid of the launched instance. Duplicate concurrent calls
    /// for the same model identity receive the same uid from the single
    /// underlying launch.
    pub async fn launch(&self, spec: ModelSpec) -> Result<String, StageError> {
        self.launch_with_cancel(spec, CancellationToken::new()).await
    }

    /// [`launch`](Self::launch) with caller-controlled cancellation.
    /// Cancelling after the resource grant releases the ticket.
    pub async fn launch_with_cancel(
        &self,
        spec: ModelSpec,
        cancel: CancellationToken,
    ) -> Result<String, StageError> {
        let key = launch_key(&spec);

        let role = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => LaunchRole::Follower(entry.get().clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx);
                LaunchRole::Leader(tx)
            }
        };

        match role {
            LaunchRole::Follower(mut rx) => {
                tracing::debug!(key = %key, "joining in-flight launch");
                loop {
                    if let Some(outcome) = rx.borrow_and_update().clone() {
                        return outcome;
                    }
                    if rx.changed().await.is_err() {
                        // Leader dropped without publishing (its caller went
                        // away). Report rather than wait forever. Only clear
                        // the entry if it is still the dead leader's.
                        self.in_flight
                            .remove_if(&key, |_, stored| stored.same_channel(&rx));
                        return Err(LaunchError::Cancelled(format!(
                            "in-flight launch for '{}' was abandoned",
                            spec.id
                        ))
                        .at(LaunchStage::Spawn));
                    }
                }
            }
            LaunchRole::Leader(tx) => {
                // Entry removed even if this future is dropped mid-launch,
                // so a later identical request starts fresh instead of
                // waiting on a dead channel.
                let entry = InFlightGuard {
                    map: &self.in_flight,
                    key: &key,
                    rx: tx.subscribe(),
                };
                let outcome = self.run_launch(&spec, &cancel).await;
                drop(entry);
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
        }
    }

    /// The actual launch sequence, run once per identity.
    async fn run_launch(
        &self,
        spec: &ModelSpec,
        cancel: &CancellationToken,
    ) -> Result<String, StageError> {
        let artifact = self
            .resolver
            .resolve(spec)
            .await
            .map_err(|e| e.at(LaunchStage::Resolve))?;

        let engine = self
            .registry
            .select(spec, &self.hardware)
            .map_err(|e| e.at(LaunchStage::SelectEngine))?
            .clone();

        let model_uid = generate_model_uid(&spec.id.name);
        // Allocation happens inside the supervisor so each retry attempt
        // re-negotiates a fresh ticket against current capacity.
        let (handle, ticket) = self
            .supervisor
            .start(&model_uid, artifact, &engine.name, spec.units, cancel)
            .await
            .map_err(|e| {
                let stage = match &e {
                    LaunchError::ResourceExhausted(_) => LaunchStage::Allocate,
                    _ => LaunchStage::Spawn,
                };
                e.at(stage)
            })?;

        self.deployments.insert(
            model_uid.clone(),
            Deployment {
                model_id: spec.id.clone(),
                engine: engine.name.clone(),
                units: ticket.units,
                handle,
                launched_at: Utc::now(),
            },
        );
        tracing::info!(
            model = %spec.id,
            uid = %model_uid,
            engine = %engine.name,
            units = ticket.units,
            "model launched"
        );
        Ok(model_uid)
    }

    /// Stop a launched model, releasing its resources.
    pub async fn terminate(&self, model_uid: &str) -> LaunchResult<()> {
        let Some((_, deployment)) = self.deployments.remove(model_uid) else {
            return Err(LaunchError::NotFound(format!(
                "no launched model with uid '{model_uid}'"
            )));
        };
        self.supervisor.stop(deployment.handle.id()).await;
        tracing::info!(uid = model_uid, "model terminated");
        Ok(())
    }

    /// All launched models, sorted by uid.
    pub fn list_models(&self) -> Vec<DeploymentInfo> {
        let mut models: Vec<DeploymentInfo> = self
            .deployments
            .iter()
            .map(|entry| describe(entry.key(), entry.value()))
            .collect();
        models.sort_by(|a, b| a.model_uid.cmp(&b.model_uid));
        models
    }

    /// Details of one launched model.
    pub fn describe_model(&self, model_uid: &str) -> LaunchResult<DeploymentInfo> {
        self.deployments
            .get(model_uid)
            .map(|entry| describe(entry.key(), entry.value()))
            .ok_or_else(|| {
                LaunchError::NotFound(format!("no launched model with uid '{model_uid}'"))
            })
    }

    /// Names of engines able to serve `spec` on this host.
    pub fn query_engines(&self, spec: &ModelSpec) -> Vec<String> {
        self.registry
            .compatible(spec, &self.hardware)
            .into_iter()
            .map(|e| e.name.clone())
            .collect()
    }

    /// Allocator snapshot for observability endpoints.
    pub fn statistics(&self) -> AllocatorStatistics {
        self.allocator.statistics()
    }

    pub fn config(&self) -> &RackConfig {
        &self.config
    }
}

fn describe(model_uid: &str, deployment: &Deployment) -> DeploymentInfo {
    DeploymentInfo {
        model_uid: model_uid.to_string(),
        model_id: deployment.model_id.clone(),
        engine: deployment.engine.clone(),
        units: deployment.units,
        state: deployment.handle.state(),
        last_error: deployment.handle.last_error(),
        launched_at: deployment.launched_at,
    }
}

/// Launch identity: model id plus requested engine. Duplicate requests with
/// the same identity share one launch sequence.
fn launch_key(spec: &ModelSpec) -> String {
    format!("{}/{}", spec.id, spec.engine.as_deref().unwrap_or("auto"))
}
