//! Worker supervision.
//!
//! Each worker runs as an independently scheduled tokio task behind a
//! [`WorkerRuntime`] contract (the external process/container runtime).
//! Per-worker state is an explicit finite-state machine validated centrally:
//!
//! ```text
//! starting -> ready | failed
//! ready    -> degraded | stopped
//! degraded -> failed
//! ```
//!
//! A handle reaches `failed` exactly once and is never reused; every retry
//! attempt creates a fresh handle and re-negotiates a fresh allocation
//! ticket. Fatal resource errors (OOM kills, shared-memory exhaustion)
//! surface as structured `WorkerCrash` errors carrying the raw diagnostic
//! text from the native runtime.

use crate::allocator::{AllocationTicket, DeviceAllocator};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use modelrack_core::error::{LaunchError, LaunchResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Worker runtime contract (external collaborator)
// ============================================================================

/// How a worker process ended, classified from exit codes/signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Clean exit after a stop request.
    Clean,
    /// Killed by the OOM killer.
    OomKilled,
    /// Died from shared-memory exhaustion (e.g. undersized /dev/shm).
    ShmExhausted,
    /// Any other abnormal termination.
    Crashed,
}

/// Exit details reported by the runtime, including the raw diagnostic text
/// (native crash message, OOM kill log line, ...).
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub class: ExitClass,
    pub diagnostic: String,
}

/// Everything the runtime needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub worker_id: Uuid,
    pub model_uid: String,
    pub artifact: PathBuf,
    pub engine: String,
    pub units: u64,
    /// Shared-memory size granted to the worker, in bytes.
    pub shm_size_bytes: u64,
    pub env: HashMap<String, String>,
}

/// A spawned worker as seen by the supervisor.
#[async_trait]
pub trait WorkerProcess: Send {
    /// Resolves when the worker signals readiness, or with the exit report
    /// if it dies first.
    async fn wait_ready(&mut self) -> Result<(), ExitReport>;

    /// Resolves when the worker exits after having been ready.
    async fn wait_exit(&mut self) -> ExitReport;

    /// Ask the worker to shut down.
    async fn stop(&mut self);
}

/// Contract for the external process/container runtime.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    async fn spawn(&self, launch: WorkerLaunch) -> LaunchResult<Box<dyn WorkerProcess>>;
}

// ============================================================================
// Worker state machine
// ============================================================================

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Degraded,
    Failed,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Degraded => "degraded",
            WorkerState::Failed => "failed",
            WorkerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

fn valid_transition(from: WorkerState, to: WorkerState) -> bool {
    use WorkerState::*;
    matches!(
        (from, to),
        (Starting, Ready) | (Starting, Failed) | (Ready, Degraded) | (Ready, Stopped)
            | (Degraded, Failed)
    )
}

#[derive(Debug)]
struct WorkerShared {
    id: Uuid,
    state_tx: watch::Sender<WorkerState>,
    last_error: Mutex<Option<String>>,
}

impl WorkerShared {
    fn new(id: Uuid) -> (Arc<Self>, watch::Receiver<WorkerState>) {
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        (
            Arc::new(Self {
                id,
                state_tx,
                last_error: Mutex::new(None),
            }),
            state_rx,
        )
    }

    /// Apply one transition, validated against the state machine. Invalid
    /// transitions are logged and ignored.
    fn transition(&self, to: WorkerState) -> bool {
        let mut from = WorkerState::Starting;
        let applied = self.state_tx.send_if_modified(|state| {
            from = *state;
            if valid_transition(*state, to) {
                *state = to;
                true
            } else {
                false
            }
        });
        if applied {
            tracing::debug!(worker = %self.id, from = %from, to = %to, "worker state transition");
        } else {
            tracing::warn!(
                worker = %self.id,
                from = %from,
                to = %to,
                "invalid worker state transition ignored"
            );
        }
        applied
    }

    fn record_error(&self, diagnostic: &str) {
        *self.last_error.lock() = Some(diagnostic.to_string());
    }
}

/// Observation side of one worker.
///
/// The supervisor owns the worker; handles only watch its state. Cloning is
/// cheap and every clone observes the same underlying worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    state_rx: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Wait until the state satisfies `pred`, bounded by `timeout`.
    pub async fn wait_until(
        &mut self,
        pred: impl FnMut(&WorkerState) -> bool,
        timeout: Duration,
    ) -> LaunchResult<WorkerState> {
        match tokio::time::timeout(timeout, self.state_rx.wait_for(pred)).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(LaunchError::WorkerCrash(format!(
                "worker {} supervisor dropped",
                self.shared.id
            ))),
            Err(_) => Err(LaunchError::Timeout(format!(
                "worker {} did not reach the expected state within {timeout:?}",
                self.shared.id
            ))),
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Shared-memory policy driving transient-vs-permanent crash classification.
#[derive(Debug, Clone, Copy)]
pub struct ShmPolicy {
    /// Size currently granted to workers.
    pub size_bytes: u64,
    /// Largest size the deployment may raise to.
    pub max_bytes: u64,
}

impl ShmPolicy {
    /// A shared-memory crash is only worth retrying while the granted size
    /// is below the raisable maximum.
    fn is_transient(&self, report: &ExitReport) -> bool {
        report.class == ExitClass::ShmExhausted && self.size_bytes < self.max_bytes
    }
}

struct ActiveWorker {
    handle: WorkerHandle,
    cancel: CancellationToken,
    ticket_id: Uuid,
}

/// Spawns, monitors, and restarts backend worker processes.
pub struct WorkerSupervisor {
    runtime: Arc<dyn WorkerRuntime>,
    allocator: Arc<DeviceAllocator>,
    retry: RetryConfig,
    ready_timeout: Duration,
    shm: ShmPolicy,
    workers: Arc<DashMap<Uuid, ActiveWorker>>,
}

impl WorkerSupervisor {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        allocator: Arc<DeviceAllocator>,
        retry: RetryConfig,
        ready_timeout: Duration,
        shm: ShmPolicy,
    ) -> Self {
        Self {
            runtime,
            allocator,
            retry,
            ready_timeout,
            shm,
            workers: Arc::new(DashMap::new()),
        }
    }

    /// Launch one worker and wait (bounded) for it to reach ready.
    ///
    /// Starting-phase failures classified transient are retried with backoff
    /// up to the configured attempt budget, each attempt with a fresh handle
    /// and a freshly negotiated ticket. Once a worker is ready it is never
    /// silently respawned: post-ready failure surfaces through the handle and
    /// requires a fresh launch decision.
    pub async fn start(
        &self,
        model_uid: &str,
        artifact: PathBuf,
        engine: &str,
        units: u64,
        cancel: &CancellationToken,
    ) -> LaunchResult<(WorkerHandle, AllocationTicket)> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_err = LaunchError::WorkerCrash("no attempts made".to_string());

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.policy.delay_for(attempt - 1)).await;
            }
            match self
                .start_once(model_uid, artifact.clone(), engine, units, cancel)
                .await
            {
                Ok(ok) => return Ok(ok),
                Err(Attempt::Transient(e)) => {
                    tracing::warn!(
                        model = model_uid,
                        attempt,
                        error = %e,
                        "transient worker failure during starting, retrying"
                    );
                    last_err = e;
                }
                Err(Attempt::Permanent(e)) => return Err(e),
            }
        }

        tracing::error!(model = model_uid, attempts = max_attempts, error = %last_err, "launch attempts exhausted");
        Err(last_err)
    }

    /// One launch attempt: negotiate a ticket, spawn, wait for ready.
    async fn start_once(
        &self,
        model_uid: &str,
        artifact: PathBuf,
        engine: &str,
        units: u64,
        cancel: &CancellationToken,
    ) -> Result<(WorkerHandle, AllocationTicket), Attempt> {
        let worker_id = Uuid::new_v4();
        let (shared, state_rx) = WorkerShared::new(worker_id);
        let handle = WorkerHandle {
            shared: shared.clone(),
            state_rx,
        };

        let ticket = self
            .allocator
            .request(worker_id, units)
            .map_err(Attempt::Permanent)?;
        // Covers every non-ready exit from this function, including a caller
        // that drops the launch future mid-await.
        let mut ticket_guard = TicketGuard::new(self.allocator.clone(), ticket.id);

        let launch = WorkerLaunch {
            worker_id,
            model_uid: model_uid.to_string(),
            artifact,
            engine: engine.to_string(),
            units,
            shm_size_bytes: self.shm.size_bytes,
            env: HashMap::new(),
        };

        tracing::info!(model = model_uid, worker = %worker_id, engine, units, "spawning worker");
        let mut process = self.runtime.spawn(launch).await.map_err(Attempt::Permanent)?;

        tokio::select! {
            _ = cancel.cancelled() => {
                process.stop().await;
                Err(Attempt::Permanent(LaunchError::Cancelled(format!(
                    "launch of '{model_uid}' cancelled before worker became ready"
                ))))
            }
            outcome = tokio::time::timeout(self.ready_timeout, process.wait_ready()) => {
                match outcome {
                    Err(_) => {
                        process.stop().await;
                        shared.record_error("readiness wait timed out");
                        shared.transition(WorkerState::Failed);
                        Err(Attempt::Permanent(LaunchError::Timeout(format!(
                            "worker for '{model_uid}' not ready within {:?}",
                            self.ready_timeout
                        ))))
                    }
                    Ok(Err(report)) => {
                        shared.record_error(&report.diagnostic);
                        shared.transition(WorkerState::Failed);
                        let err = LaunchError::WorkerCrash(report.diagnostic.clone());
                        if self.shm.is_transient(&report) {
                            Err(Attempt::Transient(err))
                        } else {
                            Err(Attempt::Permanent(err))
                        }
                    }
                    Ok(Ok(())) => {
                        // The monitor task owns the release from here on.
                        ticket_guard.disarm();
                        shared.transition(WorkerState::Ready);
                        self.allocator.confirm(ticket.id);
                        self.monitor(shared, process, ticket.id, handle.clone());
                        tracing::info!(model = model_uid, worker = %worker_id, "worker ready");
                        Ok((handle, ticket))
                    }
                }
            }
        }
    }

    /// Watch a ready worker from its own task until it stops or dies.
    fn monitor(
        &self,
        shared: Arc<WorkerShared>,
        mut process: Box<dyn WorkerProcess>,
        ticket_id: Uuid,
        handle: WorkerHandle,
    ) {
        let worker_cancel = CancellationToken::new();
        self.workers.insert(
            shared.id,
            ActiveWorker {
                handle,
                cancel: worker_cancel.clone(),
                ticket_id,
            },
        );

        let allocator = self.allocator.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let report = tokio::select! {
                _ = worker_cancel.cancelled() => {
                    process.stop().await;
                    None
                }
                report = process.wait_exit() => Some(report),
            };

            // Ticket released on any termination path, before the terminal
            // transition becomes observable. Release is idempotent, so a
            // racing explicit stop cannot double-free capacity.
            allocator.release(ticket_id);
            workers.remove(&shared.id);

            match report {
                None => {
                    shared.transition(WorkerState::Stopped);
                }
                Some(report) if report.class == ExitClass::Clean => {
                    shared.transition(WorkerState::Stopped);
                }
                Some(report) => {
                    tracing::error!(
                        worker = %shared.id,
                        diagnostic = %report.diagnostic,
                        "worker failed after ready"
                    );
                    shared.record_error(&report.diagnostic);
                    shared.transition(WorkerState::Degraded);
                    shared.transition(WorkerState::Failed);
                }
            }
        });
    }

    /// Observation handle for a live worker.
    pub fn handle(&self, worker_id: Uuid) -> Option<WorkerHandle> {
        self.workers.get(&worker_id).map(|w| w.handle.clone())
    }

    /// Stop a worker and wait (bounded) for it to leave the running states.
    /// Returns false if the worker is unknown (already terminated).
    pub async fn stop(&self, worker_id: Uuid) -> bool {
        let Some(worker) = self.workers.get(&worker_id) else {
            return false;
        };
        let mut handle = worker.handle.clone();
        worker.cancel.cancel();
        drop(worker);

        let _ = handle
            .wait_until(
                |s| matches!(s, WorkerState::Stopped | WorkerState::Failed),
                self.ready_timeout,
            )
            .await;
        true
    }

    /// Ids of workers currently supervised.
    pub fn active_workers(&self) -> Vec<Uuid> {
        self.workers.iter().map(|w| *w.key()).collect()
    }
}

/// Attempt-level classification internal to the retry loop.
enum Attempt {
    Transient(LaunchError),
    Permanent(LaunchError),
}

/// Releases a pending ticket unless disarmed. Release is idempotent, so the
/// guard stays harmless even when another path beats it to the release.
struct TicketGuard {
    allocator: Arc<DeviceAllocator>,
    ticket_id: Uuid,
    armed: bool,
}

impl TicketGuard {
    fn new(allocator: Arc<DeviceAllocator>, ticket_id: Uuid) -> Self {
        Self {
            allocator,
            ticket_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if self.armed {
            self.allocator.release(self.ticket_id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
