//! Error taxonomy for the launch pipeline.
//!
//! Every variant carries enough context (identifier, engine, units) for the
//! caller to map the failure directly to a remediation: missing credentials,
//! shared-memory sizing, capacity, or an engine/architecture mismatch.

use thiserror::Error;

/// Why the engine selector rejected one registered engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The engine does not list the model's architecture as supported.
    ArchitectureMismatch,
    /// The architecture matches but detected hardware cannot satisfy the
    /// engine's requirements (e.g. compute-capability floor).
    CapabilityMismatch(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::ArchitectureMismatch => write!(f, "architecture not supported"),
            RejectReason::CapabilityMismatch(detail) => write!(f, "{detail}"),
        }
    }
}

/// One engine the selector considered and turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRejection {
    pub engine: String,
    pub reason: RejectReason,
}

impl std::fmt::Display for EngineRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.engine, self.reason)
    }
}

fn summarize_rejections(rejections: &[EngineRejection]) -> String {
    if rejections.is_empty() {
        return "no engines registered".to_string();
    }
    rejections
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Launch pipeline error types.
///
/// Errors are `Clone` so that concurrent launch requests joining an in-flight
/// launch can all observe the same outcome.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LaunchError {
    /// The model identifier is unknown to every consulted source.
    #[error("model not found: {0}")]
    NotFound(String),

    /// A remote source rejected the request for missing/invalid credentials.
    /// Distinct from [`LaunchError::NotFound`] so callers can surface "set an
    /// access token" instead of a generic failure.
    #[error("access denied by hub '{hub}' for model '{model}': {hint}")]
    AccessDenied {
        hub: String,
        model: String,
        hint: String,
    },

    /// No registered engine can serve the model's architecture on the
    /// detected hardware. Carries per-engine rejection reasons, since
    /// misdiagnosis here is the dominant real-world failure mode.
    #[error("no engine supports architecture '{architecture}' ({})", summarize_rejections(.rejections))]
    UnsupportedArchitecture {
        architecture: String,
        rejections: Vec<EngineRejection>,
    },

    /// The allocator cannot grant the requested units without crossing the
    /// configured safety margin.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A worker process died. Carries the raw diagnostic text from the
    /// native runtime (e.g. an OOM kill message).
    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    /// A bounded wait expired (typically waiting for worker readiness).
    #[error("timed out: {0}")]
    Timeout(String),

    /// The launch was cancelled before the worker reached ready.
    #[error("launch cancelled: {0}")]
    Cancelled(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LaunchError {
    /// Whether a starting-phase retry is worthwhile.
    ///
    /// Only crash causes classified as transient at the call site map here;
    /// everything else propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LaunchError::WorkerCrash(_))
    }

    /// Attach the launch stage that produced this error.
    pub fn at(self, stage: LaunchStage) -> StageError {
        StageError { stage, error: self }
    }
}

/// Result type for launch pipeline operations.
pub type LaunchResult<T> = Result<T, LaunchError>;

/// The pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    /// Resolving the model identifier to a local artifact.
    Resolve,
    /// Choosing a compatible backend engine.
    SelectEngine,
    /// Reserving accelerator resources.
    Allocate,
    /// Spawning and supervising the worker.
    Spawn,
}

impl std::fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchStage::Resolve => write!(f, "resolve"),
            LaunchStage::SelectEngine => write!(f, "select-engine"),
            LaunchStage::Allocate => write!(f, "allocate"),
            LaunchStage::Spawn => write!(f, "spawn"),
        }
    }
}

/// A launch failure with stage attribution - the single aggregated error the
/// orchestrator reports to callers.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("launch failed at stage '{stage}': {error}")]
pub struct StageError {
    pub stage: LaunchStage,
    pub error: LaunchError,
}
