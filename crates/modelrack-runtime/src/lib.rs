//! # modelrack-runtime
//!
//! The ModelRack launch engine: resolves a requested model to a local
//! artifact, picks a compatible backend engine, reserves accelerator
//! resources, and supervises the worker that serves the model.
//!
//! The pipeline is composed by [`LaunchOrchestrator`]:
//!
//! ```text
//! resolve -> select engine -> allocate -> supervise
//! ```
//!
//! External collaborators plug in through traits: [`resolver::ModelHub`]
//! for remote model sources and [`supervisor::WorkerRuntime`] for the
//! process/container runtime.

pub mod allocator;
pub mod orchestrator;
pub mod resolver;
pub mod retry;
pub mod selector;
pub mod supervisor;

pub use allocator::{AllocationTicket, AllocatorStatistics, DeviceAllocator, LeaseState};
pub use orchestrator::{DeploymentInfo, LaunchOrchestrator};
pub use resolver::{HubError, ModelHub, SourceResolver};
pub use retry::{RetryConfig, RetryPolicy};
pub use selector::EngineRegistry;
pub use supervisor::{
    ExitClass, ExitReport, ShmPolicy, WorkerHandle, WorkerLaunch, WorkerProcess, WorkerRuntime,
    WorkerState, WorkerSupervisor,
};
