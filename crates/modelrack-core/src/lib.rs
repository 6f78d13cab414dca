//! # modelrack-core
//!
//! Core building blocks for the ModelRack launch engine: the data model
//! (model specs, engine descriptors), the error taxonomy shared across the
//! launch pipeline, hardware discovery, and configuration.
//!
//! ## Quick Start
//!
//! ```rust
//! use modelrack_core::{ModelId, ModelSpec, EngineDescriptor};
//!
//! let spec = ModelSpec::new(ModelId::new("llama-7b"), "llama")
//!     .with_units(40)
//!     .unwrap()
//!     .with_engine("vllm");
//! let engine = EngineDescriptor::new("vllm").with_architecture("llama");
//! assert!(engine.supports(&spec.architecture));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod model;

pub use config::RackConfig;
pub use engine::EngineDescriptor;
pub use error::{
    EngineRejection, LaunchError, LaunchResult, LaunchStage, RejectReason, StageError,
};
pub use hardware::{AcceleratorInfo, AcceleratorKind, ComputeCapability, DeviceInfo};
pub use logging::init_logging;
pub use model::{ModelId, ModelSpec, generate_model_uid};
