//! Backend engine descriptors.
//!
//! An [`EngineDescriptor`] declares what one backend inference runtime can
//! serve and what it needs from the hardware. Descriptors are registered at
//! process start and read-only afterward; selection logic lives in the
//! runtime crate.

use crate::hardware::ComputeCapability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Static description of one backend inference runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    /// Engine name (e.g. "vllm", "llama-cpp", "transformers").
    pub name: String,

    /// Model architectures this engine can serve.
    pub architectures: BTreeSet<String>,

    /// Minimum device compute capability the engine needs, if any.
    /// Engines with no floor run on any detected device including CPU.
    pub min_compute_capability: Option<ComputeCapability>,
}

impl EngineDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            architectures: BTreeSet::new(),
            min_compute_capability: None,
        }
    }

    /// Add a supported architecture.
    pub fn with_architecture(mut self, arch: impl Into<String>) -> Self {
        self.architectures.insert(arch.into());
        self
    }

    /// Require a device compute-capability floor.
    pub fn with_capability_floor(mut self, cap: ComputeCapability) -> Self {
        self.min_compute_capability = Some(cap);
        self
    }

    /// Whether this engine declares support for the given architecture.
    pub fn supports(&self, architecture: &str) -> bool {
        self.architectures.contains(architecture)
    }
}
