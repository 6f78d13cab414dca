//! Engine selection.
//!
//! An ordered registry of [`EngineDescriptor`]s populated at startup. Given a
//! model spec and the detected hardware, selection is deterministic: the
//! caller-requested engine wins when compatible, otherwise the first
//! compatible engine in registration order.

use modelrack_core::engine::EngineDescriptor;
use modelrack_core::error::{EngineRejection, LaunchError, LaunchResult, RejectReason};
use modelrack_core::hardware::AcceleratorInfo;
use modelrack_core::model::ModelSpec;

/// Registry of backend engines, fixed after startup registration.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    engines: Vec<EngineDescriptor>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine. Registration order is the selection tie-break
    /// order, so callers should register preferred engines first.
    pub fn register(&mut self, engine: EngineDescriptor) -> LaunchResult<()> {
        if self.engines.iter().any(|e| e.name == engine.name) {
            return Err(LaunchError::Config(format!(
                "engine '{}' registered twice",
                engine.name
            )));
        }
        tracing::debug!(engine = %engine.name, "engine registered");
        self.engines.push(engine);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Whether one engine can serve `spec` on `hardware`, or why not.
    fn check(
        engine: &EngineDescriptor,
        spec: &ModelSpec,
        hardware: &AcceleratorInfo,
    ) -> Option<RejectReason> {
        if !engine.supports(&spec.architecture) {
            return Some(RejectReason::ArchitectureMismatch);
        }
        if let Some(floor) = engine.min_compute_capability {
            let best = hardware.best_compute_capability();
            let satisfied = best.is_some_and(|cap| cap >= floor);
            if !satisfied {
                let detected = best
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string());
                return Some(RejectReason::CapabilityMismatch(format!(
                    "requires compute capability {floor}, detected {detected}"
                )));
            }
        }
        None
    }

    /// All engines able to serve `spec` on `hardware`, in registration order.
    pub fn compatible(
        &self,
        spec: &ModelSpec,
        hardware: &AcceleratorInfo,
    ) -> Vec<&EngineDescriptor> {
        self.engines
            .iter()
            .filter(|e| Self::check(e, spec, hardware).is_none())
            .collect()
    }

    /// Choose one engine for `spec`.
    ///
    /// Deterministic: same registry + same spec + same hardware always yields
    /// the same descriptor. On no match, the error lists every registered
    /// engine with the reason it was rejected.
    pub fn select(
        &self,
        spec: &ModelSpec,
        hardware: &AcceleratorInfo,
    ) -> LaunchResult<&EngineDescriptor> {
        if let Some(requested) = spec.engine.as_deref() {
            if !self.engines.iter().any(|e| e.name == requested) {
                return Err(LaunchError::Config(format!(
                    "requested engine '{requested}' is not registered"
                )));
            }
        }

        let mut rejections = Vec::new();
        let mut first_compatible = None;
        for engine in &self.engines {
            match Self::check(engine, spec, hardware) {
                Some(reason) => rejections.push(EngineRejection {
                    engine: engine.name.clone(),
                    reason,
                }),
                None => {
                    if spec.engine.as_deref() == Some(engine.name.as_str()) {
                        tracing::info!(model = %spec.id, engine = %engine.name, "requested engine selected");
                        return Ok(engine);
                    }
                    first_compatible.get_or_insert(engine);
                }
            }
        }

        match first_compatible {
            Some(engine) => {
                tracing::info!(model = %spec.id, engine = %engine.name, "engine selected");
                Ok(engine)
            }
            None => Err(LaunchError::UnsupportedArchitecture {
                architecture: spec.architecture.clone(),
                rejections,
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
