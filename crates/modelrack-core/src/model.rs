//! Model specification types.
//!
//! A [`ModelSpec`] is created at launch request time and is immutable once
//! built. Builder-style construction validates inputs up front so the launch
//! pipeline never sees a half-formed spec.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque name/version pair referring to a servable model artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub name: String,
    pub version: Option<String>,
}

impl ModelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// Filesystem-safe form used for cache entries.
    pub fn sanitized(&self) -> String {
        let raw = match &self.version {
            Some(v) => format!("{}-{}", self.name, v),
            None => self.name.clone(),
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            })
            .collect()
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Generate a unique uid for a launched model instance: `<name>-<8 hex chars>`.
///
/// Each launch gets a fresh uid; uids are never reused even when the same
/// model is relaunched after a failure.
pub fn generate_model_uid(name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", name, &suffix[..8])
}

/// Everything the launch pipeline needs to know about one requested model.
///
/// Immutable once resolved; created at launch request time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier (name + optional version).
    pub id: ModelId,

    /// Declared model architecture (e.g. "llama", "qwen2-vl").
    pub architecture: String,

    /// Accelerator resource units one worker of this model reserves.
    pub units: u64,

    /// Engine explicitly requested by the caller. The selector prefers it
    /// when compatible and falls back to registration order otherwise.
    pub engine: Option<String>,

    /// Explicit model source override, selecting among registered hubs.
    /// If None, the configured default (or registration order) applies.
    pub hub: Option<String>,
}

impl ModelSpec {
    pub fn new(id: ModelId, architecture: impl Into<String>) -> Self {
        Self {
            id,
            architecture: architecture.into(),
            units: 1,
            engine: None,
            hub: None,
        }
    }

    /// Set the resource units one worker reserves.
    pub fn with_units(mut self, units: u64) -> Result<Self, &'static str> {
        if units == 0 {
            return Err("units must be > 0");
        }
        self.units = units;
        Ok(self)
    }

    /// Request a specific engine instead of automatic selection.
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    /// Force a specific model hub instead of the configured default.
    pub fn with_hub(mut self, hub: impl Into<String>) -> Self {
        self.hub = Some(hub.into());
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
