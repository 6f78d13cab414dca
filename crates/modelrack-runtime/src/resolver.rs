//! Model source resolution.
//!
//! Maps a model identifier (plus an optional explicit source override) to a
//! local artifact path, fetching from a registered hub when the cache misses.
//! An `AccessDenied` from a hub is surfaced as-is instead of being folded
//! into `NotFound`, so callers can tell "set an access token" apart from
//! "that model does not exist".

use async_trait::async_trait;
use modelrack_core::error::{LaunchError, LaunchResult};
use modelrack_core::model::{ModelId, ModelSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Hub-side failure reported by a [`ModelHub`] implementation.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// The hub does not know this identifier.
    #[error("model '{0}' not found")]
    NotFound(String),

    /// The hub rejected the request for missing or invalid credentials.
    /// `hint` names the remediation (e.g. the token variable to set).
    #[error("access denied: {hint}")]
    AccessDenied { hint: String },

    /// The hub could not be reached or the transfer failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Contract for one remote model source (external collaborator).
#[async_trait]
pub trait ModelHub: Send + Sync {
    /// Hub name used for source selection (e.g. "huggingface", "modelscope").
    fn name(&self) -> &str;

    /// Fetch the artifact for `id` into `dest`. The resolver hands hubs a
    /// staging path and renames it into the cache on success.
    async fn fetch(&self, id: &ModelId, dest: &Path) -> Result<PathBuf, HubError>;
}

/// Resolves model identifiers to local artifact paths.
pub struct SourceResolver {
    hubs: Vec<Arc<dyn ModelHub>>,
    cache_dir: PathBuf,
    hub_override: Option<String>,
}

impl SourceResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, hub_override: Option<String>) -> Self {
        Self {
            hubs: Vec::new(),
            cache_dir: cache_dir.into(),
            hub_override,
        }
    }

    /// Register a hub. Hubs are consulted in registration order unless an
    /// override narrows the search to one of them.
    pub fn register(&mut self, hub: Arc<dyn ModelHub>) {
        self.hubs.push(hub);
    }

    /// Cache location for a model artifact.
    pub fn cache_path(&self, id: &ModelId) -> PathBuf {
        self.cache_dir.join(id.sanitized())
    }

    /// Resolve `spec` to a local artifact path, fetching if absent.
    ///
    /// Selection: the spec's hub override wins, then the configured
    /// override, then registration order across all hubs.
    pub async fn resolve(&self, spec: &ModelSpec) -> LaunchResult<PathBuf> {
        let cached = self.cache_path(&spec.id);
        if cached.exists() {
            tracing::debug!(model = %spec.id, path = %cached.display(), "artifact cache hit");
            return Ok(cached);
        }

        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| LaunchError::Config(format!("cannot create cache dir: {e}")))?;

        let selected = spec.hub.as_deref().or(self.hub_override.as_deref());
        let candidates = self.candidates(selected, &spec.id)?;

        let mut misses = Vec::new();
        for hub in candidates {
            // Hubs fetch into a staging file that only becomes the cache
            // entry on success. A transfer that dies after writing bytes
            // leaves nothing behind for the next resolve to mistake for a
            // complete artifact.
            let staging = tempfile::NamedTempFile::new_in(&self.cache_dir)
                .map_err(|e| LaunchError::Config(format!("cannot create staging file: {e}")))?;
            tracing::info!(model = %spec.id, hub = hub.name(), "fetching model artifact");
            match hub.fetch(&spec.id, staging.path()).await {
                Ok(_) => {
                    staging.persist(&cached).map_err(|e| {
                        LaunchError::Config(format!(
                            "cannot persist '{}': {e}",
                            cached.display()
                        ))
                    })?;
                    tracing::info!(model = %spec.id, hub = hub.name(), path = %cached.display(), "artifact fetched");
                    return Ok(cached);
                }
                Err(HubError::NotFound(_)) => {
                    misses.push(format!("{}: not found", hub.name()));
                }
                Err(HubError::AccessDenied { hint }) => {
                    return Err(LaunchError::AccessDenied {
                        hub: hub.name().to_string(),
                        model: spec.id.to_string(),
                        hint,
                    });
                }
                Err(HubError::Transport(detail)) => {
                    tracing::warn!(model = %spec.id, hub = hub.name(), %detail, "hub unreachable");
                    misses.push(format!("{}: unreachable ({detail})", hub.name()));
                }
            }
        }

        Err(LaunchError::NotFound(format!(
            "'{}' unknown to all configured sources [{}]",
            spec.id,
            misses.join("; ")
        )))
    }

    /// Hubs to consult, honoring an explicit selection.
    fn candidates(
        &self,
        selected: Option<&str>,
        id: &ModelId,
    ) -> LaunchResult<Vec<&Arc<dyn ModelHub>>> {
        match selected {
            Some(name) => {
                let hub = self
                    .hubs
                    .iter()
                    .find(|h| h.name() == name)
                    .ok_or_else(|| {
                        LaunchError::Config(format!(
                            "hub '{name}' requested for '{id}' is not registered"
                        ))
                    })?;
                Ok(vec![hub])
            }
            None => {
                if self.hubs.is_empty() {
                    return Err(LaunchError::Config(
                        "no model hubs registered".to_string(),
                    ));
                }
                Ok(self.hubs.iter().collect())
            }
        }
    }

    /// Names of cached artifacts currently on disk.
    pub fn list_cached(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            // Hidden entries are staging files, not artifacts.
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    /// Remove one cached artifact. Returns whether anything was deleted.
    pub fn remove_cached(&self, id: &ModelId) -> LaunchResult<bool> {
        let path = self.cache_path(id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .map_err(|e| LaunchError::Config(format!("cannot remove '{}': {e}", path.display())))?;
        tracing::info!(model = %id, "cached artifact removed");
        Ok(true)
    }
}

// ============================================================================
// Tests
// ============================================================================
