//! Test doubles for the ModelRack launch engine.
//!
//! Provides counting model hubs and a scripted worker runtime so integration
//! tests can drive the full launch pipeline without real model downloads or
//! real worker processes.

use async_trait::async_trait;
use modelrack_core::error::LaunchResult;
use modelrack_core::model::ModelId;
use modelrack_runtime::resolver::{HubError, ModelHub};
use modelrack_runtime::supervisor::{
    ExitClass, ExitReport, WorkerLaunch, WorkerProcess, WorkerRuntime,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// ============================================================================
// Model hubs
// ============================================================================

/// Hub serving a fixed set of model names, counting every fetch.
pub struct CountingHub {
    name: String,
    known: Vec<String>,
    fetch_delay: Duration,
    fetches: AtomicUsize,
}

impl CountingHub {
    pub fn new(name: &str, known: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            known: known.iter().map(|s| s.to_string()).collect(),
            fetch_delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        })
    }

    /// Slow down fetches to widen race windows in concurrency tests.
    pub fn with_delay(name: &str, known: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            known: known.iter().map(|s| s.to_string()).collect(),
            fetch_delay: delay,
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelHub for CountingHub {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, id: &ModelId, dest: &Path) -> Result<PathBuf, HubError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if !self.known.contains(&id.name) {
            return Err(HubError::NotFound(id.to_string()));
        }
        std::fs::write(dest, b"stub weights").map_err(|e| HubError::Transport(e.to_string()))?;
        Ok(dest.to_path_buf())
    }
}

/// Hub that always rejects for missing credentials.
pub struct DeniedHub {
    hint: String,
}

impl DeniedHub {
    pub fn new(hint: &str) -> Arc<Self> {
        Arc::new(Self {
            hint: hint.to_string(),
        })
    }
}

#[async_trait]
impl ModelHub for DeniedHub {
    fn name(&self) -> &str {
        "private"
    }

    async fn fetch(&self, _id: &ModelId, _dest: &Path) -> Result<PathBuf, HubError> {
        Err(HubError::AccessDenied {
            hint: self.hint.clone(),
        })
    }
}

// ============================================================================
// Worker runtime
// ============================================================================

/// Scripted outcome for one spawn attempt.
#[derive(Debug, Clone)]
pub enum Script {
    /// Signal readiness after the given delay, then stay up until stopped.
    Ready(Duration),
    /// Die during starting with the given classification and diagnostic.
    DieStarting(ExitClass, &'static str),
    /// Signal readiness, then die with the given report.
    ReadyThenDie(ExitClass, &'static str),
    /// Never signal readiness (forces the caller's timeout).
    Hang,
}

struct ScriptedProcess {
    script: Script,
    stopped: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl WorkerProcess for ScriptedProcess {
    async fn wait_ready(&mut self) -> Result<(), ExitReport> {
        match &self.script {
            Script::Ready(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                Ok(())
            }
            Script::ReadyThenDie(..) => Ok(()),
            Script::DieStarting(class, diag) => Err(ExitReport {
                class: *class,
                diagnostic: diag.to_string(),
            }),
            Script::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn wait_exit(&mut self) -> ExitReport {
        match &self.script {
            Script::ReadyThenDie(class, diag) => ExitReport {
                class: *class,
                diagnostic: diag.to_string(),
            },
            _ => {
                self.stopped.notified().await;
                ExitReport {
                    class: ExitClass::Clean,
                    diagnostic: String::new(),
                }
            }
        }
    }

    async fn stop(&mut self) {
        self.stopped.notify_waiters();
    }
}

/// Runtime replaying one script per spawn (the last script repeats), with a
/// spawn counter for retry assertions.
pub struct ScriptedRuntime {
    scripts: Vec<Script>,
    spawns: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        assert!(!scripts.is_empty(), "scripts must not be empty");
        Arc::new(Self {
            scripts,
            spawns: AtomicUsize::new(0),
        })
    }

    /// Runtime whose workers become ready immediately and stay up.
    pub fn always_ready() -> Arc<Self> {
        Self::new(vec![Script::Ready(Duration::ZERO)])
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerRuntime for ScriptedRuntime {
    async fn spawn(&self, _launch: WorkerLaunch) -> LaunchResult<Box<dyn WorkerProcess>> {
        let n = self.spawns.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(n)
            .or_else(|| self.scripts.last())
            .cloned()
            .expect("scripts checked non-empty at construction");
        Ok(Box::new(ScriptedProcess {
            script,
            stopped: Arc::new(tokio::sync::Notify::new()),
        }))
    }
}
