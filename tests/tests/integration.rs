//! End-to-end tests of the launch pipeline against scripted hubs and
//! scripted worker runtimes.

use modelrack_core::config::RackConfig;
use modelrack_core::error::{LaunchError, LaunchStage};
use modelrack_core::hardware::{AcceleratorInfo, AcceleratorKind, ComputeCapability, DeviceInfo};
use modelrack_core::model::{ModelId, ModelSpec};
use modelrack_core::engine::EngineDescriptor;
use modelrack_runtime::allocator::DeviceAllocator;
use modelrack_runtime::orchestrator::LaunchOrchestrator;
use modelrack_runtime::resolver::{ModelHub, SourceResolver};
use modelrack_runtime::selector::EngineRegistry;
use modelrack_runtime::supervisor::{ExitClass, WorkerRuntime, WorkerState};
use modelrack_testing::{CountingHub, DeniedHub, Script, ScriptedRuntime};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn gpu_host() -> AcceleratorInfo {
    AcceleratorInfo::fixed(vec![DeviceInfo {
        ordinal: 0,
        kind: AcceleratorKind::Cuda,
        memory_bytes: 16 * 1024 * 1024 * 1024,
        compute_capability: Some(ComputeCapability::new(8, 0)),
    }])
}

fn default_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry
        .register(
            EngineDescriptor::new("vllm")
                .with_architecture("llama")
                .with_architecture("qwen2")
                .with_capability_floor(ComputeCapability::new(7, 0)),
        )
        .unwrap();
    registry
        .register(EngineDescriptor::new("llama-cpp").with_architecture("llama"))
        .unwrap();
    registry
}

struct Rig {
    orchestrator: Arc<LaunchOrchestrator>,
    _cache: TempDir,
}

fn rig_with(
    hub: Arc<dyn ModelHub>,
    runtime: Arc<dyn WorkerRuntime>,
    registry: EngineRegistry,
    capacity: u64,
    retry_attempts: usize,
    launch_timeout_ms: u64,
) -> Rig {
    let cache = TempDir::new().unwrap();
    let config = RackConfig {
        cache_dir: cache.path().to_path_buf(),
        capacity_units: Some(capacity),
        safety_margin: 0.0,
        launch_timeout_ms,
        retry_attempts,
        retry_base_ms: 1,
        ..Default::default()
    };
    let mut resolver = SourceResolver::new(cache.path(), None);
    resolver.register(hub);
    let orchestrator =
        LaunchOrchestrator::new(config, gpu_host(), resolver, registry, runtime).unwrap();
    Rig {
        orchestrator: Arc::new(orchestrator),
        _cache: cache,
    }
}

fn spec(name: &str) -> ModelSpec {
    ModelSpec::new(ModelId::new(name), "llama")
}

// ============================================================================
// Launch deduplication
// ============================================================================

#[tokio::test]
async fn concurrent_identical_launches_share_one_resolve() {
    let hub = CountingHub::with_delay("main", &["llama-7b"], Duration::from_millis(50));
    let rig = rig_with(
        hub.clone(),
        ScriptedRuntime::new(vec![Script::Ready(Duration::from_millis(50))]),
        default_registry(),
        1_000,
        1,
        5_000,
    );

    let futs = (0..5).map(|_| {
        let orch = rig.orchestrator.clone();
        let s = spec("llama-7b").with_units(10).unwrap();
        async move { orch.launch(s).await }
    });
    let results = futures::future::join_all(futs).await;

    let first = results[0].as_ref().unwrap().clone();
    for r in &results {
        assert_eq!(r.as_ref().unwrap(), &first, "all joiners get the same uid");
    }
    assert_eq!(hub.fetch_count(), 1, "exactly one underlying launch sequence");
    assert_eq!(rig.orchestrator.list_models().len(), 1);
}

#[tokio::test]
async fn distinct_engines_are_distinct_launch_identities() {
    let hub = CountingHub::new("main", &["llama-7b"]);
    let rig = rig_with(
        hub.clone(),
        ScriptedRuntime::always_ready(),
        default_registry(),
        1_000,
        1,
        5_000,
    );

    let a = rig
        .orchestrator
        .launch(spec("llama-7b").with_engine("vllm"))
        .await
        .unwrap();
    let b = rig
        .orchestrator
        .launch(spec("llama-7b").with_engine("llama-cpp"))
        .await
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(rig.orchestrator.list_models().len(), 2);
}

// ============================================================================
// Resolver failures
// ============================================================================

#[tokio::test]
async fn missing_credentials_surface_access_denied_not_not_found() {
    let rig = rig_with(
        DeniedHub::new("set MODELRACK_HUB_TOKEN and relaunch"),
        ScriptedRuntime::always_ready(),
        default_registry(),
        1_000,
        1,
        5_000,
    );

    let err = rig.orchestrator.launch(spec("llama-7b")).await.unwrap_err();
    assert_eq!(err.stage, LaunchStage::Resolve);
    match err.error {
        LaunchError::AccessDenied { hub, hint, .. } => {
            assert_eq!(hub, "private");
            assert!(hint.contains("MODELRACK_HUB_TOKEN"));
        }
        other => panic!("expected AccessDenied, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_model_surfaces_not_found() {
    let rig = rig_with(
        CountingHub::new("main", &[]),
        ScriptedRuntime::always_ready(),
        default_registry(),
        1_000,
        1,
        5_000,
    );

    let err = rig.orchestrator.launch(spec("ghost")).await.unwrap_err();
    assert_eq!(err.stage, LaunchStage::Resolve);
    assert!(matches!(err.error, LaunchError::NotFound(_)));
}

// ============================================================================
// Engine selection
// ============================================================================

#[tokio::test]
async fn unsupported_architecture_lists_rejections() {
    let rig = rig_with(
        CountingHub::new("main", &["exotic"]),
        ScriptedRuntime::always_ready(),
        default_registry(),
        1_000,
        1,
        5_000,
    );

    let err = rig
        .orchestrator
        .launch(ModelSpec::new(ModelId::new("exotic"), "mamba"))
        .await
        .unwrap_err();
    assert_eq!(err.stage, LaunchStage::SelectEngine);
    match err.error {
        LaunchError::UnsupportedArchitecture {
            architecture,
            rejections,
        } => {
            assert_eq!(architecture, "mamba");
            assert_eq!(rejections.len(), 2, "both engines rejected with reasons");
        }
        other => panic!("expected UnsupportedArchitecture, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_registry_rejects_with_zero_compatible_engines() {
    let rig = rig_with(
        CountingHub::new("main", &["a"]),
        ScriptedRuntime::always_ready(),
        EngineRegistry::new(),
        1_000,
        1,
        5_000,
    );

    assert!(rig.orchestrator.query_engines(&spec("a")).is_empty());
    let err = rig
        .orchestrator
        .launch(ModelSpec::new(ModelId::new("a"), "x"))
        .await
        .unwrap_err();
    match err.error {
        LaunchError::UnsupportedArchitecture { rejections, .. } => assert!(rejections.is_empty()),
        other => panic!("expected UnsupportedArchitecture, got {other:?}"),
    }
}

#[tokio::test]
async fn engine_query_is_deterministic() {
    let rig = rig_with(
        CountingHub::new("main", &["llama-7b"]),
        ScriptedRuntime::always_ready(),
        default_registry(),
        1_000,
        1,
        5_000,
    );
    let first = rig.orchestrator.query_engines(&spec("llama-7b"));
    assert_eq!(first, vec!["vllm", "llama-cpp"]);
    for _ in 0..10 {
        assert_eq!(rig.orchestrator.query_engines(&spec("llama-7b")), first);
    }
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test]
async fn capacity_race_grants_exactly_one_of_two_oversized_requests() {
    let hub = CountingHub::new("main", &["m1", "m2"]);
    let rig = rig_with(
        hub,
        ScriptedRuntime::always_ready(),
        default_registry(),
        100,
        1,
        5_000,
    );

    let a = rig.orchestrator.launch(spec("m1").with_units(60).unwrap());
    let b = rig.orchestrator.launch(spec("m2").with_units(60).unwrap());
    let (ra, rb) = tokio::join!(a, b);

    let granted = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 1, "exactly one 60-unit grant fits in 100 units");
    let denied = if ra.is_err() { ra.unwrap_err() } else { rb.unwrap_err() };
    assert_eq!(denied.stage, LaunchStage::Allocate);
    assert!(matches!(denied.error, LaunchError::ResourceExhausted(_)));
}

#[tokio::test]
async fn terminate_frees_capacity_for_follow_up_launch() {
    let hub = CountingHub::new("main", &["m1", "m2"]);
    let rig = rig_with(
        hub,
        ScriptedRuntime::always_ready(),
        default_registry(),
        100,
        1,
        5_000,
    );

    let uid = rig
        .orchestrator
        .launch(spec("m1").with_units(80).unwrap())
        .await
        .unwrap();
    // No room while m1 is live.
    assert!(rig
        .orchestrator
        .launch(spec("m2").with_units(80).unwrap())
        .await
        .is_err());

    rig.orchestrator.terminate(&uid).await.unwrap();
    // Terminating again is NotFound, and capacity is back.
    assert!(matches!(
        rig.orchestrator.terminate(&uid).await,
        Err(LaunchError::NotFound(_))
    ));
    rig.orchestrator
        .launch(spec("m2").with_units(80).unwrap())
        .await
        .unwrap();
}

#[test]
fn randomized_concurrent_requests_never_exceed_capacity() {
    use rand::Rng;

    const CAPACITY: u64 = 100;
    let allocator = Arc::new(DeviceAllocator::new(vec![CAPACITY], 0.0));

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let allocator = allocator.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut live = Vec::new();
                for _ in 0..300 {
                    if rng.gen_bool(0.6) {
                        let units = rng.gen_range(1..=30);
                        if let Ok(ticket) = allocator.request(uuid_like(), units) {
                            live.push(ticket.id);
                        }
                    } else if !live.is_empty() {
                        let idx = rng.gen_range(0..live.len());
                        let id = live.swap_remove(idx);
                        allocator.release(id);
                        // Double release must stay a no-op.
                        assert!(!allocator.release(id));
                    }
                    let stats = allocator.statistics();
                    assert!(
                        stats.devices[0].reserved <= CAPACITY,
                        "reserved {} exceeded capacity",
                        stats.devices[0].reserved
                    );
                }
                for id in live {
                    allocator.release(id);
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    let stats = allocator.statistics();
    assert_eq!(stats.devices[0].reserved, 0);
    assert_eq!(stats.active_tickets, 0);
}

fn uuid_like() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

// ============================================================================
// Worker lifecycle
// ============================================================================

#[tokio::test]
async fn transient_starting_crash_retries_then_surfaces_worker_crash() {
    let runtime = ScriptedRuntime::new(vec![Script::DieStarting(
        ExitClass::ShmExhausted,
        "bus error: /dev/shm full",
    )]);
    let rig = rig_with(
        CountingHub::new("main", &["m1"]),
        runtime.clone(),
        default_registry(),
        100,
        3,
        5_000,
    );

    let err = rig
        .orchestrator
        .launch(spec("m1").with_units(40).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.stage, LaunchStage::Spawn);
    match &err.error {
        LaunchError::WorkerCrash(diag) => assert!(diag.contains("/dev/shm full")),
        other => panic!("expected WorkerCrash, got {other:?}"),
    }
    assert_eq!(runtime.spawn_count(), 3, "retried up to the attempt budget");
    // Every per-attempt ticket was released exactly once.
    let stats = rig.orchestrator.statistics();
    assert_eq!(stats.devices[0].reserved, 0);
    assert_eq!(stats.active_tickets, 0);
}

#[tokio::test]
async fn readiness_timeout_fails_launch_and_releases_resources() {
    let rig = rig_with(
        CountingHub::new("main", &["m1"]),
        ScriptedRuntime::new(vec![Script::Hang]),
        default_registry(),
        100,
        1,
        50,
    );

    let err = rig
        .orchestrator
        .launch(spec("m1").with_units(40).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.stage, LaunchStage::Spawn);
    assert!(matches!(err.error, LaunchError::Timeout(_)));
    assert_eq!(rig.orchestrator.statistics().devices[0].reserved, 0);
}

#[tokio::test]
async fn cancellation_after_grant_releases_ticket() {
    let rig = rig_with(
        CountingHub::new("main", &["m1"]),
        ScriptedRuntime::new(vec![Script::Hang]),
        default_registry(),
        100,
        1,
        60_000,
    );

    let cancel = CancellationToken::new();
    let launch = rig
        .orchestrator
        .launch_with_cancel(spec("m1").with_units(40).unwrap(), cancel.clone());
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(launch, canceller);

    let err = result.unwrap_err();
    assert!(matches!(err.error, LaunchError::Cancelled(_)));
    assert_eq!(rig.orchestrator.statistics().devices[0].reserved, 0);
    assert!(rig.orchestrator.list_models().is_empty());
}

#[tokio::test]
async fn aborted_launch_releases_ticket_and_in_flight_entry() {
    let rig = rig_with(
        CountingHub::new("main", &["m1"]),
        ScriptedRuntime::new(vec![Script::Hang, Script::Ready(Duration::ZERO)]),
        default_registry(),
        100,
        1,
        60_000,
    );

    let orch = rig.orchestrator.clone();
    let task = tokio::spawn(async move { orch.launch(spec("m1").with_units(40).unwrap()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();
    let _ = task.await;

    // The dropped launch left neither a reservation nor a stale in-flight
    // entry behind.
    assert_eq!(rig.orchestrator.statistics().devices[0].reserved, 0);
    rig.orchestrator
        .launch(spec("m1").with_units(40).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn followers_of_an_aborted_leader_observe_cancellation() {
    let rig = rig_with(
        CountingHub::new("main", &["m1"]),
        ScriptedRuntime::new(vec![Script::Hang, Script::Ready(Duration::ZERO)]),
        default_registry(),
        100,
        1,
        60_000,
    );

    let orch = rig.orchestrator.clone();
    let leader = tokio::spawn(async move { orch.launch(spec("m1").with_units(40).unwrap()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let orch = rig.orchestrator.clone();
    let follower =
        tokio::spawn(async move { orch.launch(spec("m1").with_units(40).unwrap()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    leader.abort();
    let _ = leader.await;

    let err = follower.await.unwrap().unwrap_err();
    assert!(matches!(err.error, LaunchError::Cancelled(_)));
    assert!(err.error.to_string().contains("abandoned"));

    // The identity is free again for a fresh launch.
    rig.orchestrator
        .launch(spec("m1").with_units(40).unwrap())
        .await
        .unwrap();
    assert_eq!(rig.orchestrator.list_models().len(), 1);
}

#[tokio::test]
async fn post_ready_crash_is_observable_without_respawn() {
    let runtime = ScriptedRuntime::new(vec![Script::ReadyThenDie(
        ExitClass::OomKilled,
        "Out of memory: Killed process 831 (engine-worker)",
    )]);
    let rig = rig_with(
        CountingHub::new("main", &["m1"]),
        runtime.clone(),
        default_registry(),
        100,
        3,
        5_000,
    );

    let uid = rig
        .orchestrator
        .launch(spec("m1").with_units(40).unwrap())
        .await
        .unwrap();

    // Let the monitor observe the crash.
    let mut state = WorkerState::Ready;
    for _ in 0..50 {
        state = rig.orchestrator.describe_model(&uid).unwrap().state;
        if state == WorkerState::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, WorkerState::Failed);

    let info = rig.orchestrator.describe_model(&uid).unwrap();
    assert!(info.last_error.unwrap().contains("Killed process 831"));
    // A ready worker that fails is never silently respawned.
    assert_eq!(runtime.spawn_count(), 1);
    assert_eq!(rig.orchestrator.statistics().devices[0].reserved, 0);
}

#[tokio::test]
async fn list_models_reports_engine_and_units() {
    let rig = rig_with(
        CountingHub::new("main", &["m1"]),
        ScriptedRuntime::always_ready(),
        default_registry(),
        100,
        1,
        5_000,
    );

    let uid = rig
        .orchestrator
        .launch(spec("m1").with_units(25).unwrap().with_engine("llama-cpp"))
        .await
        .unwrap();

    let models = rig.orchestrator.list_models();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].model_uid, uid);
    assert_eq!(models[0].engine, "llama-cpp");
    assert_eq!(models[0].units, 25);
    assert_eq!(models[0].state, WorkerState::Ready);
}
