//! Module lifecycle tests
//!
//! Loading, dependency-ordered startup, stop/unload semantics, failure
//! handling, and the same-id concurrency contract.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;

use modhost::{ModuleError, ModuleState, TransitionOutcome};

#[tokio::test]
async fn load_single_module_ends_running() {
    let fixture = RuntimeFixture::new();
    let probe = fixture.add_module("a", "1.0.0", "");

    fixture.manager.load("a").await.unwrap();

    assert_eq!(
        fixture.manager.module_state("a").await,
        Some(ModuleState::Running)
    );
    assert_eq!(probe.construction_count(), 1);
    assert_eq!(probe.init_count(), 1);

    let snapshot = fixture.manager.snapshot("a").await.unwrap();
    let states: Vec<ModuleState> = snapshot.history.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            ModuleState::Validated,
            ModuleState::Loading,
            ModuleState::Loaded,
            ModuleState::Initializing,
            ModuleState::Initialized,
            ModuleState::Starting,
            ModuleState::Running,
        ]
    );
}

#[tokio::test]
async fn load_dependent_pulls_in_dependency_first() {
    let fixture = RuntimeFixture::new();
    let probe_a = fixture.add_module("a", "1.0.0", "");
    let probe_b = fixture.add_module("b", "1.0.0", &dep_entry("a", "1.0.0", false));

    fixture.manager.load("b").await.unwrap();

    assert_eq!(
        fixture.manager.module_state("a").await,
        Some(ModuleState::Running)
    );
    assert_eq!(
        fixture.manager.module_state("b").await,
        Some(ModuleState::Running)
    );
    assert_eq!(probe_a.construction_count(), 1);
    assert_eq!(probe_b.construction_count(), 1);

    // The dependency records its dependent.
    let snapshot = fixture.manager.snapshot("a").await.unwrap();
    assert_eq!(snapshot.dependents, vec!["b".to_string()]);
}

#[tokio::test]
async fn unload_rejected_while_dependents_live() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("a", "1.0.0", "");
    fixture.add_module("b", "1.0.0", &dep_entry("a", "1.0.0", false));
    fixture.manager.load("b").await.unwrap();

    // Rejected, and idempotently so.
    for _ in 0..2 {
        match fixture.manager.unload("a").await {
            Err(ModuleError::DependentsExist { module, dependents }) => {
                assert_eq!(module, "a");
                assert_eq!(dependents, vec!["b".to_string()]);
            }
            other => panic!("expected DependentsExist, got {:?}", other.err()),
        }
    }
    assert_eq!(
        fixture.manager.module_state("a").await,
        Some(ModuleState::Running)
    );

    // Unloading dependents-first works.
    fixture.manager.unload("b").await.unwrap();
    fixture.manager.unload("a").await.unwrap();
    assert_eq!(fixture.manager.module_state("a").await, None);
}

#[tokio::test]
async fn cascade_unload_is_explicit_and_ordered() {
    let fixture = RuntimeFixture::new();
    let probe_a = fixture.add_module("a", "1.0.0", "");
    let probe_b = fixture.add_module("b", "1.0.0", &dep_entry("a", "1.0.0", false));
    let probe_c = fixture.add_module("c", "1.0.0", &dep_entry("b", "1.0.0", false));
    fixture.manager.load("c").await.unwrap();

    fixture.manager.unload_cascade("a").await.unwrap();

    assert_eq!(fixture.manager.list_modules().await, Vec::<String>::new());
    assert_eq!(probe_a.stop_count(), 1);
    assert_eq!(probe_b.stop_count(), 1);
    assert_eq!(probe_c.stop_count(), 1);
}

#[tokio::test]
async fn failed_init_leaves_failed_record_until_purged() {
    let fixture = RuntimeFixture::new();
    fixture.write_manifest("broken", "1.0.0", "");
    fixture.register_mock(
        "broken",
        MockBehavior {
            fail_init: true,
            ..Default::default()
        },
    );

    let err = fixture.manager.load("broken").await.unwrap_err();
    assert!(matches!(err, ModuleError::OperationError(_)));

    // The failed module stays visible with its history for diagnosis.
    let snapshot = fixture.manager.snapshot("broken").await.unwrap();
    assert_eq!(snapshot.state, ModuleState::Failed);
    assert!(snapshot
        .history
        .iter()
        .any(|t| matches!(t.outcome, TransitionOutcome::Failed(_))));

    // A second load observes the recorded failure, not a retry.
    let err = fixture.manager.load("broken").await.unwrap_err();
    assert!(err.to_string().contains("previously failed"));

    fixture.manager.purge("broken").await.unwrap();
    assert!(fixture.manager.snapshot("broken").await.is_none());
}

#[tokio::test]
async fn init_deadline_exceeded_fails_module() {
    let fixture = RuntimeFixture::with_config(|config| {
        config.lifecycle.init_deadline_ms = 50;
    });
    fixture.write_manifest("slow", "1.0.0", "");
    fixture.register_mock(
        "slow",
        MockBehavior {
            init_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );

    let err = fixture.manager.load("slow").await.unwrap_err();
    assert!(matches!(err, ModuleError::Timeout(_)));
    assert_eq!(
        fixture.manager.module_state("slow").await,
        Some(ModuleState::Failed)
    );
}

#[tokio::test]
async fn stop_past_deadline_is_recorded_as_forced() {
    let fixture = RuntimeFixture::with_config(|config| {
        config.lifecycle.stop_deadline_ms = 50;
    });
    fixture.write_manifest("stubborn", "1.0.0", "");
    fixture.register_mock(
        "stubborn",
        MockBehavior {
            stop_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );
    fixture.manager.load("stubborn").await.unwrap();

    fixture.manager.stop("stubborn").await.unwrap();

    let snapshot = fixture.manager.snapshot("stubborn").await.unwrap();
    assert_eq!(snapshot.state, ModuleState::Stopped);
    let stop_transition = snapshot
        .history
        .iter()
        .find(|t| t.to == ModuleState::Stopped)
        .unwrap();
    assert_eq!(stop_transition.outcome, TransitionOutcome::Forced);
}

#[tokio::test]
async fn graceful_stop_is_recorded_as_completed() {
    let fixture = RuntimeFixture::new();
    let probe = fixture.add_module("polite", "1.0.0", "");
    fixture.manager.load("polite").await.unwrap();

    fixture.manager.stop("polite").await.unwrap();

    assert_eq!(probe.stop_count(), 1);
    let snapshot = fixture.manager.snapshot("polite").await.unwrap();
    let stop_transition = snapshot
        .history
        .iter()
        .find(|t| t.to == ModuleState::Stopped)
        .unwrap();
    assert_eq!(stop_transition.outcome, TransitionOutcome::Completed);
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("svc", "1.0.0", "");
    fixture.manager.load("svc").await.unwrap();

    fixture.manager.pause("svc").await.unwrap();
    assert_eq!(
        fixture.manager.module_state("svc").await,
        Some(ModuleState::Paused)
    );

    fixture.manager.resume("svc").await.unwrap();
    assert_eq!(
        fixture.manager.module_state("svc").await,
        Some(ModuleState::Running)
    );
}

#[tokio::test]
async fn restart_after_stop_reuses_instance() {
    let fixture = RuntimeFixture::new();
    let probe = fixture.add_module("svc", "1.0.0", "");
    fixture.manager.load("svc").await.unwrap();
    fixture.manager.stop("svc").await.unwrap();

    fixture.manager.load("svc").await.unwrap();

    assert_eq!(
        fixture.manager.module_state("svc").await,
        Some(ModuleState::Running)
    );
    assert_eq!(probe.construction_count(), 1);
}

#[tokio::test]
async fn pause_requires_running() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("svc", "1.0.0", "");
    fixture.manager.load("svc").await.unwrap();
    fixture.manager.stop("svc").await.unwrap();

    let err = fixture.manager.pause("svc").await.unwrap_err();
    assert!(matches!(err, ModuleError::InvalidTransition { .. }));
}

#[tokio::test]
async fn concurrent_loads_collapse_to_one_construction() {
    let fixture = RuntimeFixture::new();
    let probe = fixture.add_module("shared", "1.0.0", "");
    let manager = Arc::clone(&fixture.manager);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move { manager.load("shared").await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(probe.construction_count(), 1);
    assert_eq!(probe.init_count(), 1);
    assert_eq!(
        fixture.manager.module_state("shared").await,
        Some(ModuleState::Running)
    );
}

#[tokio::test]
async fn cancelled_load_resolves_to_failed() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("late", "1.0.0", "");

    let cancel = modhost::CancelToken::new();
    cancel.cancel();
    let err = fixture
        .manager
        .load_with_cancel("late", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ModuleError::Cancelled(_)));

    // Cancelled before any record existed: nothing half-constructed left.
    assert!(fixture.manager.snapshot("late").await.is_none());
}

#[tokio::test]
async fn preloaded_entry_consumes_injected_instance() {
    let fixture = RuntimeFixture::new();
    let module_dir = fixture.modules_dir().join("injected");
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(
        module_dir.join("module.toml"),
        "name = \"injected\"\nversion = \"1.0.0\"\nentry = \"preloaded\"\n",
    )
    .unwrap();

    // Without an injected instance the entry is unavailable.
    let err = fixture.manager.load("injected").await.unwrap_err();
    assert!(matches!(err, ModuleError::EntryUnavailable(_)));
    fixture.manager.purge("injected").await.unwrap();

    let probe = MockProbe::default();
    fixture
        .manager
        .provide_instance(
            "injected",
            Box::new(MockModule::new(MockBehavior::default(), probe.clone())),
        )
        .await;

    fixture.manager.load("injected").await.unwrap();
    assert_eq!(
        fixture.manager.module_state("injected").await,
        Some(ModuleState::Running)
    );
    assert_eq!(probe.init_count(), 1);
}

#[tokio::test]
async fn missing_module_is_reported() {
    let fixture = RuntimeFixture::new();
    let err = fixture.manager.load("ghost").await.unwrap_err();
    assert!(matches!(err, ModuleError::ModuleNotFound(_)));
}

#[tokio::test]
async fn missing_required_dependency_fails_load() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("app", "1.0.0", &dep_entry("ghost", "1.0.0", false));

    let err = fixture.manager.load("app").await.unwrap_err();
    assert!(matches!(err, ModuleError::DependencyMissing(_)));
}

#[tokio::test]
async fn missing_optional_dependency_is_skipped() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("app", "1.0.0", &dep_entry("ghost", "1.0.0", true));

    fixture.manager.load("app").await.unwrap();
    assert_eq!(
        fixture.manager.module_state("app").await,
        Some(ModuleState::Running)
    );
}

#[tokio::test]
async fn dependency_cycle_is_rejected_with_path() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("x", "1.0.0", &dep_entry("y", "1.0.0", false));
    fixture.add_module("y", "1.0.0", &dep_entry("x", "1.0.0", false));

    match fixture.manager.load("x").await {
        Err(ModuleError::DependencyCycle { path }) => {
            assert_eq!(path, vec!["x".to_string(), "y".to_string(), "x".to_string()]);
        }
        other => panic!("expected DependencyCycle, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn version_constraint_mismatch_fails_load() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("base", "0.9.0", "");
    fixture.add_module("app", "1.0.0", &dep_entry("base", "^1.0.0", false));

    let err = fixture.manager.load("app").await.unwrap_err();
    assert!(matches!(err, ModuleError::VersionIncompatible(_)));
}

#[tokio::test]
async fn auto_load_brings_up_all_discovered_modules() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("one", "1.0.0", "");
    fixture.add_module("two", "1.0.0", &dep_entry("one", "1.0.0", false));

    fixture.manager.auto_load().await.unwrap();

    assert_eq!(
        fixture.manager.module_state("one").await,
        Some(ModuleState::Running)
    );
    assert_eq!(
        fixture.manager.module_state("two").await,
        Some(ModuleState::Running)
    );
}

#[tokio::test]
async fn shutdown_unloads_dependents_before_dependencies() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("a", "1.0.0", "");
    fixture.add_module("b", "1.0.0", &dep_entry("a", "1.0.0", false));
    fixture.manager.load("b").await.unwrap();

    let mut events = fixture.manager.events().subscribe();
    fixture.manager.shutdown().await.unwrap();
    assert_eq!(fixture.manager.list_modules().await, Vec::<String>::new());

    // b must reach Unloaded before a does.
    let mut unload_order = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let modhost::RuntimeEvent::StateChanged { module, to, .. } = event {
            if to == ModuleState::Unloaded {
                unload_order.push(module);
            }
        }
    }
    assert_eq!(unload_order, vec!["b".to_string(), "a".to_string()]);
}

#[tokio::test]
async fn transition_events_are_published() {
    let fixture = RuntimeFixture::new();
    fixture.add_module("observed", "1.0.0", "");
    let mut events = fixture.manager.events().subscribe();

    fixture.manager.load("observed").await.unwrap();

    let mut reached_running = false;
    let mut approved = false;
    while let Ok(event) = events.try_recv() {
        match event {
            modhost::RuntimeEvent::StateChanged { module, to, .. }
                if module == "observed" && to == ModuleState::Running =>
            {
                reached_running = true;
            }
            modhost::RuntimeEvent::SecurityDecision {
                module, approved: a, ..
            } if module == "observed" => {
                approved = a;
            }
            _ => {}
        }
    }
    assert!(reached_running);
    assert!(approved);
}
