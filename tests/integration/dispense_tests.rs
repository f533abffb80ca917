//! Integration tests for the dispense pipeline: planning, concurrency,
//! commit discipline, partial failure, abort and manual steps.

use std::time::{Duration, Instant};

use dispenser::Error;
use dispenser::app::commands::{AppCommand, AppResponse};
use dispenser::app::events::DispenseEvent;
use dispenser::dispense::state::JobState;
use dispenser::dispense::{DispenseResult, DispenseStatus};
use dispenser::recipe::{Recipe, RecipeStep};

use super::mock_hw::{ActuatorCall, Rig, abc_pumps, level, rig, test_config, wait_until};

const FAST: Duration = Duration::from_millis(20);

fn full_abc(run_time: Duration) -> Rig {
    rig(
        abc_pumps(),
        vec![level("a", 1000.0), level("b", 1000.0), level("c", 1000.0)],
        test_config(),
        run_time,
    )
}

fn pour(rig: &Rig, recipe: Recipe, size_ml: f32) -> Result<DispenseResult, Error> {
    match rig.service.handle_command(AppCommand::Dispense { recipe, size_ml })? {
        AppResponse::Dispensed(r) => Ok(r),
        other => panic!("unexpected response {other:?}"),
    }
}

fn abc_recipe() -> Recipe {
    Recipe::new(
        "abc",
        vec![
            RecipeStep::automatic("a", 50.0),
            RecipeStep::automatic("b", 50.0),
            RecipeStep::automatic("c", 50.0),
        ],
    )
}

// ── Happy path ────────────────────────────────────────────────

#[test]
fn completed_job_deducts_every_ingredient() {
    let rig = full_abc(FAST);
    let result = pour(&rig, abc_recipe(), 150.0).unwrap();

    assert_eq!(result.status, DispenseStatus::Completed);
    assert!(result.error.is_none());
    for ingredient in ["a", "b", "c"] {
        assert!((result.dispensed_by_ingredient[ingredient] - 50.0).abs() < 1e-3);
        assert!((rig.ledger.get(ingredient).current_amount_ml - 950.0).abs() < 1e-3);
    }
    assert_eq!(
        rig.sink.states(),
        vec![JobState::Planning, JobState::Dispensing, JobState::Completed]
    );
}

#[test]
fn durations_follow_flow_rate_and_size() {
    let rig = full_abc(FAST);
    pour(&rig, Recipe::shot("a", 50.0), 100.0).unwrap();
    assert_eq!(
        rig.actuator.calls()[0],
        ActuatorCall::Activate {
            pump: 1,
            duration_ms: 4000
        }
    );
}

#[test]
fn never_more_than_max_concurrent_pumps() {
    let rig = full_abc(Duration::from_millis(60));
    let result = pour(&rig, abc_recipe(), 150.0).unwrap();

    assert_eq!(result.status, DispenseStatus::Completed);
    assert_eq!(rig.actuator.activated().len(), 3);
    assert_eq!(rig.actuator.max_active(), 2);
}

#[test]
fn single_pump_limit_runs_sequentially() {
    let config = dispenser::config::DispenserConfig {
        max_concurrent_pumps: 1,
        ..test_config()
    };
    let rig = rig(
        abc_pumps(),
        vec![level("a", 1000.0), level("b", 1000.0), level("c", 1000.0)],
        config,
        FAST,
    );
    pour(&rig, abc_recipe(), 150.0).unwrap();
    assert_eq!(rig.actuator.max_active(), 1);
    assert_eq!(rig.actuator.activated(), vec![1, 2, 3]);
}

#[test]
fn reported_volume_is_what_gets_deducted() {
    let rig = full_abc(FAST);
    rig.actuator.report_volume(1, 47.5);
    let result = pour(&rig, Recipe::shot("a", 50.0), 50.0).unwrap();
    assert!((result.dispensed_by_ingredient["a"] - 47.5).abs() < 1e-3);
    assert!((rig.ledger.get("a").current_amount_ml - 952.5).abs() < 1e-3);
}

#[test]
fn delayed_steps_start_after_immediate_ones() {
    let rig = full_abc(FAST);
    let recipe = Recipe::new(
        "layered",
        vec![
            RecipeStep::delayed("c", 10.0),
            RecipeStep::automatic("a", 50.0),
            RecipeStep::automatic("b", 50.0),
        ],
    );
    pour(&rig, recipe, 110.0).unwrap();
    let order = rig.actuator.activated();
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], 3, "delayed pump must start last");
}

// ── Rejections and planning failures ──────────────────────────

#[test]
fn unknown_ingredient_is_rejected_without_state_change() {
    let rig = full_abc(FAST);
    let err = pour(&rig, Recipe::shot("absinthe", 20.0), 20.0).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(rig.actuator.calls().is_empty());
    assert!((rig.ledger.get("a").current_amount_ml - 1000.0).abs() < 1e-3);
}

#[test]
fn zero_size_is_rejected() {
    let rig = full_abc(FAST);
    assert!(matches!(pour(&rig, abc_recipe(), 0.0), Err(Error::Config(_))));
}

#[test]
fn insufficient_stock_fails_before_any_pump_runs() {
    let rig = rig(
        abc_pumps(),
        vec![level("a", 1000.0), level("b", 10.0), level("c", 1000.0)],
        test_config(),
        FAST,
    );
    let result = pour(&rig, abc_recipe(), 150.0).unwrap();

    assert_eq!(result.status, DispenseStatus::Failed);
    match result.error {
        Some(Error::InsufficientStock { ingredient, .. }) => assert_eq!(ingredient, "b"),
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
    assert!(rig.actuator.calls().is_empty());
    assert_eq!(rig.sink.states(), vec![JobState::Planning, JobState::Failed]);
}

// ── Partial completion ────────────────────────────────────────

#[test]
fn stock_lost_mid_job_ends_partially_completed() {
    let config = dispenser::config::DispenserConfig {
        max_concurrent_pumps: 1,
        ..test_config()
    };
    let rig = rig(
        abc_pumps(),
        vec![level("a", 1000.0), level("b", 1000.0)],
        config,
        FAST,
    );
    // Someone drains `b` while `a` is pouring.
    let ledger = rig.ledger.clone();
    rig.actuator.on_activate(move |pump| {
        if pump.ingredient_id == "a" {
            ledger.set_amount("b", 0.0).unwrap();
        }
    });

    let recipe = Recipe::new(
        "ab",
        vec![
            RecipeStep::automatic("a", 50.0),
            RecipeStep::automatic("b", 50.0),
        ],
    );
    let result = pour(&rig, recipe, 100.0).unwrap();

    assert_eq!(result.status, DispenseStatus::PartiallyCompleted);
    assert!((result.dispensed_by_ingredient["a"] - 50.0).abs() < 1e-3);
    assert!(!result.dispensed_by_ingredient.contains_key("b"));
    assert!(matches!(
        result.error,
        Some(Error::InsufficientStock { ref ingredient, .. }) if ingredient == "b"
    ));
    assert_eq!(rig.actuator.activated(), vec![1], "pump b must never start");
    assert!((rig.ledger.get("b").current_amount_ml).abs() < 1e-6);
    assert_eq!(
        rig.sink.states().last(),
        Some(&JobState::PartiallyCompleted)
    );
}

#[test]
fn failed_actuation_is_not_deducted() {
    let rig = full_abc(FAST);
    rig.actuator.fail_pump(2);
    let result = pour(&rig, abc_recipe(), 150.0).unwrap();

    assert_eq!(result.status, DispenseStatus::PartiallyCompleted);
    assert_eq!(result.failed_actuations.len(), 1);
    assert_eq!(result.failed_actuations[0].pump, 2);
    assert!((rig.ledger.get("b").current_amount_ml - 1000.0).abs() < 1e-3);
    assert!((rig.ledger.get("a").current_amount_ml - 950.0).abs() < 1e-3);
    assert!(matches!(result.error, Some(Error::Actuation { pump: 2, .. })));
}

#[test]
fn only_actuation_failing_means_failed() {
    let rig = full_abc(FAST);
    rig.actuator.fail_pump(1);
    let result = pour(&rig, Recipe::shot("a", 30.0), 30.0).unwrap();
    assert_eq!(result.status, DispenseStatus::Failed);
    assert!(result.dispensed_by_ingredient.is_empty());
}

#[test]
fn store_outage_does_not_change_the_result() {
    let rig = full_abc(FAST);
    rig.store.set_down(true);
    let result = pour(&rig, abc_recipe(), 150.0).unwrap();
    assert_eq!(result.status, DispenseStatus::Completed);
    assert!((rig.ledger.get("a").current_amount_ml - 950.0).abs() < 1e-3);
    assert!(rig.ledger.is_dirty());

    rig.store.set_down(false);
    assert!(rig.service.flush());
    let saved = rig.store.saved_levels();
    let a = saved.iter().find(|l| l.ingredient_id == "a").unwrap();
    assert!((a.current_amount_ml - 950.0).abs() < 1e-3);
}

#[test]
fn levels_are_written_once_the_phase_has_drained() {
    let rig = full_abc(Duration::from_millis(400));
    rig.actuator.run_for(1, FAST);
    let service = rig.service.clone();
    let job = std::thread::spawn(move || {
        service.handle_command(AppCommand::Dispense {
            recipe: ab_recipe(),
            size_ml: 100.0,
        })
    });

    assert!(wait_until(Duration::from_secs(2), || {
        (rig.ledger.get("a").current_amount_ml - 950.0).abs() < 1e-3
    }));
    // Pump b is still running, so nothing has been written yet.
    assert_eq!(rig.actuator.active(), 1);
    let saved = rig.store.saved_levels();
    let a = saved.iter().find(|l| l.ingredient_id == "a").unwrap();
    assert!((a.current_amount_ml - 1000.0).abs() < 1e-3);

    let result = join_result(job);
    assert_eq!(result.status, DispenseStatus::Completed);
    for l in rig.store.saved_levels().iter().filter(|l| l.ingredient_id != "c") {
        assert!((l.current_amount_ml - 950.0).abs() < 1e-3, "{l:?}");
    }
    assert!(!rig.ledger.is_dirty());
}

#[test]
fn low_stock_is_reported_after_commit() {
    let rig = rig(abc_pumps(), vec![level("a", 200.0)], test_config(), FAST);
    pour(&rig, Recipe::shot("a", 100.0), 100.0).unwrap();
    assert!(rig.sink.events().iter().any(|e| matches!(
        e,
        DispenseEvent::StockLow { ingredient, .. } if ingredient == "a"
    )));
}

// ── Abort ─────────────────────────────────────────────────────

#[test]
fn abort_stops_pumps_and_commits_nothing() {
    let rig = full_abc(Duration::from_secs(5));
    let service = rig.service.clone();
    let job = std::thread::spawn(move || {
        service.handle_command(AppCommand::Dispense {
            recipe: abc_recipe(),
            size_ml: 150.0,
        })
    });

    assert!(wait_until(Duration::from_secs(2), || rig.actuator.active() == 2));
    let started = Instant::now();
    rig.service.handle_command(AppCommand::Abort).unwrap();

    let result = match job.join().unwrap().unwrap() {
        AppResponse::Dispensed(r) => r,
        other => panic!("unexpected response {other:?}"),
    };
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.status, DispenseStatus::Aborted);
    assert!(result.dispensed_by_ingredient.is_empty());
    for ingredient in ["a", "b", "c"] {
        assert!((rig.ledger.get(ingredient).current_amount_ml - 1000.0).abs() < 1e-3);
    }
    let calls = rig.actuator.calls();
    assert!(calls.contains(&ActuatorCall::Deactivate(1)));
    assert!(calls.contains(&ActuatorCall::Deactivate(2)));
    assert_eq!(rig.actuator.activated().len(), 2, "queued pump must not start");
    assert_eq!(
        rig.sink.states(),
        vec![
            JobState::Planning,
            JobState::Dispensing,
            JobState::Aborting,
            JobState::Aborted
        ]
    );
}

fn ab_recipe() -> Recipe {
    Recipe::new(
        "ab",
        vec![
            RecipeStep::automatic("a", 50.0),
            RecipeStep::automatic("b", 50.0),
        ],
    )
}

fn join_result(
    job: std::thread::JoinHandle<Result<AppResponse, Error>>,
) -> DispenseResult {
    match job.join().unwrap().unwrap() {
        AppResponse::Dispensed(r) => r,
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn abort_after_one_pump_finished_keeps_its_commit() {
    let rig = full_abc(Duration::from_secs(5));
    rig.actuator.run_for(1, FAST);
    let service = rig.service.clone();
    let job = std::thread::spawn(move || {
        service.handle_command(AppCommand::Dispense {
            recipe: ab_recipe(),
            size_ml: 100.0,
        })
    });

    assert!(wait_until(Duration::from_secs(2), || {
        (rig.ledger.get("a").current_amount_ml - 950.0).abs() < 1e-3
    }));
    assert_eq!(rig.actuator.active(), 1);
    rig.service.handle_command(AppCommand::Abort).unwrap();

    let result = join_result(job);
    assert_eq!(result.status, DispenseStatus::Aborted);
    assert_eq!(result.dispensed_by_ingredient.len(), 1);
    assert!((result.dispensed_by_ingredient["a"] - 50.0).abs() < 1e-3);
    assert!((rig.ledger.get("a").current_amount_ml - 950.0).abs() < 1e-3);
    assert!((rig.ledger.get("b").current_amount_ml - 1000.0).abs() < 1e-3);
    assert!(rig.actuator.calls().contains(&ActuatorCall::Deactivate(2)));

    let saved = rig.store.saved_levels();
    let a = saved.iter().find(|l| l.ingredient_id == "a").unwrap();
    assert!((a.current_amount_ml - 950.0).abs() < 1e-3);
}

#[test]
fn abort_without_job_is_invalid() {
    let rig = full_abc(FAST);
    assert!(matches!(
        rig.service.handle_command(AppCommand::Abort),
        Err(Error::InvalidState { action: "abort", .. })
    ));
}

// ── Rig gate ──────────────────────────────────────────────────

#[test]
fn second_job_is_busy() {
    let rig = full_abc(Duration::from_millis(300));
    let service = rig.service.clone();
    let job = std::thread::spawn(move || {
        service.handle_command(AppCommand::Dispense {
            recipe: Recipe::shot("a", 50.0),
            size_ml: 50.0,
        })
    });
    assert!(wait_until(Duration::from_secs(2), || rig.actuator.active() == 1));

    let busy = rig.service.handle_command(AppCommand::Shot {
        ingredient: "b".into(),
        amount_ml: 20.0,
    });
    assert!(matches!(busy, Err(Error::Busy { ref holder }) if holder == "dispense"));

    let vent = rig.service.handle_command(AppCommand::Vent {
        pump: 3,
        duration_ms: None,
    });
    assert!(matches!(vent, Err(Error::Busy { .. })));

    job.join().unwrap().unwrap();
    // Gate released: the next job goes through.
    assert!(pour(&rig, Recipe::shot("b", 20.0), 20.0).is_ok());
}

// ── Manual steps ──────────────────────────────────────────────

fn garnished() -> Recipe {
    Recipe::new(
        "garnished",
        vec![
            RecipeStep::automatic("a", 50.0),
            RecipeStep::manual("lime", "Add a lime wedge"),
            RecipeStep::automatic("b", 50.0),
        ],
    )
}

#[test]
fn manual_step_waits_for_resume() {
    let rig = full_abc(FAST);
    assert!(matches!(
        rig.service.handle_command(AppCommand::Resume),
        Err(Error::InvalidState { .. })
    ));

    let service = rig.service.clone();
    let job = std::thread::spawn(move || {
        service.handle_command(AppCommand::Dispense {
            recipe: garnished(),
            size_ml: 100.0,
        })
    });

    let orchestrator = rig.service.orchestrator();
    assert!(wait_until(Duration::from_secs(2), || {
        orchestrator
            .status()
            .is_some_and(|s| s.pending_manual.is_some())
    }));
    let status = orchestrator.status().unwrap();
    assert_eq!(status.state, JobState::Dispensing);
    assert_eq!(
        status.pending_manual.unwrap().instruction.as_deref(),
        Some("Add a lime wedge")
    );
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rig.actuator.activated(), vec![1], "must not pass the manual step");

    rig.service.handle_command(AppCommand::Resume).unwrap();
    let result = match job.join().unwrap().unwrap() {
        AppResponse::Dispensed(r) => r,
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(result.status, DispenseStatus::Completed);
    assert_eq!(rig.actuator.activated(), vec![1, 2]);

    let events = rig.sink.events();
    assert!(events.iter().any(|e| matches!(e, DispenseEvent::ManualStepPending { .. })));
    assert!(events.iter().any(|e| matches!(e, DispenseEvent::ManualStepAcknowledged { .. })));
}

#[test]
fn resume_while_pouring_is_invalid() {
    let rig = full_abc(Duration::from_millis(300));
    let service = rig.service.clone();
    let job = std::thread::spawn(move || {
        service.handle_command(AppCommand::Dispense {
            recipe: garnished(),
            size_ml: 100.0,
        })
    });
    assert!(wait_until(Duration::from_secs(2), || rig.actuator.active() == 1));
    assert!(matches!(
        rig.service.handle_command(AppCommand::Resume),
        Err(Error::InvalidState { action: "resume", .. })
    ));
    rig.service.handle_command(AppCommand::Abort).unwrap();
    job.join().unwrap().unwrap();
}

#[test]
fn abort_during_manual_pause() {
    let rig = full_abc(FAST);
    let service = rig.service.clone();
    let job = std::thread::spawn(move || {
        service.handle_command(AppCommand::Dispense {
            recipe: garnished(),
            size_ml: 100.0,
        })
    });
    let orchestrator = rig.service.orchestrator();
    assert!(wait_until(Duration::from_secs(2), || {
        orchestrator
            .status()
            .is_some_and(|s| s.pending_manual.is_some())
    }));
    rig.service.handle_command(AppCommand::Abort).unwrap();

    let result = match job.join().unwrap().unwrap() {
        AppResponse::Dispensed(r) => r,
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(result.status, DispenseStatus::Aborted);
    assert_eq!(rig.actuator.activated(), vec![1]);
    // `a` finished before the pause and stays committed.
    assert!((rig.ledger.get("a").current_amount_ml - 950.0).abs() < 1e-3);
}

// ── Availability ──────────────────────────────────────────────

#[test]
fn availability_reports_low_and_missing() {
    let rig = rig(
        abc_pumps(),
        vec![level("a", 100.0), level("b", 20.0), level("c", 1000.0)],
        test_config(),
        FAST,
    );
    let response = rig
        .service
        .handle_command(AppCommand::Availability {
            recipe: abc_recipe(),
            size_ml: 150.0,
        })
        .unwrap();
    let AppResponse::Availability(a) = response else {
        panic!("unexpected response {response:?}");
    };
    assert!(!a.can_make);
    assert_eq!(a.missing_ingredients, vec!["b".to_string()]);
    assert_eq!(a.low_ingredients, vec!["a".to_string()]);
    // Pure: nothing moved.
    assert!(rig.actuator.calls().is_empty());
}

#[test]
fn shot_pours_exact_amount() {
    let rig = full_abc(FAST);
    let response = rig
        .service
        .handle_command(AppCommand::Shot {
            ingredient: "c".into(),
            amount_ml: 40.0,
        })
        .unwrap();
    let AppResponse::Dispensed(result) = response else {
        panic!("unexpected response {response:?}");
    };
    assert_eq!(result.status, DispenseStatus::Completed);
    assert!((result.total_dispensed_ml() - 40.0).abs() < 1e-3);
}
