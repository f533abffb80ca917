//! Calibration, vent, clean and pump-table commands through `AppService`.

use std::time::Duration;

use dispenser::Error;
use dispenser::app::commands::{AppCommand, AppResponse};
use dispenser::app::events::DispenseEvent;
use dispenser::calibration::CalibrationRun;
use dispenser::gate::RigOperation;
use dispenser::recipe::Recipe;
use dispenser::registry::PumpConfig;

use super::mock_hw::{ActuatorCall, Rig, abc_pumps, level, rig, test_config, wait_until};

fn maintenance_rig() -> Rig {
    let mut pumps = abc_pumps();
    pumps[1].vent_duration_ms = Some(3500);
    pumps[2].enabled = false;
    rig(
        pumps,
        vec![level("a", 1000.0), level("b", 1000.0), level("c", 1000.0)],
        test_config(),
        Duration::from_millis(5),
    )
}

#[test]
fn calibration_updates_flow_rate() {
    let rig = maintenance_rig();
    let response = rig
        .service
        .handle_command(AppCommand::CalibrationTest {
            pump: 1,
            duration_ms: 10_000,
        })
        .unwrap();
    let AppResponse::CalibrationRun(run) = response else {
        panic!("unexpected response {response:?}");
    };
    assert_eq!(
        run,
        CalibrationRun {
            pump: 1,
            duration_ms: 10_000
        }
    );

    let response = rig
        .service
        .handle_command(AppCommand::CompleteCalibration {
            run,
            measured_ml: 150.0,
        })
        .unwrap();
    let AppResponse::FlowRate { pump, ml_per_sec } = response else {
        panic!("unexpected response {response:?}");
    };
    assert_eq!(pump, 1);
    assert!((ml_per_sec - 15.0).abs() < 1e-4);
    assert!((rig.registry.pump(1).unwrap().flow_rate_ml_per_sec - 15.0).abs() < 1e-4);

    // The ledger is never touched by calibration.
    assert!((rig.ledger.get("a").current_amount_ml - 1000.0).abs() < 1e-3);
    // The new rate is persisted.
    assert!(rig.store.saves() > 0);
}

#[test]
fn new_flow_rate_drives_the_next_pour() {
    let rig = maintenance_rig();
    let run = CalibrationRun {
        pump: 1,
        duration_ms: 10_000,
    };
    rig.service
        .handle_command(AppCommand::CompleteCalibration {
            run,
            measured_ml: 100.0,
        })
        .unwrap();
    rig.service
        .handle_command(AppCommand::Dispense {
            recipe: Recipe::shot("a", 50.0),
            size_ml: 50.0,
        })
        .unwrap();
    assert_eq!(
        rig.actuator.calls().last(),
        Some(&ActuatorCall::Activate {
            pump: 1,
            duration_ms: 5000
        })
    );
}

#[test]
fn implausible_measurement_leaves_rate_unchanged() {
    let rig = maintenance_rig();
    let run = CalibrationRun {
        pump: 2,
        duration_ms: 1000,
    };
    for measured_ml in [0.0, -3.0, 1000.0] {
        let err = rig
            .service
            .handle_command(AppCommand::CompleteCalibration { run, measured_ml })
            .unwrap_err();
        assert!(matches!(err, Error::Calibration(_)), "{measured_ml}: {err:?}");
    }
    assert!((rig.registry.pump(2).unwrap().flow_rate_ml_per_sec - 25.0).abs() < 1e-6);
}

#[test]
fn unknown_pump_is_not_found() {
    let rig = maintenance_rig();
    let err = rig
        .service
        .handle_command(AppCommand::Clean {
            pump: 42,
            duration_ms: 1000,
        })
        .unwrap_err();
    assert_eq!(err, Error::PumpNotFound(42));
    assert!(rig.actuator.calls().is_empty());
}

#[test]
fn vent_prefers_pump_duration_over_default() {
    let rig = maintenance_rig();
    let vented = rig
        .service
        .handle_command(AppCommand::Vent {
            pump: 2,
            duration_ms: None,
        })
        .unwrap();
    assert!(matches!(
        vented,
        AppResponse::Ran {
            pump: 2,
            duration_ms: 3500
        }
    ));

    let defaulted = rig
        .service
        .handle_command(AppCommand::Vent {
            pump: 1,
            duration_ms: None,
        })
        .unwrap();
    let expected = test_config().default_vent_ms;
    assert!(matches!(
        defaulted,
        AppResponse::Ran { pump: 1, duration_ms } if duration_ms == expected
    ));
}

#[test]
fn disabled_pump_can_still_be_cleaned() {
    let rig = maintenance_rig();
    rig.service
        .handle_command(AppCommand::Clean {
            pump: 3,
            duration_ms: 2000,
        })
        .unwrap();
    assert_eq!(
        rig.actuator.calls(),
        vec![ActuatorCall::Activate {
            pump: 3,
            duration_ms: 2000
        }]
    );
    assert!(rig.sink.events().iter().any(|e| matches!(
        e,
        DispenseEvent::MaintenanceFinished {
            operation: RigOperation::Clean(3),
            ok: true,
            ..
        }
    )));
}

#[test]
fn disabled_pump_is_not_used_for_dispensing() {
    let rig = maintenance_rig();
    let err = rig
        .service
        .handle_command(AppCommand::Shot {
            ingredient: "c".into(),
            amount_ml: 20.0,
        })
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn failed_maintenance_run_is_an_actuation_error() {
    let rig = maintenance_rig();
    rig.actuator.fail_pump(1);
    let err = rig
        .service
        .handle_command(AppCommand::Clean {
            pump: 1,
            duration_ms: 500,
        })
        .unwrap_err();
    assert!(matches!(err, Error::Actuation { pump: 1, .. }));
}

#[test]
fn zero_length_run_is_rejected() {
    let rig = maintenance_rig();
    assert!(matches!(
        rig.service.handle_command(AppCommand::CalibrationTest {
            pump: 1,
            duration_ms: 0
        }),
        Err(Error::Config(_))
    ));
}

#[test]
fn pump_table_edits_are_validated() {
    let rig = maintenance_rig();
    assert!(matches!(
        rig.service.handle_command(AppCommand::SetFlowRate {
            pump: 1,
            ml_per_sec: 0.0
        }),
        Err(Error::Config(_))
    ));

    let clash = vec![
        PumpConfig::new(1, 17, "a", 2.0),
        PumpConfig::new(2, 17, "b", 2.0),
    ];
    assert!(matches!(
        rig.service.handle_command(AppCommand::ReplacePumps(clash)),
        Err(Error::Config(_))
    ));
    assert_eq!(rig.registry.list_all().len(), 3);

    rig.service
        .handle_command(AppCommand::SetEnabled {
            pump: 3,
            enabled: true,
        })
        .unwrap();
    assert!(rig.registry.get_pump("c").is_some());
}

#[test]
fn pump_table_is_locked_while_a_job_runs() {
    let rig = maintenance_rig();
    rig.actuator.run_for(1, Duration::from_millis(400));
    let service = rig.service.clone();
    let job = std::thread::spawn(move || {
        service.handle_command(AppCommand::Shot {
            ingredient: "a".into(),
            amount_ml: 50.0,
        })
    });
    assert!(wait_until(Duration::from_secs(2), || rig.actuator.active() == 1));
    let before = rig.registry.list_all();

    let edits = [
        AppCommand::SetEnabled {
            pump: 1,
            enabled: false,
        },
        AppCommand::SetFlowRate {
            pump: 1,
            ml_per_sec: 5.0,
        },
        AppCommand::ReplacePumps(vec![PumpConfig::new(1, 17, "z", 10.0)]),
        AppCommand::CompleteCalibration {
            run: CalibrationRun {
                pump: 1,
                duration_ms: 10_000,
            },
            measured_ml: 150.0,
        },
    ];
    for cmd in edits {
        let err = rig.service.handle_command(cmd.clone()).unwrap_err();
        assert!(
            matches!(err, Error::Busy { ref holder } if holder == "dispense"),
            "{cmd:?}: {err:?}"
        );
    }
    assert_eq!(rig.registry.list_all(), before);

    assert!(matches!(
        job.join().unwrap().unwrap(),
        AppResponse::Dispensed(_)
    ));
    rig.service
        .handle_command(AppCommand::SetFlowRate {
            pump: 1,
            ml_per_sec: 5.0,
        })
        .unwrap();
}
