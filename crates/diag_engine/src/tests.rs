use std::collections::BTreeMap;
use std::fs;

use core_types::{codes, AutoSave, Curve, DiagStatus, EngineConfig, LifecyclePhase};
use tempfile::TempDir;

use crate::DiagnosticEngine;

const HOLE: &str = "[1]1";
const CARRIER: &str = "CARRIER-01";

fn make_engine(dir: &TempDir, auto_save: AutoSave) -> DiagnosticEngine {
    let _ = observability::init_tracing("diag_engine");
    let cfg = EngineConfig {
        auto_save,
        ..EngineConfig::default()
    };
    DiagnosticEngine::new(cfg, dir.path()).expect("engine")
}

/// Linear torque ramp 0→peak over 100 samples, angle 0→36°, 100 Hz.
fn ramp_curve(peak: f64) -> Curve {
    let n = 100;
    Curve {
        torque: (0..n).map(|i| peak * i as f64 / (n - 1) as f64).collect(),
        angle: (0..n).map(|i| 36.0 * i as f64 / (n - 1) as f64).collect(),
        time: (0..n).map(|i| i as f64 * 0.01).collect(),
    }
}

/// Ramp with a carved-in torque decline: the cam-out signature.
fn neg_slope_curve() -> Curve {
    let mut curve = ramp_curve(5.0);
    for i in 60..80 {
        curve.torque[i] = curve.torque[59] - 0.1 * (i - 59) as f64;
    }
    curve
}

fn payload(curve: Curve) -> BTreeMap<String, Curve> {
    BTreeMap::from([(HOLE.to_string(), curve)])
}

/// Deterministic jitter in [-0.5, 0.5).
fn jitter(seed: &mut u64) -> f64 {
    *seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    ((*seed >> 33) as f64 / u32::MAX as f64) - 0.5
}

fn feed_normal(engine: &DiagnosticEngine, n: usize, center: f64, seed: &mut u64) {
    for i in 0..n {
        let peak = center + jitter(seed) * 0.1;
        engine
            .diagnose_at(CARRIER, &payload(ramp_curve(peak)), i as i64)
            .expect("diagnose");
    }
}

fn hole_status(engine: &DiagnosticEngine) -> crate::HoleStatusReport {
    engine
        .carrier_status(CARRIER)
        .expect("carrier cached")
        .remove(HOLE)
        .expect("hole present")
}

#[test]
fn cold_start_first_curve_is_ok() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::AfterEachDiagnosis);
    let results = engine
        .diagnose_at(CARRIER, &payload(ramp_curve(5.0)), 0)
        .expect("diagnose");

    let result = &results[HOLE];
    assert_eq!(result.status, DiagStatus::Ok);
    assert!(result.optimization_suggestion.is_none());
    assert!(result.features.as_ref().expect("features").peak_torque > 4.9);

    let status = hole_status(&engine);
    assert_eq!(status.phase, LifecyclePhase::ColdStart);
    assert_eq!(status.observation_count, 1);
}

#[test]
fn fifty_normal_curves_reach_shadow() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::Explicit);
    let mut seed = 3;
    feed_normal(&engine, 50, 5.0, &mut seed);

    let status = hole_status(&engine);
    assert_eq!(status.phase, LifecyclePhase::Shadow);
    assert_eq!(status.observation_count, 50);
}

#[test]
fn hundred_normal_curves_lock_golden_base() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::Explicit);
    let mut seed = 5;
    feed_normal(&engine, 100, 5.0, &mut seed);

    let status = hole_status(&engine);
    assert_eq!(status.phase, LifecyclePhase::GoldenLocked);
    let mean = status.golden_mean_torque.expect("golden mean");
    assert!((mean - 5.0).abs() < 0.1, "golden mean {mean}");
}

#[test]
fn statistical_outlier_after_lock_is_ng_with_e02() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::Explicit);
    let mut seed = 7;
    feed_normal(&engine, 100, 5.0, &mut seed);
    let status = hole_status(&engine);
    let outlier = status.golden_mean_torque.expect("mean")
        + 5.0 * status.golden_std_torque.expect("std");

    let results = engine
        .diagnose_at(CARRIER, &payload(ramp_curve(outlier)), 100)
        .expect("diagnose");
    let result = &results[HOLE];
    assert_eq!(result.status, DiagStatus::Ng);
    assert!(result.screw_issue.e_codes.iter().any(|c| c == codes::E02_TORQUE_RANGE));
    assert!(result.screw_issue.r_codes.iter().any(|c| c == codes::R02_TOOL_SETUP));
    assert_eq!(result.health_score, Some(0.0));
}

#[test]
fn negative_slope_is_fatal_and_never_observed() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::AfterEachDiagnosis);
    let mut seed = 11;
    feed_normal(&engine, 5, 5.0, &mut seed);
    assert_eq!(hole_status(&engine).observation_count, 5);

    let results = engine
        .diagnose_at(CARRIER, &payload(neg_slope_curve()), 5)
        .expect("diagnose");
    let result = &results[HOLE];
    assert_eq!(result.status, DiagStatus::Ng);
    assert!(result.screw_issue.e_codes.iter().any(|c| c == codes::E_NEG_SLOPE));
    assert!(result.screw_issue.r_codes.iter().any(|c| c == codes::R_CHECK_FIXTURE));
    // Contaminated data must not leak into the statistics.
    assert_eq!(hole_status(&engine).observation_count, 5);
}

#[test]
fn sustained_torque_shift_is_flagged_as_drift() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::Explicit);
    let mut seed = 13;
    feed_normal(&engine, 100, 5.0, &mut seed);
    let status = hole_status(&engine);
    let golden_mean = status.golden_mean_torque.expect("mean");
    let golden_std = status.golden_std_torque.expect("std");
    let shifted = golden_mean + 1.2 * golden_std;

    let window = engine.config().learning.window_size;
    let mut drift_result = None;
    for i in 0..window {
        feed_normal(&engine, 1, shifted, &mut seed);
        if hole_status(&engine).phase == LifecyclePhase::DriftDetected {
            let results = engine
                .diagnose_at(CARRIER, &payload(ramp_curve(shifted)), (200 + i) as i64)
                .expect("diagnose");
            drift_result = Some(results[HOLE].clone());
            break;
        }
    }

    let result = drift_result.expect("drift within one window of observations");
    assert!(hole_status(&engine).drift_event_count >= 1);
    let suggestion = result.optimization_suggestion.expect("suggestion in drift");
    assert_eq!(suggestion.e_code, codes::DRIFT_DETECTED);
    assert!(
        suggestion.params.suggested_torque_adjustment_percent < 0.0,
        "recentering must push the target torque back down"
    );
}

#[test]
fn bad_input_is_isolated_within_the_batch() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::AfterEachDiagnosis);
    let mut broken = ramp_curve(5.0);
    broken.angle.pop();
    let holes = BTreeMap::from([
        ("[1]1".to_string(), broken),
        ("[1]2".to_string(), ramp_curve(5.0)),
    ]);

    let results = engine.diagnose_at(CARRIER, &holes, 0).expect("diagnose");
    assert_eq!(results.len(), 2);

    let bad = &results["[1]1"];
    assert_eq!(bad.status, DiagStatus::Ng);
    assert!(bad.features.is_none());
    assert_eq!(bad.screw_issue.e_codes, vec![codes::E_BAD_INPUT]);
    assert_eq!(bad.screw_issue.r_codes, vec![codes::R_CHECK_DATA]);

    let good = &results["[1]2"];
    assert_eq!(good.status, DiagStatus::Ok);
}

#[test]
fn model_survives_process_restart() {
    let dir = TempDir::new().expect("tempdir");
    let mut seed = 17;
    {
        let engine = make_engine(&dir, AutoSave::AfterEachDiagnosis);
        feed_normal(&engine, 50, 5.0, &mut seed);
        assert_eq!(hole_status(&engine).phase, LifecyclePhase::Shadow);
    }

    let engine = make_engine(&dir, AutoSave::AfterEachDiagnosis);
    feed_normal(&engine, 1, 5.0, &mut seed);
    let status = hole_status(&engine);
    assert_eq!(status.observation_count, 51);
    assert_eq!(status.phase, LifecyclePhase::Shadow);
}

#[test]
fn corrupt_model_file_restarts_cold() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join(format!("{CARRIER}.json")), b"{ garbage").expect("write");

    let engine = make_engine(&dir, AutoSave::AfterEachDiagnosis);
    let results = engine
        .diagnose_at(CARRIER, &payload(ramp_curve(5.0)), 0)
        .expect("diagnose despite corrupt history");
    assert_eq!(results[HOLE].status, DiagStatus::Ok);
    assert_eq!(hole_status(&engine).observation_count, 1);
}

#[test]
fn auto_save_failure_still_returns_results() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::AfterEachDiagnosis);
    // Block the temp path so the very first save cannot stage its payload.
    fs::create_dir(dir.path().join(format!("{CARRIER}.json.tmp"))).expect("block tmp");

    let err = engine
        .diagnose_at(CARRIER, &payload(ramp_curve(5.0)), 0)
        .expect_err("save must fail");
    assert_eq!(err.carrier_id, CARRIER);
    assert_eq!(err.results.len(), 1);
    assert_eq!(err.results[HOLE].status, DiagStatus::Ok);

    // In-memory state is not rolled back.
    assert_eq!(hole_status(&engine).observation_count, 1);
}

#[test]
fn explicit_save_policy_defers_to_caller() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::Explicit);
    engine
        .diagnose_at(CARRIER, &payload(ramp_curve(5.0)), 0)
        .expect("diagnose");
    let model_path = dir.path().join(format!("{CARRIER}.json"));
    assert!(!model_path.exists());

    engine.save_carrier(CARRIER).expect("save");
    assert!(model_path.exists());
}

#[test]
fn replayed_batches_are_deterministic() {
    let dir_a = TempDir::new().expect("tempdir");
    let dir_b = TempDir::new().expect("tempdir");
    let engine_a = make_engine(&dir_a, AutoSave::Explicit);
    let engine_b = make_engine(&dir_b, AutoSave::Explicit);

    let mut seed_a = 23;
    let mut seed_b = 23;
    for i in 0..60 {
        let peak_a = 5.0 + jitter(&mut seed_a) * 0.1;
        let peak_b = 5.0 + jitter(&mut seed_b) * 0.1;
        let ra = engine_a
            .diagnose_at(CARRIER, &payload(ramp_curve(peak_a)), i)
            .expect("diagnose");
        let rb = engine_b
            .diagnose_at(CARRIER, &payload(ramp_curve(peak_b)), i)
            .expect("diagnose");
        assert_eq!(ra, rb);
    }
    assert_eq!(
        engine_a.carrier_status(CARRIER),
        engine_b.carrier_status(CARRIER)
    );
}

#[test]
fn save_all_covers_every_cached_carrier() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::Explicit);
    engine
        .diagnose_at("CARRIER-01", &payload(ramp_curve(5.0)), 0)
        .expect("diagnose");
    engine
        .diagnose_at("CARRIER-02", &payload(ramp_curve(5.0)), 0)
        .expect("diagnose");

    engine.save_all().expect("save_all");
    assert!(dir.path().join("CARRIER-01.json").exists());
    assert!(dir.path().join("CARRIER-02.json").exists());

    engine.evict_carrier("CARRIER-02");
    assert!(engine.carrier_status("CARRIER-02").is_none());
    assert!(engine.carrier_status("CARRIER-01").is_some());
}

#[test]
fn reset_hole_forgets_learning_state() {
    let dir = TempDir::new().expect("tempdir");
    let engine = make_engine(&dir, AutoSave::Explicit);
    let mut seed = 29;
    feed_normal(&engine, 20, 5.0, &mut seed);
    assert!(engine.reset_hole(CARRIER, HOLE));

    feed_normal(&engine, 1, 5.0, &mut seed);
    assert_eq!(hole_status(&engine).observation_count, 1);
}
