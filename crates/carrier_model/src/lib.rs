use std::collections::BTreeMap;

use core_types::{
    codes, CodesConfig, DiagStatus, FeatureVector, LearningConfig, LifecyclePhase, MetricKind,
    OptimizationSuggestion, ToleranceConfig,
};
use rolling_stats::{StatAccumulator, WindowSummary};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Frozen mean/std reference for one metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricBase {
    pub mean: f64,
    pub std: f64,
}

/// Reference distribution snapshotted when the golden threshold is reached.
/// Immutable afterwards unless explicitly reset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GoldenBase {
    pub peak_torque: MetricBase,
    pub rigidity_slope: MetricBase,
    pub total_work: MetricBase,
}

impl GoldenBase {
    pub fn metric(&self, kind: MetricKind) -> MetricBase {
        match kind {
            MetricKind::PeakTorque => self.peak_torque,
            MetricKind::RigiditySlope => self.rigidity_slope,
            MetricKind::TotalWork => self.total_work,
        }
    }
}

/// One accumulator per tracked metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSet {
    pub peak_torque: StatAccumulator,
    pub rigidity_slope: StatAccumulator,
    pub total_work: StatAccumulator,
}

impl MetricSet {
    fn new(window: usize) -> Self {
        Self {
            peak_torque: StatAccumulator::new(window),
            rigidity_slope: StatAccumulator::new(window),
            total_work: StatAccumulator::new(window),
        }
    }

    pub fn get(&self, kind: MetricKind) -> &StatAccumulator {
        match kind {
            MetricKind::PeakTorque => &self.peak_torque,
            MetricKind::RigiditySlope => &self.rigidity_slope,
            MetricKind::TotalWork => &self.total_work,
        }
    }

    fn observe(&mut self, features: &FeatureVector) {
        self.peak_torque.observe(features.peak_torque);
        self.rigidity_slope.observe(features.rigidity_slope);
        self.total_work.observe(features.total_work);
    }

    fn restore_capacity(&mut self, window: usize) {
        self.peak_torque.restore_capacity(window);
        self.rigidity_slope.restore_capacity(window);
        self.total_work.restore_capacity(window);
    }

    fn snapshot_base(&self, std_floor: f64) -> GoldenBase {
        let base = |acc: &StatAccumulator| MetricBase {
            mean: acc.mean,
            std: acc.std().max(std_floor),
        };
        GoldenBase {
            peak_torque: base(&self.peak_torque),
            rigidity_slope: base(&self.rigidity_slope),
            total_work: base(&self.total_work),
        }
    }
}

/// What the adaptive layer concluded for one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveReport {
    pub status: DiagStatus,
    pub phase: LifecyclePhase,
    pub e_codes: Vec<String>,
    pub r_codes: Vec<String>,
    pub health_score: f64,
    pub suggestion: Option<OptimizationSuggestion>,
}

/// Learning state for a single hole of a carrier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoleState {
    pub phase: LifecyclePhase,
    pub drift_event_count: u64,
    pub metrics: MetricSet,
    pub golden_base: Option<GoldenBase>,
    pub last_update_ts_ms: i64,
    #[serde(default)]
    pub drift_pass_streak: u8,
}

/// Consecutive clean drift tests required to leave drift_detected.
const RECOVERY_STREAK: u8 = 2;

impl HoleState {
    pub fn new(window: usize) -> Self {
        Self {
            phase: LifecyclePhase::ColdStart,
            drift_event_count: 0,
            metrics: MetricSet::new(window),
            golden_base: None,
            last_update_ts_ms: 0,
            drift_pass_streak: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.metrics.peak_torque.count
    }

    /// Observes one feature vector and classifies it. Lifecycle transitions
    /// are stepped first so the count already reflects this observation.
    pub fn observe_and_classify(
        &mut self,
        hole_id: &str,
        features: &FeatureVector,
        tolerance: &ToleranceConfig,
        learning: &LearningConfig,
        codes_cfg: &CodesConfig,
        now_ms: i64,
    ) -> AdaptiveReport {
        self.metrics.observe(features);
        self.step_lifecycle(hole_id, tolerance, learning);
        self.run_drift_test(hole_id, tolerance, learning);

        let (status, e_codes, r_codes, health_score) = self.classify(features, tolerance, codes_cfg);
        // The observation that declares drift ends in drift_detected, so a
        // suggestion rides along from the onset observation onward.
        let suggestion = if self.phase == LifecyclePhase::DriftDetected {
            Some(self.build_suggestion(tolerance))
        } else {
            None
        };
        self.last_update_ts_ms = now_ms;

        AdaptiveReport {
            status,
            phase: self.phase,
            e_codes,
            r_codes,
            health_score,
            suggestion,
        }
    }

    fn step_lifecycle(
        &mut self,
        hole_id: &str,
        tolerance: &ToleranceConfig,
        learning: &LearningConfig,
    ) {
        let count = self.count();
        if self.phase == LifecyclePhase::ColdStart && count >= learning.shadow_threshold {
            self.phase = LifecyclePhase::Shadow;
        }
        if self.phase == LifecyclePhase::Shadow && count >= learning.golden_threshold {
            self.golden_base = Some(self.metrics.snapshot_base(tolerance.std_floor));
            self.phase = LifecyclePhase::GoldenLocked;
            info!(
                hole_id,
                samples = count,
                mean_torque = self.metrics.peak_torque.mean,
                "golden base locked"
            );
        }
    }

    /// Runs the drift test when the phase and window allow it.
    fn run_drift_test(
        &mut self,
        hole_id: &str,
        tolerance: &ToleranceConfig,
        learning: &LearningConfig,
    ) {
        if !matches!(
            self.phase,
            LifecyclePhase::GoldenLocked | LifecyclePhase::DriftDetected
        ) {
            return;
        }
        let Some(drifted) = self.window_drifted(tolerance, learning) else {
            return;
        };
        match (self.phase, drifted) {
            (LifecyclePhase::GoldenLocked, true) => {
                self.phase = LifecyclePhase::DriftDetected;
                self.drift_event_count += 1;
                self.drift_pass_streak = 0;
                warn!(
                    hole_id,
                    drift_events = self.drift_event_count,
                    "concept drift detected against golden base"
                );
            }
            (LifecyclePhase::DriftDetected, false) => {
                self.drift_pass_streak += 1;
                if self.drift_pass_streak >= RECOVERY_STREAK {
                    self.phase = LifecyclePhase::GoldenLocked;
                    self.drift_pass_streak = 0;
                    info!(hole_id, "drift recovered, golden base re-engaged");
                }
            }
            (LifecyclePhase::DriftDetected, true) => {
                self.drift_pass_streak = 0;
            }
            _ => {}
        }
    }

    /// Window statistics vs golden base. None when the window is not yet
    /// two-thirds full on every metric.
    fn window_drifted(
        &self,
        tolerance: &ToleranceConfig,
        learning: &LearningConfig,
    ) -> Option<bool> {
        let base = self.golden_base.as_ref()?;
        let summaries: [(WindowSummary, MetricBase); 3] = [
            (self.metrics.peak_torque.window_summary(), base.peak_torque),
            (
                self.metrics.rigidity_slope.window_summary(),
                base.rigidity_slope,
            ),
            (self.metrics.total_work.window_summary(), base.total_work),
        ];
        if !summaries
            .iter()
            .all(|(w, _)| w.len * 3 >= learning.window_size * 2)
        {
            return None;
        }
        let drifted = summaries.iter().any(|(w, g)| {
            let g_std = g.std.max(tolerance.std_floor);
            (w.mean - g.mean).abs() > learning.drift_mean_factor * g_std
                || w.std > learning.drift_std_factor * g_std
        });
        Some(drifted)
    }

    fn classify(
        &self,
        features: &FeatureVector,
        tolerance: &ToleranceConfig,
        codes_cfg: &CodesConfig,
    ) -> (DiagStatus, Vec<String>, Vec<String>, f64) {
        let base = match (self.phase, self.golden_base.as_ref()) {
            (LifecyclePhase::GoldenLocked | LifecyclePhase::DriftDetected, Some(base)) => base,
            // Insufficient history: the statistical layer never rejects.
            _ => return (DiagStatus::Ok, Vec::new(), Vec::new(), 100.0),
        };

        let k = tolerance.production_tolerance_factor;
        let mut e_codes = Vec::new();
        let mut r_codes = Vec::new();
        let mut max_z = 0.0f64;
        for kind in MetricKind::ALL {
            let g = base.metric(kind);
            let z = (kind.value_of(features) - g.mean) / g.std.max(tolerance.std_floor);
            max_z = max_z.max(z.abs());
            if z.abs() > k {
                let e_code = match kind {
                    MetricKind::PeakTorque => codes::E02_TORQUE_RANGE,
                    MetricKind::RigiditySlope => codes::E04_RIGIDITY,
                    MetricKind::TotalWork => codes::E08_WORK,
                };
                if !codes_cfg.e_code_enabled(e_code) {
                    continue;
                }
                e_codes.push(e_code.to_string());
                let r_code = codes::r_code_for(e_code);
                if codes_cfg.r_code_enabled(r_code) {
                    r_codes.push(r_code.to_string());
                }
            }
        }

        if e_codes.is_empty() {
            let health = (100.0 * (1.0 - max_z / k)).max(0.0);
            (DiagStatus::Ok, e_codes, r_codes, health)
        } else {
            (DiagStatus::Ng, e_codes, r_codes, 0.0)
        }
    }

    /// Recentering recommendation from the torque window vs golden base.
    fn build_suggestion(&self, tolerance: &ToleranceConfig) -> OptimizationSuggestion {
        let Some(base) = self.golden_base.as_ref() else {
            return OptimizationSuggestion::drift(0.0, 0);
        };
        let w = self.metrics.peak_torque.window_summary();
        let g = base.peak_torque;

        let torque_adjust = if g.mean.abs() < tolerance.std_floor {
            0.0
        } else {
            let raw = -100.0 * (w.mean - g.mean) / g.mean;
            ((raw * 10.0).round() / 10.0).clamp(-15.0, 15.0)
        };
        let speed_adjust = if w.std / g.std.max(tolerance.std_floor) > 1.5 {
            -10
        } else {
            0
        };
        OptimizationSuggestion::drift(torque_adjust, speed_adjust)
    }

    /// Administrative: drops the golden base and rewinds the phase to what
    /// the sample count implies, never past shadow.
    pub fn reset_golden(&mut self, learning: &LearningConfig) {
        self.golden_base = None;
        self.drift_pass_streak = 0;
        self.phase = if self.count() >= learning.shadow_threshold {
            LifecyclePhase::Shadow
        } else {
            LifecyclePhase::ColdStart
        };
    }
}

/// Aggregate learning state for all holes of one carrier. BTreeMap keeps
/// iteration and persistence order deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CarrierModel {
    pub carrier_id: String,
    pub holes: BTreeMap<String, HoleState>,
}

impl CarrierModel {
    pub fn new(carrier_id: impl Into<String>) -> Self {
        Self {
            carrier_id: carrier_id.into(),
            holes: BTreeMap::new(),
        }
    }

    pub fn hole_mut(&mut self, hole_id: &str, window: usize) -> &mut HoleState {
        self.holes
            .entry(hole_id.to_string())
            .or_insert_with(|| HoleState::new(window))
    }

    /// Re-applies the configured window capacity after deserialization.
    pub fn restore_window_capacity(&mut self, window: usize) {
        for hole in self.holes.values_mut() {
            hole.metrics.restore_capacity(window);
        }
    }

    pub fn reset_hole(&mut self, hole_id: &str) -> bool {
        self.holes.remove(hole_id).is_some()
    }
}
