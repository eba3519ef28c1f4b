use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One fastening attempt at one hole: synchronized torque/angle/time triples.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Curve {
    pub torque: Vec<f64>,
    pub angle: Vec<f64>,
    pub time: Vec<f64>,
}

impl Curve {
    pub fn len(&self) -> usize {
        self.torque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torque.is_empty()
    }
}

/// Physical fingerprint of a single fastening curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector {
    /// Maximum torque over the curve (N·m).
    pub peak_torque: f64,
    /// Last angle sample (degrees).
    pub final_angle: f64,
    /// dT/dθ over the linear climb (N·m per degree).
    pub rigidity_slope: f64,
    /// Trapezoidal ∫ T dθ with θ in radians (joules).
    pub total_work: f64,
    /// Minimum smoothed dT/dθ across the curve.
    pub slope_min: f64,
    /// Last time sample minus first (seconds).
    pub duration: f64,
    /// Torque at the snug point (N·m).
    pub snug_torque: f64,
}

/// Metrics tracked by the adaptive layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    PeakTorque,
    RigiditySlope,
    TotalWork,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [
        MetricKind::PeakTorque,
        MetricKind::RigiditySlope,
        MetricKind::TotalWork,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeakTorque => "peak_torque",
            Self::RigiditySlope => "rigidity_slope",
            Self::TotalWork => "total_work",
        }
    }

    pub fn value_of(self, features: &FeatureVector) -> f64 {
        match self {
            Self::PeakTorque => features.peak_torque,
            Self::RigiditySlope => features.rigidity_slope,
            Self::TotalWork => features.total_work,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod codes {
    //! Standardized E-codes and their recommended-action R-codes.

    pub const E_BAD_INPUT: &str = "E_BAD_INPUT";
    pub const E_NEG_SLOPE: &str = "E_NEG_SLOPE";
    pub const E_NO_TORQUE_RISE: &str = "E_NO_TORQUE_RISE";
    pub const E_ZERO_WORK: &str = "E_ZERO_WORK";
    pub const E02_TORQUE_RANGE: &str = "E02";
    pub const E04_RIGIDITY: &str = "E04";
    pub const E08_WORK: &str = "E08";

    pub const R_CHECK_DATA: &str = "R_CHECK_DATA";
    pub const R_CHECK_FIXTURE: &str = "R_CHECK_FIXTURE";
    pub const R_CHECK_SCREW: &str = "R_CHECK_SCREW";
    pub const R_CHECK_SENSOR: &str = "R_CHECK_SENSOR";
    pub const R02_TOOL_SETUP: &str = "R02";
    pub const R04_THREAD: &str = "R04";
    pub const R08_WASHER: &str = "R08";
    pub const R_GENERAL_CHECK: &str = "R_GENERAL_CHECK";

    pub const DRIFT_DETECTED: &str = "DRIFT_DETECTED";

    pub fn r_code_for(e_code: &str) -> &'static str {
        match e_code {
            E_BAD_INPUT => R_CHECK_DATA,
            E_NEG_SLOPE => R_CHECK_FIXTURE,
            E_NO_TORQUE_RISE => R_CHECK_SCREW,
            E_ZERO_WORK => R_CHECK_SENSOR,
            E02_TORQUE_RANGE => R02_TOOL_SETUP,
            E04_RIGIDITY => R04_THREAD,
            E08_WORK => R08_WASHER,
            _ => R_GENERAL_CHECK,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiagStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NG")]
    Ng,
}

impl DiagStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Ng => "NG",
        }
    }

    pub fn is_ng(self) -> bool {
        matches!(self, Self::Ng)
    }
}

impl fmt::Display for DiagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-carrier learning lifecycle for a single hole.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    ColdStart,
    Shadow,
    GoldenLocked,
    DriftDetected,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ColdStart => "cold_start",
            Self::Shadow => "shadow",
            Self::GoldenLocked => "golden_locked",
            Self::DriftDetected => "drift_detected",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrewIssue {
    pub status: DiagStatus,
    pub e_codes: Vec<String>,
    pub r_codes: Vec<String>,
}

impl ScrewIssue {
    pub fn ok() -> Self {
        Self {
            status: DiagStatus::Ok,
            e_codes: Vec::new(),
            r_codes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationParams {
    pub suggested_torque_adjustment_percent: f64,
    pub suggested_speed_adjustment_percent: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationSuggestion {
    pub status: String,
    pub e_code: String,
    pub params: OptimizationParams,
}

impl OptimizationSuggestion {
    pub fn drift(torque_adjust_pct: f64, speed_adjust_pct: i32) -> Self {
        Self {
            status: "OPTIMIZE".to_string(),
            e_code: codes::DRIFT_DETECTED.to_string(),
            params: OptimizationParams {
                suggested_torque_adjustment_percent: torque_adjust_pct,
                suggested_speed_adjustment_percent: speed_adjust_pct,
            },
        }
    }
}

/// Final per-hole diagnosis handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosisResult {
    pub status: DiagStatus,
    /// None when the input curve was rejected before extraction.
    pub features: Option<FeatureVector>,
    pub screw_issue: ScrewIssue,
    /// 0..100, derived from the worst z-score; None when input was rejected.
    pub health_score: Option<f64>,
    pub optimization_suggestion: Option<OptimizationSuggestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToleranceConfig {
    /// Sigma multiplier k for statistical NG; clamped to [0.5, 5.0].
    pub production_tolerance_factor: f64,
    /// Floor applied to golden-base std before division.
    pub std_floor: f64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            production_tolerance_factor: 3.0,
            std_floor: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CodesConfig {
    pub disabled_e_codes: Vec<String>,
    pub disabled_r_codes: Vec<String>,
}

impl CodesConfig {
    pub fn e_code_enabled(&self, code: &str) -> bool {
        !self.disabled_e_codes.iter().any(|c| c == code)
    }

    pub fn r_code_enabled(&self, code: &str) -> bool {
        !self.disabled_r_codes.iter().any(|c| c == code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhysicsConfig {
    /// slope_min below this is a fatal physics violation.
    pub neg_slope_threshold: f64,
    /// Absolute rigidity-slope band (N·m per degree).
    pub slope_min_abs: f64,
    pub slope_max_abs: f64,
    /// Absolute peak-torque band (N·m).
    pub torque_abs_min: f64,
    pub torque_abs_max: f64,
    /// Torque samples above this are treated as transducer overflow.
    pub overflow_threshold: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            neg_slope_threshold: -0.001,
            slope_min_abs: 0.005,
            slope_max_abs: 10.0,
            torque_abs_min: 0.1,
            torque_abs_max: 50.0,
            overflow_threshold: 32_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningConfig {
    /// Observations before cold_start ends.
    pub shadow_threshold: u64,
    /// Observations at which the golden base is locked.
    pub golden_threshold: u64,
    /// Bounded FIFO window size for drift tests.
    pub window_size: usize,
    /// Drift when |window mean − golden mean| exceeds this many golden stds.
    pub drift_mean_factor: f64,
    /// Drift when window std exceeds this multiple of golden std.
    pub drift_std_factor: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            shadow_threshold: 50,
            golden_threshold: 100,
            window_size: 200,
            drift_mean_factor: 1.0,
            drift_std_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoSave {
    /// Persist the carrier model at the end of each diagnosis.
    #[default]
    AfterEachDiagnosis,
    /// Persist only on explicit save calls.
    Explicit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub tolerance: ToleranceConfig,
    pub codes: CodesConfig,
    pub physics: PhysicsConfig,
    pub learning: LearningConfig,
    pub auto_save: AutoSave,
}

impl EngineConfig {
    /// Checks structural invariants and clamps soft fields. Engine
    /// construction aborts on error.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        let finite = [
            self.tolerance.production_tolerance_factor,
            self.tolerance.std_floor,
            self.physics.neg_slope_threshold,
            self.physics.slope_min_abs,
            self.physics.slope_max_abs,
            self.physics.torque_abs_min,
            self.physics.torque_abs_max,
            self.physics.overflow_threshold,
            self.learning.drift_mean_factor,
            self.learning.drift_std_factor,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::NonFinite);
        }
        if self.learning.shadow_threshold == 0 {
            return Err(ConfigError::Invalid(
                "shadow_threshold must be at least 1".to_string(),
            ));
        }
        if self.learning.golden_threshold <= self.learning.shadow_threshold {
            return Err(ConfigError::Invalid(
                "golden_threshold must exceed shadow_threshold".to_string(),
            ));
        }
        if self.learning.window_size < 8 {
            return Err(ConfigError::Invalid(
                "window_size must be at least 8".to_string(),
            ));
        }
        if self.physics.slope_min_abs >= self.physics.slope_max_abs {
            return Err(ConfigError::Invalid(
                "slope_min_abs must be below slope_max_abs".to_string(),
            ));
        }
        if self.physics.torque_abs_min >= self.physics.torque_abs_max {
            return Err(ConfigError::Invalid(
                "torque_abs_min must be below torque_abs_max".to_string(),
            ));
        }
        if self.tolerance.std_floor <= 0.0 {
            return Err(ConfigError::Invalid(
                "std_floor must be positive".to_string(),
            ));
        }
        self.tolerance.production_tolerance_factor =
            self.tolerance.production_tolerance_factor.clamp(0.5, 5.0);
        Ok(self)
    }
}

#[derive(Debug, Error)]
pub enum CurveError {
    #[error("invalid curve: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config contains a non-finite value")]
    NonFinite,
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model persistence failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("model file corrupt for carrier {carrier_id}: {reason}")]
    Corrupt { carrier_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
