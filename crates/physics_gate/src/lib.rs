use core_types::{codes, CodesConfig, FeatureVector, PhysicsConfig};
use serde::{Deserialize, Serialize};

/// Outcome of the hard physics rules for one curve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateReport {
    pub pass: bool,
    /// A fatal violation means the physical process itself failed; the
    /// observation must not enter the statistical accumulators.
    pub fatal: bool,
    pub e_codes: Vec<String>,
    pub r_codes: Vec<String>,
}

impl GateReport {
    fn clean() -> Self {
        Self {
            pass: true,
            fatal: false,
            e_codes: Vec::new(),
            r_codes: Vec::new(),
        }
    }
}

/// Applies the fastening-standard hard constraints in fixed order. Every
/// violated rule is reported; nothing short-circuits. Disabled E-codes are
/// omitted and neither fail the gate nor mark it fatal.
pub fn evaluate(
    features: &FeatureVector,
    physics: &PhysicsConfig,
    codes_cfg: &CodesConfig,
) -> GateReport {
    let mut report = GateReport::clean();

    let fire = |report: &mut GateReport, e_code: &str, fatal: bool| {
        if !codes_cfg.e_code_enabled(e_code) {
            return;
        }
        report.pass = false;
        report.fatal |= fatal;
        report.e_codes.push(e_code.to_string());
        let r_code = codes::r_code_for(e_code);
        if codes_cfg.r_code_enabled(r_code) {
            report.r_codes.push(r_code.to_string());
        }
    };

    if features.slope_min < physics.neg_slope_threshold {
        fire(&mut report, codes::E_NEG_SLOPE, true);
    }
    if features.peak_torque <= features.snug_torque {
        fire(&mut report, codes::E_NO_TORQUE_RISE, true);
    }
    if features.total_work <= 0.0 {
        fire(&mut report, codes::E_ZERO_WORK, true);
    }
    if features.rigidity_slope < physics.slope_min_abs
        || features.rigidity_slope > physics.slope_max_abs
    {
        fire(&mut report, codes::E04_RIGIDITY, false);
    }
    if features.peak_torque < physics.torque_abs_min
        || features.peak_torque > physics.torque_abs_max
    {
        fire(&mut report, codes::E02_TORQUE_RANGE, false);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> FeatureVector {
        FeatureVector {
            peak_torque: 5.0,
            final_angle: 36.0,
            rigidity_slope: 0.14,
            total_work: 1.5,
            slope_min: 0.10,
            duration: 1.0,
            snug_torque: 1.0,
        }
    }

    #[test]
    fn nominal_curve_passes() {
        let report = evaluate(&nominal(), &PhysicsConfig::default(), &CodesConfig::default());
        assert!(report.pass);
        assert!(!report.fatal);
        assert!(report.e_codes.is_empty());
    }

    #[test]
    fn negative_slope_is_fatal() {
        let features = FeatureVector {
            slope_min: -0.5,
            ..nominal()
        };
        let report = evaluate(&features, &PhysicsConfig::default(), &CodesConfig::default());
        assert!(!report.pass);
        assert!(report.fatal);
        assert_eq!(report.e_codes, vec![codes::E_NEG_SLOPE]);
        assert_eq!(report.r_codes, vec![codes::R_CHECK_FIXTURE]);
    }

    #[test]
    fn all_violations_are_reported_together() {
        let features = FeatureVector {
            peak_torque: 0.05,
            snug_torque: 0.06,
            total_work: 0.0,
            rigidity_slope: 0.001,
            slope_min: -1.0,
            ..nominal()
        };
        let report = evaluate(&features, &PhysicsConfig::default(), &CodesConfig::default());
        assert_eq!(
            report.e_codes,
            vec![
                codes::E_NEG_SLOPE,
                codes::E_NO_TORQUE_RISE,
                codes::E_ZERO_WORK,
                codes::E04_RIGIDITY,
                codes::E02_TORQUE_RANGE,
            ]
        );
    }

    #[test]
    fn band_violations_are_not_fatal() {
        let features = FeatureVector {
            peak_torque: 60.0,
            ..nominal()
        };
        let report = evaluate(&features, &PhysicsConfig::default(), &CodesConfig::default());
        assert!(!report.pass);
        assert!(!report.fatal);
        assert_eq!(report.e_codes, vec![codes::E02_TORQUE_RANGE]);
    }

    #[test]
    fn disabled_e_code_suppresses_failure_and_fatality() {
        let features = FeatureVector {
            slope_min: -0.5,
            ..nominal()
        };
        let codes_cfg = CodesConfig {
            disabled_e_codes: vec![codes::E_NEG_SLOPE.to_string()],
            disabled_r_codes: Vec::new(),
        };
        let report = evaluate(&features, &PhysicsConfig::default(), &codes_cfg);
        assert!(report.pass);
        assert!(!report.fatal);
        assert!(report.e_codes.is_empty());
    }

    #[test]
    fn disabled_r_code_is_omitted_but_keeps_ng() {
        let features = FeatureVector {
            peak_torque: 60.0,
            ..nominal()
        };
        let codes_cfg = CodesConfig {
            disabled_e_codes: Vec::new(),
            disabled_r_codes: vec![codes::R02_TOOL_SETUP.to_string()],
        };
        let report = evaluate(&features, &PhysicsConfig::default(), &codes_cfg);
        assert!(!report.pass);
        assert_eq!(report.e_codes, vec![codes::E02_TORQUE_RANGE]);
        assert!(report.r_codes.is_empty());
    }

    #[test]
    fn evaluation_is_idempotent() {
        let features = FeatureVector {
            peak_torque: 60.0,
            slope_min: -1.0,
            ..nominal()
        };
        let a = evaluate(&features, &PhysicsConfig::default(), &CodesConfig::default());
        let b = evaluate(&features, &PhysicsConfig::default(), &CodesConfig::default());
        assert_eq!(a, b);
    }
}
