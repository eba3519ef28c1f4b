use core_types::{Curve, CurveError, FeatureVector, PhysicsConfig};

/// Minimum number of samples a curve must carry.
pub const MIN_SAMPLES: usize = 10;

/// Fraction of peak torque that marks the snug point.
const SNUG_FRACTION: f64 = 0.20;
/// Upper end of the linear-climb regression window.
const CLIMB_FRACTION: f64 = 0.80;
/// Half-width of the smoothed difference used for slope_min.
const SLOPE_HALF_WIDTH: usize = 3;
/// Angle spans below this many degrees are treated as degenerate.
const ANGLE_EPS: f64 = 1e-6;

/// Derives the physical fingerprint of one fastening curve.
///
/// Pure function of the input; rejects malformed curves instead of guessing.
pub fn extract(curve: &Curve, physics: &PhysicsConfig) -> Result<FeatureVector, CurveError> {
    validate(curve)?;
    let torque = repair_overflow(&curve.torque, physics.overflow_threshold)?;
    let angle = &curve.angle;

    let peak_torque = torque.iter().copied().fold(f64::MIN, f64::max);
    let snug_idx = snug_index(&torque, peak_torque);

    Ok(FeatureVector {
        peak_torque,
        final_angle: *angle.last().unwrap_or(&0.0),
        rigidity_slope: rigidity_slope(&torque, angle, peak_torque, snug_idx),
        total_work: trapezoid_work(&torque, angle),
        slope_min: smoothed_min_slope(&torque, angle),
        duration: curve.time.last().unwrap_or(&0.0) - curve.time.first().unwrap_or(&0.0),
        snug_torque: torque[snug_idx],
    })
}

fn validate(curve: &Curve) -> Result<(), CurveError> {
    let n = curve.torque.len();
    if curve.angle.len() != n || curve.time.len() != n {
        return Err(CurveError::Invalid(format!(
            "length mismatch: torque={} angle={} time={}",
            n,
            curve.angle.len(),
            curve.time.len()
        )));
    }
    if n < MIN_SAMPLES {
        return Err(CurveError::Invalid(format!(
            "too few samples: {n} < {MIN_SAMPLES}"
        )));
    }
    let finite = |s: &[f64]| s.iter().all(|v| v.is_finite());
    if !finite(&curve.torque) || !finite(&curve.angle) || !finite(&curve.time) {
        return Err(CurveError::Invalid("non-finite sample".to_string()));
    }
    Ok(())
}

/// Replaces transducer overflow spikes (and negative readings) by linear
/// interpolation between the nearest valid neighbors. Leading/trailing runs
/// extend the nearest valid value.
fn repair_overflow(torque: &[f64], overflow_threshold: f64) -> Result<Vec<f64>, CurveError> {
    let valid = |v: f64| v >= 0.0 && v <= overflow_threshold;
    if torque.iter().all(|v| valid(*v)) {
        return Ok(torque.to_vec());
    }
    let valid_idx = torque
        .iter()
        .enumerate()
        .filter(|(_, v)| valid(**v))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    if valid_idx.len() < 2 {
        return Err(CurveError::Invalid(
            "torque signal almost entirely overflowed".to_string(),
        ));
    }

    let mut out = torque.to_vec();
    for i in 0..out.len() {
        if valid(out[i]) {
            continue;
        }
        let prev = valid_idx.iter().rev().find(|&&j| j < i).copied();
        let next = valid_idx.iter().find(|&&j| j > i).copied();
        out[i] = match (prev, next) {
            (Some(a), Some(b)) => {
                let frac = (i - a) as f64 / (b - a) as f64;
                torque[a] + (torque[b] - torque[a]) * frac
            }
            (Some(a), None) => torque[a],
            (None, Some(b)) => torque[b],
            (None, None) => unreachable!("valid_idx has at least two entries"),
        };
    }
    Ok(out)
}

/// First index where torque rises past the snug fraction of peak with a
/// positive forward difference. Index 0 when no sample qualifies.
fn snug_index(torque: &[f64], peak: f64) -> usize {
    let threshold = peak * SNUG_FRACTION;
    for i in 0..torque.len().saturating_sub(1) {
        if torque[i] > threshold && torque[i + 1] > torque[i] {
            return i;
        }
    }
    0
}

fn rigidity_slope(torque: &[f64], angle: &[f64], peak: f64, snug_idx: usize) -> f64 {
    let climb_target = peak * CLIMB_FRACTION;
    let end = (snug_idx..torque.len())
        .find(|&i| torque[i] >= climb_target)
        .unwrap_or(torque.len() - 1);
    let window = snug_idx..=end.max(snug_idx);
    let xs = &angle[window.clone()];
    let ys = &torque[window];
    if xs.len() >= 5 {
        return ols_slope(xs, ys);
    }
    // Too few points for a regression; fall back to the endpoint slope.
    let span = angle[end] - angle[snug_idx];
    if span.abs() < ANGLE_EPS {
        0.0
    } else {
        (torque[end] - torque[snug_idx]) / span
    }
}

/// Ordinary least-squares slope of y on x; 0.0 for a degenerate x spread.
fn ols_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        num += (xi - mean_x) * (yi - mean_y);
        den += (xi - mean_x) * (xi - mean_x);
    }
    if den < ANGLE_EPS {
        0.0
    } else {
        num / den
    }
}

/// Minimum of the smoothed central differences
/// `(T[i+k] − T[i−k]) / (θ[i+k] − θ[i−k])` with k = 3. Indices whose angle
/// span is degenerate are skipped; 0.0 when none qualify.
fn smoothed_min_slope(torque: &[f64], angle: &[f64]) -> f64 {
    let k = SLOPE_HALF_WIDTH;
    let n = torque.len();
    let mut min: Option<f64> = None;
    for i in k..n.saturating_sub(k) {
        let span = angle[i + k] - angle[i - k];
        if span < ANGLE_EPS {
            continue;
        }
        let slope = (torque[i + k] - torque[i - k]) / span;
        min = Some(match min {
            Some(m) => m.min(slope),
            None => slope,
        });
    }
    min.unwrap_or(0.0)
}

/// Trapezoidal ∫ T dθ with θ in radians. Backward angle steps are clamped to
/// the running maximum so sensor jitter cannot contribute negative area.
fn trapezoid_work(torque: &[f64], angle: &[f64]) -> f64 {
    let mut work = 0.0;
    let mut prev_angle = angle[0];
    let mut prev_rad = prev_angle.to_radians();
    for i in 1..torque.len() {
        let a = angle[i].max(prev_angle);
        let rad = a.to_radians();
        work += 0.5 * (torque[i] + torque[i - 1]) * (rad - prev_rad);
        prev_angle = a;
        prev_rad = rad;
    }
    work
}
