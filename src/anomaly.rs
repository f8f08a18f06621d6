//! Temperature-anomaly decision, kept pure so it is trivially testable.
//!
//! Known limitation, inherited deliberately: there is no cross-run "already
//! alerted" suppression. While an anomaly persists, every evaluation pass
//! fires again; the only dedup is per-run per-location in the fan-out.

/// Used when no historical years could be fetched at all. Roughly a summer
/// daily high for the fallback location; callers must log when this stands
/// in for real data.
pub const FALLBACK_AVERAGE_F: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub average_f: f64,
    pub is_anomalous: bool,
    /// True when `average_f` is `FALLBACK_AVERAGE_F` rather than a real mean.
    pub used_fallback: bool,
}

/// Compare today's forecast high against the historical mean. The boundary
/// is inclusive: exactly `average + threshold` counts as anomalous.
pub fn evaluate(current_f: f64, historical_f: &[f64], threshold_f: f64) -> Evaluation {
    let (average_f, used_fallback) = if historical_f.is_empty() {
        (FALLBACK_AVERAGE_F, true)
    } else {
        let sum: f64 = historical_f.iter().sum();
        (sum / historical_f.len() as f64, false)
    };

    Evaluation {
        average_f,
        is_anomalous: current_f >= average_f + threshold_f,
        used_fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn average_is_exact_mean() {
        let eval = evaluate(0.0, &[90.0, 92.0, 88.0], 1.0);
        assert!((eval.average_f - 90.0).abs() < EPS);
        assert!(!eval.used_fallback);

        let eval = evaluate(0.0, &[71.3], 1.0);
        assert!((eval.average_f - 71.3).abs() < EPS);
    }

    #[test]
    fn boundary_is_inclusive() {
        // current == average + threshold -> anomalous
        let eval = evaluate(91.0, &[90.0, 92.0, 88.0], 1.0);
        assert!(eval.is_anomalous);

        let eval = evaluate(90.999, &[90.0, 92.0, 88.0], 1.0);
        assert!(!eval.is_anomalous);
    }

    #[test]
    fn empty_history_uses_fallback_and_still_decides() {
        let eval = evaluate(100.0, &[], 10.0);
        assert!(eval.used_fallback);
        assert!((eval.average_f - FALLBACK_AVERAGE_F).abs() < EPS);
        assert!(eval.is_anomalous); // 100 >= 85 + 10

        let eval = evaluate(80.0, &[], 10.0);
        assert!(eval.used_fallback);
        assert!(!eval.is_anomalous);
    }

    #[test]
    fn hot_day_scenario_triggers() {
        let eval = evaluate(104.0, &[90.0, 92.0, 88.0], 1.0);
        assert!((eval.average_f - 90.0).abs() < EPS);
        assert!(eval.is_anomalous);
    }

    #[test]
    fn mild_day_with_wide_threshold_does_not_trigger() {
        let eval = evaluate(90.0, &[90.0, 92.0, 88.0], 10.0);
        assert!((eval.average_f - 90.0).abs() < EPS);
        assert!(!eval.is_anomalous); // 90 >= 100 is false
    }
}
