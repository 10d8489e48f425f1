//! Diff significance decision.
//!
//! Pure logic with no side effects: `significant = percentage_diff >= threshold`,
//! inclusive at the boundary. The threshold is the project's configured value
//! when present, otherwise [`DEFAULT_THRESHOLD_PERCENT`].

/// System default threshold, in percent of changed pixels.
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 0.1;

/// Threshold actually used for a decision.
pub fn effective_threshold(threshold_override: Option<f64>) -> f64 {
    match threshold_override {
        Some(t) if t.is_finite() && t >= 0.0 => t,
        _ => DEFAULT_THRESHOLD_PERCENT,
    }
}

/// Decide whether a diff warrants review/notification.
///
/// A NaN percentage is never significant.
pub fn evaluate(percentage_diff: f64, threshold_override: Option<f64>) -> bool {
    percentage_diff >= effective_threshold(threshold_override)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn boundary_is_inclusive() {
        assert!(evaluate(5.0, Some(5.0)));
        assert!(!evaluate(4.9, Some(5.0)));
        assert!(evaluate(5.1, Some(5.0)));
    }

    #[test]
    fn default_threshold_applies_when_unset() {
        assert!(evaluate(0.1, None));
        assert!(!evaluate(0.09, None));
    }

    #[test]
    fn invalid_overrides_fall_back_to_default() {
        assert_eq!(effective_threshold(Some(f64::NAN)), DEFAULT_THRESHOLD_PERCENT);
        assert_eq!(effective_threshold(Some(-1.0)), DEFAULT_THRESHOLD_PERCENT);
        assert!(!evaluate(f64::NAN, Some(0.0)));
    }

    proptest! {
        #[test]
        fn decision_matches_comparison(pct in 0.0f64..100.0, threshold in 0.0f64..100.0) {
            prop_assert_eq!(evaluate(pct, Some(threshold)), pct >= threshold);
        }

        #[test]
        fn decision_is_monotonic(a in 0.0f64..100.0, b in 0.0f64..100.0, threshold in 0.0f64..100.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            if evaluate(lo, Some(threshold)) {
                prop_assert!(evaluate(hi, Some(threshold)));
            }
        }
    }
}
