//! Confidence heuristic
//!
//! Higher means the model moved further away from the schema defaults; the
//! score is damped by the share of values that had to be clipped.

use crate::schema::Params;
use crate::validate::ClipReport;
use serde_json::Value;

/// Per-key difference assigned to a flipped boolean
pub const BOOL_CHANGE_WEIGHT: f64 = 0.3;

/// Upper bound of the clip penalty
pub const MAX_CLIP_PENALTY: f64 = 0.5;

/// Score validated output against defaults. Always in `[0, 1]`.
pub fn confidence_score(validated: &Params, defaults: &Params, clipped: &ClipReport) -> f64 {
    let diffs: Vec<f64> = validated
        .iter()
        .filter_map(|(key, value)| key_difference(value, defaults.get(key)?))
        .collect();

    let base = if diffs.is_empty() {
        0.0
    } else {
        diffs.iter().sum::<f64>() / diffs.len() as f64
    };

    let clip_penalty =
        MAX_CLIP_PENALTY.min(clipped.len() as f64 / validated.len().max(1) as f64);

    (base * (1.0 - clip_penalty)).clamp(0.0, 1.0)
}

fn key_difference(value: &Value, default: &Value) -> Option<f64> {
    match (value, default) {
        (Value::Bool(v), Value::Bool(d)) => Some(if v != d { BOOL_CHANGE_WEIGHT } else { 0.0 }),
        (Value::Number(v), Value::Number(d)) => {
            let (v, d) = (v.as_f64()?, d.as_f64()?);
            Some(((v - d).abs() / (d.abs() + 1.0)).min(1.0))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::Clip;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[test]
    fn test_identical_to_defaults_scores_zero() {
        let defaults = params(json!({"x": 5.0, "flag": true}));
        assert_eq!(confidence_score(&defaults, &defaults, &ClipReport::new()), 0.0);
    }

    #[test]
    fn test_numeric_relative_difference() {
        // |7 - 3| / (3 + 1) = 1.0, |1.5 - 1| / (1 + 1) = 0.25
        let validated = params(json!({"a": 7.0, "b": 1.5}));
        let defaults = params(json!({"a": 3.0, "b": 1.0}));
        let score = confidence_score(&validated, &defaults, &ClipReport::new());
        assert!((score - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_numeric_difference_is_capped_at_one() {
        let validated = params(json!({"a": 500.0}));
        let defaults = params(json!({"a": 0.0}));
        assert_eq!(confidence_score(&validated, &defaults, &ClipReport::new()), 1.0);
    }

    #[test]
    fn test_bool_change_weight() {
        let validated = params(json!({"flag": false, "other": true}));
        let defaults = params(json!({"flag": true, "other": true}));
        let score = confidence_score(&validated, &defaults, &ClipReport::new());
        assert!((score - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_non_comparable_keys_are_excluded() {
        let validated = params(json!({"a": 2.0, "color": [1, 0, 0], "mixed": true}));
        let defaults = params(json!({"a": 1.0, "color": [0, 0, 0], "mixed": 1}));
        // only "a" is comparable: |2 - 1| / 2 = 0.5
        let score = confidence_score(&validated, &defaults, &ClipReport::new());
        assert!((score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_clip_penalty() {
        let validated = params(json!({"a": 7.0, "b": 3.0}));
        let defaults = params(json!({"a": 3.0, "b": 3.0}));
        let mut clipped = ClipReport::new();
        clipped.insert(
            "a".to_string(),
            Clip {
                input: json!(70),
                output: json!(7.0),
            },
        );
        // base = (1.0 + 0.0) / 2 = 0.5, penalty = min(0.5, 1 / 2) = 0.5
        let score = confidence_score(&validated, &defaults, &clipped);
        assert!((score - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_penalty_is_capped() {
        let validated = params(json!({"a": 4.0}));
        let defaults = params(json!({"a": 3.0}));
        let mut clipped = ClipReport::new();
        for key in ["a", "b", "c"] {
            clipped.insert(
                key.to_string(),
                Clip {
                    input: json!(0),
                    output: json!(0),
                },
            );
        }
        // base = 0.25, penalty capped at 0.5
        let score = confidence_score(&validated, &defaults, &clipped);
        assert!((score - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(
            confidence_score(&Params::new(), &Params::new(), &ClipReport::new()),
            0.0
        );
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let defaults = params(json!({"a": -1.0, "b": 0.0, "c": false}));
        for validated in [
            json!({"a": 1e308, "b": -1e308, "c": true}),
            json!({"a": -1.0, "b": 0.0, "c": false}),
            json!({"a": 0.5, "b": 3, "c": true, "d": 9}),
        ] {
            let score = confidence_score(&params(validated), &defaults, &ClipReport::new());
            assert!((0.0..=1.0).contains(&score));
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn value_strategy() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<f64>().prop_map(|x| serde_json::Number::from_f64(x)
                    .map_or(Value::Null, Value::Number)),
                any::<i64>().prop_map(Value::from),
                any::<bool>().prop_map(Value::Bool),
                Just(Value::Null),
            ]
        }

        fn params_strategy() -> impl Strategy<Value = Params> {
            prop::collection::btree_map("[a-e]", value_strategy(), 0..5)
        }

        proptest! {
            #[test]
            fn score_is_in_unit_interval(
                validated in params_strategy(),
                defaults in params_strategy(),
                clipped_keys in prop::collection::btree_set("[a-h]", 0..8),
            ) {
                let clipped: ClipReport = clipped_keys
                    .into_iter()
                    .map(|key| (key, Clip { input: json!(0), output: json!(1) }))
                    .collect();
                let score = confidence_score(&validated, &defaults, &clipped);
                prop_assert!((0.0..=1.0).contains(&score), "score {score}");
            }
        }
    }
}
