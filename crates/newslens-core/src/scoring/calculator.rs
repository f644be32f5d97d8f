//! Composite score computation.
//!
//! A pure function from a set of per-model results and the active ensemble
//! config to a `(composite_score, composite_confidence)` pair. Duplicate
//! results for the same model are averaged into one virtual entry before the
//! formula is applied, matching the upsert semantics of the storage layer.

use super::ModelScore;
use crate::config::ensemble::{ConfidenceMethod, EnsembleConfig, Formula, InvalidPolicy, Perspective};
use crate::error::CalculatorError;

/// Compute the composite score and confidence for a set of results.
///
/// Results with out-of-range scores or confidences are handled per
/// `config.handle_invalid`: dropped (`ignore`), dropped with a zero
/// composite when nothing remains (`default_zero`), or fatal (`fail`).
pub fn compute(
    results: &[ModelScore],
    config: &EnsembleConfig,
) -> Result<(f64, f64), CalculatorError> {
    let mut valid = Vec::with_capacity(results.len());
    for result in results {
        if is_valid(result) {
            valid.push(result.clone());
        } else if config.handle_invalid == InvalidPolicy::Fail {
            return Err(CalculatorError::InvalidResult {
                model: result.model.clone(),
                score: result.score,
            });
        }
    }

    let merged = merge_duplicates(valid);

    if merged.is_empty() {
        return if config.handle_invalid == InvalidPolicy::DefaultZero {
            Ok((0.0, 0.0))
        } else {
            Err(CalculatorError::NoValidResults)
        };
    }

    let score = match config.formula {
        Formula::WeightedAverage => weighted_average(&merged),
        Formula::PerspectiveAverage => perspective_average(&merged),
        Formula::ConfidenceWeighted => confidence_weighted(&merged),
    };

    let confidence = match config.confidence_method {
        ConfidenceMethod::Mean => mean(merged.iter().map(|r| r.confidence)),
        ConfidenceMethod::Min => merged
            .iter()
            .map(|r| r.confidence)
            .fold(f64::INFINITY, f64::min),
        ConfidenceMethod::SpreadInverse => {
            1.0 - stddev(&merged.iter().map(|r| r.score).collect::<Vec<_>>()).min(1.0)
        }
    };

    Ok((score.clamp(-1.0, 1.0), confidence.clamp(0.0, 1.0)))
}

fn is_valid(result: &ModelScore) -> bool {
    (-1.0..=1.0).contains(&result.score)
        && (0.0..=1.0).contains(&result.confidence)
        && result.weight.is_finite()
        && result.weight >= 0.0
}

/// Average same-model entries into a single virtual result.
///
/// Perspective and weight are taken from the first occurrence; scores and
/// confidences are arithmetic means. First-seen order is preserved.
fn merge_duplicates(results: Vec<ModelScore>) -> Vec<ModelScore> {
    let mut merged: Vec<(ModelScore, u32)> = Vec::with_capacity(results.len());
    for result in results {
        if let Some((existing, count)) = merged.iter_mut().find(|(m, _)| m.model == result.model)
        {
            let n = f64::from(*count);
            existing.score = (existing.score * n + result.score) / (n + 1.0);
            existing.confidence = (existing.confidence * n + result.confidence) / (n + 1.0);
            *count += 1;
        } else {
            merged.push((result, 1));
        }
    }
    merged.into_iter().map(|(m, _)| m).collect()
}

fn weighted_average(results: &[ModelScore]) -> f64 {
    let total_weight: f64 = results.iter().map(|r| r.weight).sum();
    if total_weight == 0.0 {
        return mean(results.iter().map(|r| r.score));
    }
    results.iter().map(|r| r.score * r.weight).sum::<f64>() / total_weight
}

/// Mean per perspective group, then equal-weight mean of the group means.
/// Groups are visited in the fixed order center, left, neutral, right.
fn perspective_average(results: &[ModelScore]) -> f64 {
    let mut group_means = Vec::with_capacity(Perspective::ORDER.len());
    for perspective in Perspective::ORDER {
        let scores: Vec<f64> = results
            .iter()
            .filter(|r| r.perspective == perspective)
            .map(|r| r.score)
            .collect();
        if !scores.is_empty() {
            group_means.push(mean(scores.iter().copied()));
        }
    }
    mean(group_means.iter().copied())
}

fn confidence_weighted(results: &[ModelScore]) -> f64 {
    let denominator: f64 = results.iter().map(|r| r.confidence * r.weight).sum();
    if denominator == 0.0 {
        return mean(results.iter().map(|r| r.score));
    }
    results
        .iter()
        .map(|r| r.score * r.confidence * r.weight)
        .sum::<f64>()
        / denominator
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0u32), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / f64::from(count)
    }
}

/// Population standard deviation.
fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values.iter().copied());
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ensemble::Perspective;

    fn result(model: &str, perspective: Perspective, weight: f64, score: f64, confidence: f64) -> ModelScore {
        ModelScore {
            model: model.to_string(),
            perspective,
            weight,
            score,
            confidence,
            explanation: String::new(),
            metadata: serde_json::json!({}),
        }
    }

    fn config(formula: Formula, method: ConfidenceMethod, policy: InvalidPolicy) -> EnsembleConfig {
        EnsembleConfig {
            formula,
            confidence_method: method,
            handle_invalid: policy,
            ..EnsembleConfig::default()
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn weighted_average_three_models() {
        // A(-0.8), B(-0.6), C(-0.8), all weight 1.0, confidences 0.9/0.8/0.9.
        let results = vec![
            result("a", Perspective::Left, 1.0, -0.8, 0.9),
            result("b", Perspective::Center, 1.0, -0.6, 0.8),
            result("c", Perspective::Right, 1.0, -0.8, 0.9),
        ];
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, confidence) = compute(&results, &cfg).expect("compute");
        assert!(close(score, -2.2 / 3.0), "got {score}");
        assert!(close(confidence, 2.6 / 3.0), "got {confidence}");
    }

    #[test]
    fn weighted_average_respects_weights() {
        let results = vec![
            result("a", Perspective::Left, 3.0, 1.0, 0.5),
            result("b", Perspective::Right, 1.0, -1.0, 0.5),
        ];
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, _) = compute(&results, &cfg).expect("compute");
        assert!(close(score, 0.5));
    }

    #[test]
    fn all_zero_weights_fall_back_to_mean() {
        let results = vec![
            result("a", Perspective::Left, 0.0, 0.4, 0.5),
            result("b", Perspective::Right, 0.0, 0.8, 0.5),
        ];
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, _) = compute(&results, &cfg).expect("compute");
        assert!(close(score, 0.6));
    }

    #[test]
    fn perspective_average_groups_equally() {
        // Two left models pulling hard should count as one group.
        let results = vec![
            result("l1", Perspective::Left, 1.0, -1.0, 0.9),
            result("l2", Perspective::Left, 1.0, -0.8, 0.9),
            result("r1", Perspective::Right, 1.0, 0.3, 0.9),
        ];
        let cfg = config(Formula::PerspectiveAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, _) = compute(&results, &cfg).expect("compute");
        // left mean = -0.9, right mean = 0.3 → (-0.9 + 0.3) / 2
        assert!(close(score, -0.3));
    }

    #[test]
    fn perspective_average_drops_empty_groups() {
        let results = vec![result("n", Perspective::Neutral, 1.0, 0.2, 0.5)];
        let cfg = config(Formula::PerspectiveAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, _) = compute(&results, &cfg).expect("compute");
        assert!(close(score, 0.2));
    }

    #[test]
    fn confidence_weighted_favors_confident_models() {
        let results = vec![
            result("a", Perspective::Left, 1.0, -1.0, 1.0),
            result("b", Perspective::Right, 1.0, 1.0, 0.0),
        ];
        let cfg = config(Formula::ConfidenceWeighted, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, _) = compute(&results, &cfg).expect("compute");
        assert!(close(score, -1.0));
    }

    #[test]
    fn confidence_weighted_zero_denominator_falls_back() {
        let results = vec![
            result("a", Perspective::Left, 1.0, -0.4, 0.0),
            result("b", Perspective::Right, 1.0, 0.8, 0.0),
        ];
        let cfg = config(Formula::ConfidenceWeighted, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, _) = compute(&results, &cfg).expect("compute");
        assert!(close(score, 0.2));
    }

    #[test]
    fn duplicate_models_merge_before_formula() {
        let results = vec![
            result("same", Perspective::Center, 1.0, 0.0, 0.4),
            result("same", Perspective::Center, 1.0, 1.0, 0.8),
            result("other", Perspective::Center, 1.0, -0.5, 0.6),
        ];
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, confidence) = compute(&results, &cfg).expect("compute");
        // "same" collapses to (0.5, 0.6); composite = (0.5 - 0.5) / 2.
        assert!(close(score, 0.0));
        assert!(close(confidence, 0.6));
    }

    #[test]
    fn min_confidence_method() {
        let results = vec![
            result("a", Perspective::Left, 1.0, 0.1, 0.9),
            result("b", Perspective::Right, 1.0, 0.2, 0.3),
        ];
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Min, InvalidPolicy::Ignore);
        let (_, confidence) = compute(&results, &cfg).expect("compute");
        assert!(close(confidence, 0.3));
    }

    #[test]
    fn spread_inverse_penalizes_disagreement() {
        let agree = vec![
            result("a", Perspective::Left, 1.0, 0.5, 0.9),
            result("b", Perspective::Right, 1.0, 0.5, 0.9),
        ];
        let disagree = vec![
            result("a", Perspective::Left, 1.0, -1.0, 0.9),
            result("b", Perspective::Right, 1.0, 1.0, 0.9),
        ];
        let cfg = config(
            Formula::WeightedAverage,
            ConfidenceMethod::SpreadInverse,
            InvalidPolicy::Ignore,
        );
        let (_, confident) = compute(&agree, &cfg).expect("compute");
        let (_, doubtful) = compute(&disagree, &cfg).expect("compute");
        assert!(close(confident, 1.0));
        // stddev of {-1, 1} is 1.0, fully saturating the penalty.
        assert!(close(doubtful, 0.0));
    }

    #[test]
    fn invalid_results_dropped_under_ignore() {
        let results = vec![
            result("bad", Perspective::Left, 1.0, 3.0, 0.9),
            result("good", Perspective::Right, 1.0, 0.4, 0.8),
        ];
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, _) = compute(&results, &cfg).expect("compute");
        assert!(close(score, 0.4));
    }

    #[test]
    fn invalid_result_fatal_under_fail() {
        let results = vec![
            result("bad", Perspective::Left, 1.0, 3.0, 0.9),
            result("good", Perspective::Right, 1.0, 0.4, 0.8),
        ];
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Mean, InvalidPolicy::Fail);
        let err = compute(&results, &cfg).unwrap_err();
        assert_eq!(
            err,
            CalculatorError::InvalidResult {
                model: "bad".to_string(),
                score: 3.0
            }
        );
    }

    #[test]
    fn no_valid_results_errors_by_default() {
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let err = compute(&[], &cfg).unwrap_err();
        assert_eq!(err, CalculatorError::NoValidResults);
    }

    #[test]
    fn no_valid_results_zero_composite_under_default_zero() {
        let cfg = config(
            Formula::WeightedAverage,
            ConfidenceMethod::Mean,
            InvalidPolicy::DefaultZero,
        );
        let (score, confidence) = compute(&[], &cfg).expect("compute");
        assert_eq!((score, confidence), (0.0, 0.0));
    }

    #[test]
    fn composite_stays_in_range() {
        let results = vec![result("a", Perspective::Left, 1.0, -1.0, 1.0)];
        let cfg = config(Formula::WeightedAverage, ConfidenceMethod::Mean, InvalidPolicy::Ignore);
        let (score, confidence) = compute(&results, &cfg).expect("compute");
        assert!((-1.0..=1.0).contains(&score));
        assert!((0.0..=1.0).contains(&confidence));
    }
}
