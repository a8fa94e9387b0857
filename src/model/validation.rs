//! Cross-venue validation using athletes who raced more than one venue.
//!
//! Purely diagnostic: nothing here feeds back into the correction table.
//! Repeat-athlete counts are a lower bound, since an athlete whose key was
//! synthesised per event is never recognised at a second venue.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use super::correction::CorrectionTable;
use super::results::{Gender, ResultRecord, ResultSet};
use super::stats::{mean, sample_variance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Athletes with corrected results at two or more venues.
    pub athletes: usize,
    /// Mean per-athlete sample variance of raw times (s²).
    pub raw_variance: f64,
    /// Same, after subtracting each venue's correction.
    pub adjusted_variance: f64,
    /// Relative reduction in percent; negative when adjustment made it worse.
    pub variance_reduction_pct: f64,
    pub improved: bool,
    pub pairs_checked: usize,
    pub pairs_within_tolerance: usize,
    pub pair_success_rate: f64,
    /// Mean |observed − expected| delta over all pairs, in percentage points.
    pub mean_pair_error_pct: f64,
    pub tolerance_pct: f64,
}

pub struct RepeatAthleteValidator {
    tolerance_pct: f64,
}

impl RepeatAthleteValidator {
    pub fn new(tolerance_pct: f64) -> Self {
        RepeatAthleteValidator { tolerance_pct }
    }

    /// `None` when no athlete has corrected results at two distinct venues.
    pub fn validate(&self, results: &ResultSet, table: &CorrectionTable) -> Option<ValidationReport> {
        let mut athletes: BTreeMap<(Gender, &str), Vec<(&ResultRecord, f64)>> = BTreeMap::new();
        for r in results.records() {
            if let Some(corr) = table.correction(&r.venue, r.gender) {
                athletes
                    .entry((r.gender, r.athlete_key.as_str()))
                    .or_default()
                    .push((r, corr));
            }
        }
        athletes.retain(|_, obs| obs.iter().map(|(r, _)| r.venue.as_str()).collect::<BTreeSet<_>>().len() >= 2);
        if athletes.is_empty() {
            return None;
        }

        let mut raw_vars = Vec::with_capacity(athletes.len());
        let mut adj_vars = Vec::with_capacity(athletes.len());
        let mut pair_errors = Vec::new();

        for ((gender, _), obs) in athletes.iter_mut() {
            let raw: Vec<f64> = obs.iter().map(|(r, _)| r.finish_seconds).collect();
            let adjusted: Vec<f64> = obs.iter().map(|(r, c)| r.finish_seconds - c).collect();
            raw_vars.extend(sample_variance(&raw));
            adj_vars.extend(sample_variance(&adjusted));

            let Some(base) = table.baseline(*gender).map(|b| b.median_seconds) else {
                continue;
            };
            if base <= 0.0 {
                continue;
            }
            obs.sort_by(|a, b| {
                a.0.event_date
                    .cmp(&b.0.event_date)
                    .then_with(|| a.0.venue.cmp(&b.0.venue))
            });
            for (i, (first, corr_a)) in obs.iter().enumerate() {
                for (second, corr_b) in &obs[i + 1..] {
                    if first.venue == second.venue {
                        continue;
                    }
                    let expected = (corr_b - corr_a) / base * 100.0;
                    let observed =
                        (second.finish_seconds - first.finish_seconds) / first.finish_seconds * 100.0;
                    pair_errors.push((observed - expected).abs());
                }
            }
        }

        let raw_variance = mean(&raw_vars)?;
        let adjusted_variance = mean(&adj_vars)?;
        let variance_reduction_pct = if raw_variance > 0.0 {
            (raw_variance - adjusted_variance) / raw_variance * 100.0
        } else {
            0.0
        };
        let pairs_within_tolerance = pair_errors
            .iter()
            .filter(|e| **e < self.tolerance_pct)
            .count();
        let pair_success_rate = if pair_errors.is_empty() {
            0.0
        } else {
            pairs_within_tolerance as f64 / pair_errors.len() as f64
        };

        let report = ValidationReport {
            athletes: athletes.len(),
            raw_variance,
            adjusted_variance,
            variance_reduction_pct,
            improved: adjusted_variance < raw_variance,
            pairs_checked: pair_errors.len(),
            pairs_within_tolerance,
            pair_success_rate,
            mean_pair_error_pct: mean(&pair_errors).unwrap_or(0.0),
            tolerance_pct: self.tolerance_pct,
        };
        info!(
            "Validation: {} repeat athletes, variance {:.0} -> {:.0} ({:+.1}%), {}/{} pairs within {:.1}pp",
            report.athletes,
            report.raw_variance,
            report.adjusted_variance,
            -report.variance_reduction_pct,
            report.pairs_within_tolerance,
            report.pairs_checked,
            report.tolerance_pct
        );
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::baseline::BaselineSelection;
    use crate::model::correction::{CorrectionRecord, Strategy};
    use crate::simulate::{simulate, SimulationConfig};
    use approx::assert_relative_eq;

    fn record(venue: &str, gender: Gender, correction: f64) -> CorrectionRecord {
        CorrectionRecord {
            venue: venue.into(),
            gender,
            correction_seconds: correction,
            ci_low: None,
            ci_high: None,
            p_value: None,
            sample_size: 50,
            strategy: Strategy::Percentile,
        }
    }

    fn baseline(venue: &str, gender: Gender, median: f64) -> BaselineSelection {
        BaselineSelection {
            venue: venue.into(),
            gender,
            median_seconds: median,
            position: 0,
            candidates: 2,
            warning: None,
        }
    }

    #[test]
    fn perfect_corrections_remove_cross_venue_variance() {
        let table = CorrectionTable::new(
            vec![record("A", Gender::Men, -300.0), record("B", Gender::Men, 300.0)],
            vec![baseline("A", Gender::Men, 5000.0)],
        );
        let results = ResultSet::new(vec![
            ResultRecord::new("A", Gender::Men, "jo", 4000.0),
            ResultRecord::new("B", Gender::Men, "jo", 4600.0),
            ResultRecord::new("A", Gender::Men, "solo", 4100.0),
        ]);
        let report = RepeatAthleteValidator::new(5.0).validate(&results, &table).unwrap();
        assert_eq!(report.athletes, 1);
        assert_relative_eq!(report.raw_variance, 180_000.0);
        assert_relative_eq!(report.adjusted_variance, 0.0);
        assert!(report.improved);
        // expected 12%, observed 15%
        assert_eq!(report.pairs_checked, 1);
        assert_eq!(report.pairs_within_tolerance, 1);
        assert_relative_eq!(report.mean_pair_error_pct, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn tight_tolerance_fails_pairs() {
        let table = CorrectionTable::new(
            vec![record("A", Gender::Men, -300.0), record("B", Gender::Men, 300.0)],
            vec![baseline("A", Gender::Men, 5000.0)],
        );
        let results = ResultSet::new(vec![
            ResultRecord::new("A", Gender::Men, "jo", 4000.0),
            ResultRecord::new("B", Gender::Men, "jo", 4600.0),
        ]);
        let report = RepeatAthleteValidator::new(1.0).validate(&results, &table).unwrap();
        assert_eq!(report.pairs_within_tolerance, 0);
        assert_relative_eq!(report.pair_success_rate, 0.0);
    }

    #[test]
    fn no_repeat_athletes_gives_no_report() {
        let table = CorrectionTable::new(
            vec![record("A", Gender::Men, 0.0), record("B", Gender::Men, 100.0)],
            vec![baseline("A", Gender::Men, 5000.0)],
        );
        let results = ResultSet::new(vec![
            ResultRecord::new("A", Gender::Men, "x", 4000.0),
            ResultRecord::new("B", Gender::Men, "y", 4100.0),
            // Same key, other gender: not the same athlete.
            ResultRecord::new("B", Gender::Women, "x", 4700.0),
        ]);
        assert!(RepeatAthleteValidator::new(5.0).validate(&results, &table).is_none());
    }

    #[test]
    fn true_effects_reduce_variance_on_synthetic_data() {
        let data = simulate(&SimulationConfig {
            seed: 7,
            ..Default::default()
        })
        .unwrap();
        let mut records = Vec::new();
        let mut baselines = Vec::new();
        for gender in Gender::ALL {
            let effects: Vec<(&String, f64)> = data
                .venue_effects
                .iter()
                .filter(|((_, g), _)| *g == gender)
                .map(|((v, _), e)| (v, *e))
                .collect();
            let (base_venue, base_effect) = effects[0];
            for (venue, effect) in &effects {
                records.push(record(venue, gender, effect - base_effect));
            }
            baselines.push(baseline(base_venue, gender, 5000.0));
        }
        let table = CorrectionTable::new(records, baselines);
        let report = RepeatAthleteValidator::new(5.0)
            .validate(&data.results, &table)
            .unwrap();
        assert!(report.athletes >= 10);
        assert!(report.improved);
        assert!(report.variance_reduction_pct > 0.0);
    }
}
