//! Linear mixed model with a random intercept per athlete:
//!
//! `finish = intercept + venue effect + athlete intercept + noise`
//!
//! Fitted by REML over repeat athletes only, which is what lets the venue
//! effect be separated from athlete ability. For a fixed variance ratio
//! `λ = σ²_athlete / σ²_noise` the fixed effects have a closed-form GLS
//! solution, so the only numerical optimisation is a bounded golden-section
//! search over `ln λ`.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::baseline::BaselineSelection;
use super::correction::{
    CorrectionModel, CorrectionRecord, Exclusion, GenderCorrections, ModelError, Strategy,
};
use super::results::ResultSet;
use super::stats::VenueStatistics;

/// Search interval for `ln λ`.
const LOG_RATIO_BOUNDS: (f64, f64) = (-14.0, 14.0);
const LOG_RATIO_TOLERANCE: f64 = 1e-6;
/// Two-sided confidence level for the reported intervals.
const CONFIDENCE_LEVEL: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub observations: usize,
    pub athletes: usize,
    pub venues: usize,
    pub iterations: usize,
    pub residual_variance: f64,
    pub athlete_variance: f64,
    pub reml_log_likelihood: f64,
}

pub struct MixedEffectsModel {
    min_athletes: usize,
    min_repeat_athletes: usize,
    max_iterations: usize,
}

impl MixedEffectsModel {
    pub fn new(min_athletes: usize, min_repeat_athletes: usize, max_iterations: usize) -> Self {
        MixedEffectsModel {
            min_athletes,
            min_repeat_athletes,
            max_iterations,
        }
    }
}

impl CorrectionModel for MixedEffectsModel {
    fn strategy(&self) -> Strategy {
        Strategy::MixedEffects
    }

    fn compute(
        &self,
        results: &ResultSet,
        baseline: &BaselineSelection,
    ) -> Result<GenderCorrections, ModelError> {
        let gender = baseline.gender;
        let stats = VenueStatistics::compute(results);
        let eligible: BTreeSet<&str> = stats
            .eligible(gender, self.min_athletes)
            .map(|s| s.venue.as_str())
            .collect();

        let mut by_athlete: BTreeMap<&str, Vec<(&str, f64)>> = BTreeMap::new();
        for r in results.for_gender(gender) {
            if eligible.contains(r.venue.as_str()) {
                by_athlete
                    .entry(r.athlete_key.as_str())
                    .or_default()
                    .push((r.venue.as_str(), r.finish_seconds));
            }
        }
        let repeat: Vec<Vec<(&str, f64)>> = by_athlete
            .into_values()
            .filter(|rows| rows.iter().map(|(v, _)| *v).collect::<BTreeSet<_>>().len() >= 2)
            .collect();

        if repeat.len() < self.min_repeat_athletes {
            return Err(ModelError::TooFewRepeatAthletes {
                gender,
                found: repeat.len(),
                required: self.min_repeat_athletes,
            });
        }

        let design = Design::build(&repeat);
        let baseline_idx = design
            .venue_index(&baseline.venue)
            .ok_or_else(|| ModelError::BaselineNotInFit(baseline.venue.clone()))?;
        let fit = design.fit(self.max_iterations)?;

        let normal = Normal::new(0.0, 1.0).ok();
        let z_crit = normal
            .as_ref()
            .map(|n| n.inverse_cdf(0.5 + CONFIDENCE_LEVEL / 2.0));

        let mut out = GenderCorrections::default();
        for stat in stats.for_gender(gender) {
            let Some(v) = design.venue_index(&stat.venue) else {
                let reason = if stat.count < self.min_athletes {
                    format!("insufficient data (n < {})", self.min_athletes)
                } else {
                    "no repeat athletes at venue".to_string()
                };
                out.excluded.push(Exclusion {
                    venue: stat.venue.clone(),
                    gender,
                    count: stat.count,
                    reason,
                });
                continue;
            };

            // Shift from the regression's own reference category to the baseline.
            let correction = fit.effect(v) - fit.effect(baseline_idx);
            let (ci_low, ci_high, p_value) = if v == baseline_idx {
                (Some(0.0), Some(0.0), None)
            } else {
                let se = fit.contrast_std_error(v, baseline_idx);
                let interval = z_crit.map(|z| (correction - z * se, correction + z * se));
                let p = match (&normal, se > 0.0) {
                    (Some(n), true) => Some(2.0 * (1.0 - n.cdf((correction / se).abs()))),
                    _ => None,
                };
                (interval.map(|i| i.0), interval.map(|i| i.1), p)
            };

            out.records.push(CorrectionRecord {
                venue: stat.venue.clone(),
                gender,
                correction_seconds: correction,
                ci_low,
                ci_high,
                p_value,
                sample_size: stat.count,
                strategy: self.strategy(),
            });
        }

        let summary = FitSummary {
            observations: design.observations,
            athletes: design.groups.len(),
            venues: design.venues.len(),
            iterations: fit.iterations,
            residual_variance: fit.sigma2,
            athlete_variance: fit.sigma2 * fit.ratio,
            reml_log_likelihood: -0.5 * fit.objective,
        };
        debug!("Mixed-effects fit ({}): {:?}", gender.label(), summary);
        out.fit = Some(summary);
        Ok(out)
    }
}

/// One athlete's observations as (venue index, centred time).
struct Group {
    rows: Vec<(usize, f64)>,
    sum_x: Vec<f64>,
    sum_y: f64,
}

/// Intercept plus one dummy per venue except index 0, which is the
/// regression's reference category.
struct Design {
    venues: Vec<String>,
    groups: Vec<Group>,
    observations: usize,
    xtx: Vec<f64>,
    xty: Vec<f64>,
}

struct Fit {
    beta: Vec<f64>,
    chol: Cholesky,
    sigma2: f64,
    ratio: f64,
    objective: f64,
    iterations: usize,
}

impl Fit {
    fn effect(&self, venue: usize) -> f64 {
        if venue == 0 {
            0.0
        } else {
            self.beta[venue]
        }
    }

    /// Standard error of `effect(a) - effect(b)`.
    fn contrast_std_error(&self, a: usize, b: usize) -> f64 {
        let mut c = vec![0.0; self.beta.len()];
        if a != 0 {
            c[a] += 1.0;
        }
        if b != 0 {
            c[b] -= 1.0;
        }
        let solved = self.chol.solve(&c);
        let var = self.sigma2 * dot(&c, &solved);
        var.max(0.0).sqrt()
    }
}

impl Design {
    fn build(athletes: &[Vec<(&str, f64)>]) -> Self {
        let venues: Vec<String> = athletes
            .iter()
            .flatten()
            .map(|(v, _)| v.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: BTreeMap<&str, usize> = venues
            .iter()
            .enumerate()
            .map(|(i, v)| (v.as_str(), i))
            .collect();

        let observations: usize = athletes.iter().map(Vec::len).sum();
        let grand_mean =
            athletes.iter().flatten().map(|(_, y)| *y).sum::<f64>() / observations.max(1) as f64;

        let p = venues.len();
        let mut xtx = vec![0.0; p * p];
        let mut xty = vec![0.0; p];
        let mut groups = Vec::with_capacity(athletes.len());
        for rows in athletes {
            let mut group = Group {
                rows: Vec::with_capacity(rows.len()),
                sum_x: vec![0.0; p],
                sum_y: 0.0,
            };
            for (venue, time) in rows {
                let v = index[venue];
                let y = time - grand_mean;
                for i in design_columns(v) {
                    for j in design_columns(v) {
                        xtx[i * p + j] += 1.0;
                    }
                    xty[i] += y;
                    group.sum_x[i] += 1.0;
                }
                group.sum_y += y;
                group.rows.push((v, y));
            }
            groups.push(group);
        }

        Design {
            venues,
            groups,
            observations,
            xtx,
            xty,
        }
    }

    fn venue_index(&self, venue: &str) -> Option<usize> {
        self.venues.iter().position(|v| v == venue)
    }

    fn parameters(&self) -> usize {
        self.venues.len()
    }

    /// GLS solution and REML criterion (-2 log-likelihood up to a constant)
    /// for a fixed variance ratio.
    fn evaluate(&self, ratio: f64) -> Result<(Vec<f64>, Cholesky, f64, f64), ModelError> {
        let p = self.parameters();
        let mut a = self.xtx.clone();
        let mut b = self.xty.clone();
        let mut log_det_v = 0.0;
        for g in &self.groups {
            let n = g.rows.len() as f64;
            let w = ratio / (1.0 + n * ratio);
            for i in 0..p {
                for j in 0..p {
                    a[i * p + j] -= w * g.sum_x[i] * g.sum_x[j];
                }
                b[i] -= w * g.sum_x[i] * g.sum_y;
            }
            log_det_v += (1.0 + n * ratio).ln();
        }

        let chol = Cholesky::factor(&a, p).ok_or(ModelError::Singular)?;
        let beta = chol.solve(&b);

        let mut rss = 0.0;
        for g in &self.groups {
            let n = g.rows.len() as f64;
            let w = ratio / (1.0 + n * ratio);
            let mut sum_r = 0.0;
            for &(v, y) in &g.rows {
                let fitted = beta[0] + if v == 0 { 0.0 } else { beta[v] };
                let r = y - fitted;
                rss += r * r;
                sum_r += r;
            }
            rss -= w * sum_r * sum_r;
        }

        let dof = (self.observations - p) as f64;
        if !(rss > 0.0) || !rss.is_finite() {
            return Err(ModelError::Singular);
        }
        let sigma2 = rss / dof;
        let objective = dof * sigma2.ln() + dof + log_det_v + chol.log_det();
        Ok((beta, chol, sigma2, objective))
    }

    fn fit(&self, max_iterations: usize) -> Result<Fit, ModelError> {
        let p = self.parameters();
        if self.observations <= p {
            return Err(ModelError::Underdetermined {
                observations: self.observations,
                parameters: p,
            });
        }

        let (log_ratio, iterations) = golden_section(
            |x| self.evaluate(x.exp()).map(|(_, _, _, obj)| obj),
            LOG_RATIO_BOUNDS,
            LOG_RATIO_TOLERANCE,
            max_iterations,
        )?;
        let ratio = log_ratio.exp();
        let (beta, chol, sigma2, objective) = self.evaluate(ratio)?;
        if beta.iter().any(|b| !b.is_finite()) {
            return Err(ModelError::Singular);
        }
        Ok(Fit {
            beta,
            chol,
            sigma2,
            ratio,
            objective,
            iterations,
        })
    }
}

/// Columns set to 1 for an observation at venue `v`: intercept, plus the
/// venue dummy unless `v` is the reference category.
fn design_columns(v: usize) -> impl Iterator<Item = usize> + Clone {
    std::iter::once(0).chain((v != 0).then_some(v))
}

/// Minimise a unimodal function on `[lo, hi]`. Fails rather than returning
/// a half-converged point when the iteration cap is reached.
fn golden_section<F>(
    mut f: F,
    (mut lo, mut hi): (f64, f64),
    tolerance: f64,
    max_iterations: usize,
) -> Result<(f64, usize), ModelError>
where
    F: FnMut(f64) -> Result<f64, ModelError>,
{
    let inv_phi = (5f64.sqrt() - 1.0) / 2.0;
    let mut c = hi - inv_phi * (hi - lo);
    let mut d = lo + inv_phi * (hi - lo);
    let mut fc = f(c)?;
    let mut fd = f(d)?;

    let mut iterations = 0;
    while hi - lo > tolerance {
        if iterations >= max_iterations {
            return Err(ModelError::NotConverged(max_iterations));
        }
        iterations += 1;
        if fc < fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - inv_phi * (hi - lo);
            fc = f(c)?;
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + inv_phi * (hi - lo);
            fd = f(d)?;
        }
        if !fc.is_finite() || !fd.is_finite() {
            return Err(ModelError::Singular);
        }
    }
    Ok(((lo + hi) / 2.0, iterations))
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Lower-triangular factor of a symmetric positive-definite matrix
/// (row-major, `n × n`).
struct Cholesky {
    n: usize,
    l: Vec<f64>,
}

impl Cholesky {
    fn factor(a: &[f64], n: usize) -> Option<Self> {
        let mut l = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = a[i * n + j];
                for k in 0..j {
                    sum -= l[i * n + k] * l[j * n + k];
                }
                if i == j {
                    if !(sum > 0.0) || !sum.is_finite() {
                        return None;
                    }
                    l[i * n + i] = sum.sqrt();
                } else {
                    l[i * n + j] = sum / l[j * n + j];
                }
            }
        }
        Some(Cholesky { n, l })
    }

    fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for k in 0..i {
                sum -= self.l[i * n + k] * y[k];
            }
            y[i] = sum / self.l[i * n + i];
        }
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = y[i];
            for k in (i + 1)..n {
                sum -= self.l[k * n + i] * x[k];
            }
            x[i] = sum / self.l[i * n + i];
        }
        x
    }

    fn log_det(&self) -> f64 {
        (0..self.n).map(|i| 2.0 * self.l[i * self.n + i].ln()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::results::{Gender, ResultRecord};
    use approx::assert_relative_eq;

    const EFFECTS: [(&str, f64); 3] = [("Alpha", 0.0), ("Bravo", 300.0), ("Charlie", -200.0)];

    /// Every athlete races every venue; ability and noise are deterministic.
    fn balanced(athletes: usize) -> ResultSet {
        let mut records = Vec::new();
        for i in 0..athletes {
            let ability = 4000.0 + (i as f64 * 37.0) % 900.0;
            for (v, (venue, effect)) in EFFECTS.iter().enumerate() {
                let noise = (((i * 7 + v * 3) % 5) as f64 - 2.0) * 3.0;
                records.push(ResultRecord::new(venue, Gender::Men, &format!("ath{i}"), ability + effect + noise));
            }
        }
        ResultSet::new(records)
    }

    fn baseline(venue: &str) -> BaselineSelection {
        BaselineSelection {
            venue: venue.into(),
            gender: Gender::Men,
            median_seconds: 4400.0,
            position: 0,
            candidates: 3,
            warning: None,
        }
    }

    #[test]
    fn recovers_venue_effects_relative_to_baseline() {
        let model = MixedEffectsModel::new(1, 10, 200);
        // Bravo is not the regression's reference category (Alpha is).
        let out = model.compute(&balanced(40), &baseline("Bravo")).unwrap();
        let get = |v: &str| out.records.iter().find(|r| r.venue == v).unwrap();

        assert_relative_eq!(get("Bravo").correction_seconds, 0.0, epsilon = 1e-9);
        assert_relative_eq!(get("Alpha").correction_seconds, -300.0, epsilon = 5.0);
        assert_relative_eq!(get("Charlie").correction_seconds, -500.0, epsilon = 5.0);
        assert!(get("Bravo").p_value.is_none());

        let charlie = get("Charlie");
        assert!(charlie.ci_low.unwrap() < charlie.correction_seconds);
        assert!(charlie.ci_high.unwrap() > charlie.correction_seconds);
        assert!(charlie.p_value.unwrap() < 0.001);

        let fit = out.fit.unwrap();
        assert_eq!(fit.athletes, 40);
        assert_eq!(fit.observations, 120);
        assert!(fit.athlete_variance > fit.residual_variance);
    }

    #[test]
    fn too_few_repeat_athletes() {
        let model = MixedEffectsModel::new(1, 10, 200);
        let err = model.compute(&balanced(4), &baseline("Alpha")).unwrap_err();
        assert_eq!(
            err,
            ModelError::TooFewRepeatAthletes {
                gender: Gender::Men,
                found: 4,
                required: 10
            }
        );
    }

    #[test]
    fn baseline_without_repeat_athletes_is_rejected() {
        let mut records = balanced(20).records().to_vec();
        records.push(ResultRecord::new("Delta", Gender::Men, "solo", 4100.0));
        let model = MixedEffectsModel::new(1, 10, 200);
        let err = model
            .compute(&ResultSet::new(records), &baseline("Delta"))
            .unwrap_err();
        assert_eq!(err, ModelError::BaselineNotInFit("Delta".into()));
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let model = MixedEffectsModel::new(1, 10, 3);
        let err = model.compute(&balanced(40), &baseline("Alpha")).unwrap_err();
        assert_eq!(err, ModelError::NotConverged(3));
    }

    #[test]
    fn golden_section_finds_parabola_minimum() {
        let (x, iters) = golden_section(|x| Ok((x - 1.5).powi(2)), (-10.0, 10.0), 1e-8, 200).unwrap();
        assert_relative_eq!(x, 1.5, epsilon = 1e-6);
        assert!(iters > 0);
    }

    #[test]
    fn cholesky_solves_spd_system() {
        // [[4, 2], [2, 3]] x = [2, 1]  →  x = [0.5, 0]
        let chol = Cholesky::factor(&[4.0, 2.0, 2.0, 3.0], 2).unwrap();
        let x = chol.solve(&[2.0, 1.0]);
        assert_relative_eq!(x[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(x[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(chol.log_det(), 8f64.ln(), epsilon = 1e-12);
        assert!(Cholesky::factor(&[1.0, 2.0, 2.0, 1.0], 2).is_none());
    }
}
