//! Correction table types, the strategy interface and the batch pipeline
//! that turns a [`ResultSet`] into a published [`CorrectionTable`].
//!
//! Sign convention: a positive correction is a slower course. Adding the
//! correction to the baseline median gives the venue median, so
//! `normalized = raw - correction`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ModelConfig;

use super::baseline::{baseline_at, select_baseline, BaselineSelection, ReferenceVenue};
use super::gender::{check_gender_consistency, GenderConsistency};
use super::mixed::{FitSummary, MixedEffectsModel};
use super::percentile::PercentileModel;
use super::results::{Gender, ResultSet};
use super::stats::VenueStatistics;
use super::validation::{RepeatAthleteValidator, ValidationReport};

/// Which strategy produced a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Percentile,
    MixedEffects,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Percentile => "percentile",
            Strategy::MixedEffects => "mixed_effects",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentile" => Ok(Strategy::Percentile),
            "mixed_effects" => Ok(Strategy::MixedEffects),
            other => anyhow::bail!("unknown strategy '{}'", other),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("only {found} repeat athletes for gender {gender} (need {required})")]
    TooFewRepeatAthletes {
        gender: Gender,
        found: usize,
        required: usize,
    },

    #[error("baseline venue '{0}' has no repeat-athlete results to fit")]
    BaselineNotInFit(String),

    #[error("baseline venue '{venue}' has insufficient data for gender {gender}")]
    InsufficientBaseline { venue: String, gender: Gender },

    #[error("too few observations ({observations}) for {parameters} parameters")]
    Underdetermined {
        observations: usize,
        parameters: usize,
    },

    #[error("variance optimizer did not converge within {0} iterations")]
    NotConverged(usize),

    #[error("normal equations are singular or not positive definite")]
    Singular,

    #[error("no venue has at least {0} athletes of any gender")]
    NoEligibleVenues(usize),
}

/// One published correction for a (venue, gender) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub venue: String,
    pub gender: Gender,
    /// Signed seconds; 0 at the baseline venue.
    pub correction_seconds: f64,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    /// Only the regression model performs a hypothesis test.
    pub p_value: Option<f64>,
    pub sample_size: usize,
    pub strategy: Strategy,
}

/// A (venue, gender) pair left out of the correction table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub venue: String,
    pub gender: Gender,
    pub count: usize,
    pub reason: String,
}

/// Output of one strategy for one gender.
#[derive(Debug, Clone, Default)]
pub struct GenderCorrections {
    pub records: Vec<CorrectionRecord>,
    pub excluded: Vec<Exclusion>,
    pub fit: Option<FitSummary>,
}

/// A strategy producing per-venue corrections relative to a chosen baseline.
pub trait CorrectionModel {
    fn strategy(&self) -> Strategy;

    /// Corrections for `baseline.gender`, expressed relative to `baseline.venue`.
    fn compute(
        &self,
        results: &ResultSet,
        baseline: &BaselineSelection,
    ) -> Result<GenderCorrections, ModelError>;
}

/// The canonical correction set produced by one model run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionTable {
    records: Vec<CorrectionRecord>,
    baselines: Vec<BaselineSelection>,
}

impl CorrectionTable {
    pub fn new(mut records: Vec<CorrectionRecord>, mut baselines: Vec<BaselineSelection>) -> Self {
        records.sort_by(|a, b| {
            a.gender
                .cmp(&b.gender)
                .then_with(|| a.correction_seconds.total_cmp(&b.correction_seconds))
                .then_with(|| a.venue.cmp(&b.venue))
        });
        baselines.sort_by_key(|b| b.gender);
        CorrectionTable { records, baselines }
    }

    pub fn records(&self) -> &[CorrectionRecord] {
        &self.records
    }

    pub fn baselines(&self) -> &[BaselineSelection] {
        &self.baselines
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, venue: &str, gender: Gender) -> Option<&CorrectionRecord> {
        self.records
            .iter()
            .find(|r| r.gender == gender && r.venue == venue)
    }

    pub fn correction(&self, venue: &str, gender: Gender) -> Option<f64> {
        self.get(venue, gender).map(|r| r.correction_seconds)
    }

    pub fn baseline(&self, gender: Gender) -> Option<&BaselineSelection> {
        self.baselines.iter().find(|b| b.gender == gender)
    }

    /// The men's baseline venue (the one with correction 0 by construction),
    /// or the only baseline when men could not be modelled.
    pub fn baseline_venue(&self) -> Option<&str> {
        self.baseline(Gender::Men)
            .or_else(|| self.baselines.first())
            .map(|b| b.venue.as_str())
    }

    /// Corrections of one gender, ascending by correction then venue.
    pub fn for_gender(&self, gender: Gender) -> impl Iterator<Item = &CorrectionRecord> {
        self.records.iter().filter(move |r| r.gender == gender)
    }
}

/// Per-gender record of what actually produced the published numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenderDiagnostics {
    pub gender: Gender,
    pub strategy: Strategy,
    /// Why the regression model was not used, when it was attempted.
    pub fallback_reason: Option<String>,
    pub baseline: BaselineSelection,
    pub venues: usize,
    pub excluded: Vec<Exclusion>,
    pub fit: Option<FitSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub total_results: usize,
    pub rejected_results: usize,
    /// Lower bound: athletes with per-event synthetic keys never match.
    pub repeat_athletes: usize,
    pub genders: Vec<GenderDiagnostics>,
    pub warnings: Vec<String>,
    pub validation: Option<ValidationReport>,
    pub gender_consistency: Option<GenderConsistency>,
}

impl RunDiagnostics {
    pub fn for_gender(&self, gender: Gender) -> Option<&GenderDiagnostics> {
        self.genders.iter().find(|g| g.gender == gender)
    }
}

/// Everything one batch run produces.
#[derive(Debug, Clone)]
pub struct ModelRun {
    pub table: CorrectionTable,
    pub stats: VenueStatistics,
    pub diagnostics: RunDiagnostics,
}

/// Run the whole pipeline: aggregate, select baselines, fit, validate and
/// check gender consistency.
///
/// Recoverable problems (small samples, a regression that cannot be fitted,
/// a missing explicit baseline) degrade to the percentile model and are
/// recorded in the diagnostics. Only a dataset where no venue qualifies at
/// all is an error, so an existing table is never replaced by an empty one.
pub fn run_model(results: &ResultSet, config: &ModelConfig) -> Result<ModelRun, ModelError> {
    let stats = VenueStatistics::compute(results);
    let min = config.min_athletes_per_venue;
    let mut diagnostics = RunDiagnostics {
        total_results: results.len(),
        rejected_results: results.rejected(),
        repeat_athletes: results.repeat_athletes().len(),
        ..Default::default()
    };

    let baselines = select_baselines(&stats, config, &mut diagnostics.warnings);
    if baselines.is_empty() {
        return Err(ModelError::NoEligibleVenues(min));
    }

    let percentile = PercentileModel::new(min);
    let mixed = MixedEffectsModel::new(min, config.min_repeat_athletes, config.max_iterations);

    let mut records = Vec::new();
    for baseline in &baselines {
        let gender = baseline.gender;
        let (output, strategy, fallback_reason) = if config.force_percentile {
            (percentile.compute(results, baseline), Strategy::Percentile, None)
        } else {
            match mixed.compute(results, baseline) {
                Ok(out) => (Ok(out), Strategy::MixedEffects, None),
                Err(e) => {
                    warn!(
                        "Mixed-effects model unavailable for {} ({}); falling back to percentile model",
                        gender.label(),
                        e
                    );
                    (
                        percentile.compute(results, baseline),
                        Strategy::Percentile,
                        Some(e.to_string()),
                    )
                }
            }
        };

        let output = match output {
            Ok(out) => out,
            Err(e) => {
                warn!("No {} corrections produced: {}", gender.label(), e);
                diagnostics
                    .warnings
                    .push(format!("no {} corrections: {}", gender.label(), e));
                continue;
            }
        };

        for ex in &output.excluded {
            warn!(
                "Excluded {} ({}, n={}): {}",
                ex.venue,
                gender.label(),
                ex.count,
                ex.reason
            );
        }
        info!(
            "{} corrections for {} venue(s) via {}",
            gender.label(),
            output.records.len(),
            strategy
        );

        diagnostics.genders.push(GenderDiagnostics {
            gender,
            strategy,
            fallback_reason,
            baseline: baseline.clone(),
            venues: output.records.len(),
            excluded: output.excluded,
            fit: output.fit,
        });
        records.extend(output.records);
    }

    let published: Vec<BaselineSelection> = diagnostics
        .genders
        .iter()
        .map(|g| g.baseline.clone())
        .collect();
    let table = CorrectionTable::new(records, published);
    if table.is_empty() {
        return Err(ModelError::NoEligibleVenues(min));
    }

    diagnostics.validation =
        RepeatAthleteValidator::new(config.validation_tolerance_pct).validate(results, &table);
    diagnostics.gender_consistency = check_gender_consistency(&table, config.gender_threshold_pct);

    Ok(ModelRun {
        table,
        stats,
        diagnostics,
    })
}

/// Men's baseline follows the configured mode. Women share that venue when
/// they have enough athletes there, otherwise they get their own.
fn select_baselines(
    stats: &VenueStatistics,
    config: &ModelConfig,
    warnings: &mut Vec<String>,
) -> Vec<BaselineSelection> {
    let min = config.min_athletes_per_venue;
    let mut baselines = Vec::new();

    let men = select_baseline(stats, Gender::Men, min, &config.reference_venue);
    match &men {
        Some(sel) => {
            if let Some(w) = &sel.warning {
                warnings.push(w.clone());
            }
            baselines.push(sel.clone());
        }
        None => warnings.push(format!("no venue has at least {} men", min)),
    }

    let women = match &men {
        Some(men_sel) => baseline_at(stats, Gender::Women, &men_sel.venue, min).or_else(|| {
            let msg = format!(
                "baseline venue '{}' lacks sufficient women's results; women use their own median-position baseline",
                men_sel.venue
            );
            warn!("{}", msg);
            warnings.push(msg);
            select_baseline(stats, Gender::Women, min, &ReferenceVenue::Median)
        }),
        None => select_baseline(stats, Gender::Women, min, &config.reference_venue),
    };
    match women {
        Some(sel) => {
            if let Some(w) = &sel.warning {
                warnings.push(w.clone());
            }
            baselines.push(sel);
        }
        None => warnings.push(format!("no venue has at least {} women", min)),
    }

    baselines
}
