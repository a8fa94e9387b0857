//! Men's vs. women's correction factors per venue.
//!
//! Factors are corrections as a percentage of the gender's own baseline
//! median, so the two genders are comparable despite different absolute
//! times. The outcome is a recommendation for the operator only; genders are
//! never pooled automatically.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::correction::CorrectionTable;
use super::results::Gender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    SharedFactor,
    GenderSpecific,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueGenderGap {
    pub venue: String,
    pub men_pct: f64,
    pub women_pct: f64,
    pub difference_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenderConsistency {
    pub venues: Vec<VenueGenderGap>,
    pub mean_difference_pct: f64,
    pub max_difference_pct: f64,
    pub threshold_pct: f64,
    pub recommendation: Recommendation,
}

/// `None` unless at least one venue has corrections for both genders.
pub fn check_gender_consistency(table: &CorrectionTable, threshold_pct: f64) -> Option<GenderConsistency> {
    let men_base = table.baseline(Gender::Men)?.median_seconds;
    let women_base = table.baseline(Gender::Women)?.median_seconds;
    if men_base <= 0.0 || women_base <= 0.0 {
        return None;
    }

    let mut venues: Vec<VenueGenderGap> = table
        .for_gender(Gender::Men)
        .filter_map(|m| {
            let w = table.correction(&m.venue, Gender::Women)?;
            let men_pct = m.correction_seconds / men_base * 100.0;
            let women_pct = w / women_base * 100.0;
            Some(VenueGenderGap {
                venue: m.venue.clone(),
                men_pct,
                women_pct,
                difference_pct: (men_pct - women_pct).abs(),
            })
        })
        .collect();
    if venues.is_empty() {
        return None;
    }
    venues.sort_by(|a, b| a.venue.cmp(&b.venue));

    let mean_difference_pct =
        venues.iter().map(|v| v.difference_pct).sum::<f64>() / venues.len() as f64;
    let max_difference_pct = venues
        .iter()
        .map(|v| v.difference_pct)
        .fold(0.0, f64::max);
    let recommendation = if mean_difference_pct < threshold_pct {
        Recommendation::SharedFactor
    } else {
        Recommendation::GenderSpecific
    };
    info!(
        "Gender consistency over {} venues: mean {:.2}pp, max {:.2}pp -> {:?}",
        venues.len(),
        mean_difference_pct,
        max_difference_pct,
        recommendation
    );

    Some(GenderConsistency {
        venues,
        mean_difference_pct,
        max_difference_pct,
        threshold_pct,
        recommendation,
    })
}
