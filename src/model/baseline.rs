use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use super::results::Gender;
use super::stats::VenueStatistics;

/// How the reference venue (correction = 0) is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceVenue {
    /// Fastest venue by overall median.
    Fastest,
    /// Venue of median difficulty: position ⌊N/2⌋ of the ascending ranking.
    #[default]
    Median,
    /// Explicit venue name; falls back to `Median` when it has no valid stats.
    Named(String),
}

impl FromStr for ReferenceVenue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("reference venue must not be empty");
        }
        Ok(match trimmed.to_ascii_lowercase().as_str() {
            "fastest" => ReferenceVenue::Fastest,
            "median" => ReferenceVenue::Median,
            _ => ReferenceVenue::Named(trimmed.to_string()),
        })
    }
}

impl fmt::Display for ReferenceVenue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceVenue::Fastest => f.write_str("fastest"),
            ReferenceVenue::Median => f.write_str("median"),
            ReferenceVenue::Named(name) => f.write_str(name),
        }
    }
}

/// The venue every correction of one gender is expressed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSelection {
    pub venue: String,
    pub gender: Gender,
    /// Gender-specific median at the baseline venue.
    pub median_seconds: f64,
    /// 0-indexed position in the ascending ranking.
    pub position: usize,
    pub candidates: usize,
    /// Set when an explicit venue was requested but could not be used.
    pub warning: Option<String>,
}

/// Venues eligible for `gender`, ordered by overall median (both genders
/// combined) ascending. Ties fall back to the venue name so the order is
/// reproducible on identical input.
pub fn rank_venues(stats: &VenueStatistics, gender: Gender, min_count: usize) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = stats
        .eligible(gender, min_count)
        .filter_map(|s| {
            stats
                .overall_median(&s.venue)
                .map(|m| (s.venue.clone(), m))
        })
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Pick exactly one baseline venue for `gender`. Returns `None` only when no
/// venue has enough athletes of that gender.
pub fn select_baseline(
    stats: &VenueStatistics,
    gender: Gender,
    min_count: usize,
    mode: &ReferenceVenue,
) -> Option<BaselineSelection> {
    let ranked = rank_venues(stats, gender, min_count);
    if ranked.is_empty() {
        return None;
    }
    let median_position = ranked.len() / 2;

    let (position, warning) = match mode {
        ReferenceVenue::Fastest => (0, None),
        ReferenceVenue::Median => (median_position, None),
        ReferenceVenue::Named(name) => match ranked.iter().position(|(v, _)| v == name) {
            Some(idx) => (idx, None),
            None => {
                let msg = format!(
                    "Reference venue '{}' has no valid {} statistics; using median-position venue",
                    name,
                    gender.label()
                );
                warn!("{}", msg);
                (median_position, Some(msg))
            }
        },
    };

    let venue = ranked[position].0.clone();
    let median_seconds = stats.get(&venue, gender)?.median_seconds;
    info!(
        "Baseline ({}): {} (position {} of {}, median {:.0}s)",
        gender.label(),
        venue,
        position + 1,
        ranked.len(),
        median_seconds
    );
    Some(BaselineSelection {
        venue,
        gender,
        median_seconds,
        position,
        candidates: ranked.len(),
        warning,
    })
}

/// Reuse an already chosen venue as the baseline for another gender, if that
/// gender has enough athletes there.
pub fn baseline_at(
    stats: &VenueStatistics,
    gender: Gender,
    venue: &str,
    min_count: usize,
) -> Option<BaselineSelection> {
    let ranked = rank_venues(stats, gender, min_count);
    let position = ranked.iter().position(|(v, _)| v == venue)?;
    let median_seconds = stats.get(venue, gender)?.median_seconds;
    Some(BaselineSelection {
        venue: venue.to_string(),
        gender,
        median_seconds,
        position,
        candidates: ranked.len(),
        warning: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::results::{ResultRecord, ResultSet};

    fn stats_for(venues: &[(&str, f64)]) -> VenueStatistics {
        let mut records = Vec::new();
        for (venue, time) in venues {
            for i in 0..3 {
                records.push(ResultRecord::new(venue, Gender::Men, &format!("{venue}-{i}"), *time));
            }
        }
        VenueStatistics::compute(&ResultSet::new(records))
    }

    #[test]
    fn median_mode_picks_middle_position() {
        let stats = stats_for(&[("A", 4000.0), ("B", 4200.0), ("C", 4400.0), ("D", 4600.0)]);
        let sel = select_baseline(&stats, Gender::Men, 1, &ReferenceVenue::Median).unwrap();
        // ⌊4/2⌋ = 2 → third-fastest
        assert_eq!(sel.venue, "C");
        assert_eq!(sel.position, 2);
        assert_eq!(sel.candidates, 4);
    }

    #[test]
    fn fastest_mode_picks_first() {
        let stats = stats_for(&[("A", 4400.0), ("B", 4200.0), ("C", 4600.0)]);
        let sel = select_baseline(&stats, Gender::Men, 1, &ReferenceVenue::Fastest).unwrap();
        assert_eq!(sel.venue, "B");
    }

    #[test]
    fn ties_break_on_venue_name() {
        let stats = stats_for(&[("Zurich", 4000.0), ("Amsterdam", 4000.0), ("Berlin", 4000.0)]);
        let ranked = rank_venues(&stats, Gender::Men, 1);
        let names: Vec<_> = ranked.iter().map(|(v, _)| v.as_str()).collect();
        assert_eq!(names, vec!["Amsterdam", "Berlin", "Zurich"]);
        let sel = select_baseline(&stats, Gender::Men, 1, &ReferenceVenue::Median).unwrap();
        assert_eq!(sel.venue, "Berlin");
    }

    #[test]
    fn explicit_venue_is_honoured() {
        let stats = stats_for(&[("A", 4000.0), ("B", 4200.0), ("C", 4400.0)]);
        let sel = select_baseline(&stats, Gender::Men, 1, &ReferenceVenue::Named("A".into())).unwrap();
        assert_eq!(sel.venue, "A");
        assert!(sel.warning.is_none());
    }

    #[test]
    fn missing_explicit_venue_falls_back_with_warning() {
        let stats = stats_for(&[("A", 4000.0), ("B", 4200.0), ("C", 4400.0)]);
        let sel =
            select_baseline(&stats, Gender::Men, 1, &ReferenceVenue::Named("Nowhere".into())).unwrap();
        assert_eq!(sel.venue, "B");
        assert!(sel.warning.unwrap().contains("Nowhere"));
    }

    #[test]
    fn no_eligible_venue_yields_none() {
        let stats = stats_for(&[("A", 4000.0)]);
        assert!(select_baseline(&stats, Gender::Men, 20, &ReferenceVenue::Median).is_none());
        assert!(select_baseline(&stats, Gender::Women, 1, &ReferenceVenue::Median).is_none());
    }

    #[test]
    fn reference_mode_parses() {
        assert_eq!("Fastest".parse::<ReferenceVenue>().unwrap(), ReferenceVenue::Fastest);
        assert_eq!("median".parse::<ReferenceVenue>().unwrap(), ReferenceVenue::Median);
        assert_eq!(
            "Maastricht 2025".parse::<ReferenceVenue>().unwrap(),
            ReferenceVenue::Named("Maastricht 2025".into())
        );
        assert!("  ".parse::<ReferenceVenue>().is_err());
    }
}
