//! Per-venue, per-gender descriptive statistics.
//!
//! Medians are true statistical medians: for an even count the two middle
//! order statistics are averaged. Baseline selection, the percentile model
//! and reports all read medians from here so the convention never diverges.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::results::{Gender, ResultSet};

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance (n - 1 denominator). Needs at least two values.
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some(ss / (values.len() - 1) as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueGenderStat {
    pub venue: String,
    pub gender: Gender,
    pub count: usize,
    pub median_seconds: f64,
    pub mean_seconds: f64,
    /// `None` for a single observation.
    pub std_seconds: Option<f64>,
}

impl VenueGenderStat {
    fn from_times(venue: &str, gender: Gender, times: &[f64]) -> Option<Self> {
        Some(VenueGenderStat {
            venue: venue.to_string(),
            gender,
            count: times.len(),
            median_seconds: median(times)?,
            mean_seconds: mean(times)?,
            std_seconds: sample_variance(times).map(f64::sqrt),
        })
    }
}

/// Statistics recomputed from scratch on every run; only ever exported as a
/// diagnostic, never treated as a source of truth.
#[derive(Debug, Clone, Default)]
pub struct VenueStatistics {
    stats: BTreeMap<(String, Gender), VenueGenderStat>,
    overall_medians: BTreeMap<String, f64>,
}

impl VenueStatistics {
    pub fn compute(results: &ResultSet) -> Self {
        let mut grouped: BTreeMap<(String, Gender), Vec<f64>> = BTreeMap::new();
        let mut by_venue: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for r in results.records() {
            grouped
                .entry((r.venue.clone(), r.gender))
                .or_default()
                .push(r.finish_seconds);
            by_venue
                .entry(r.venue.clone())
                .or_default()
                .push(r.finish_seconds);
        }

        let stats = grouped
            .into_iter()
            .filter_map(|((venue, gender), times)| {
                let stat = VenueGenderStat::from_times(&venue, gender, &times)?;
                Some(((venue, gender), stat))
            })
            .collect();
        let overall_medians = by_venue
            .into_iter()
            .filter_map(|(venue, times)| median(&times).map(|m| (venue, m)))
            .collect();

        VenueStatistics {
            stats,
            overall_medians,
        }
    }

    pub fn get(&self, venue: &str, gender: Gender) -> Option<&VenueGenderStat> {
        self.stats.get(&(venue.to_string(), gender))
    }

    /// Every (venue, gender) pair present, ordered by venue then gender.
    pub fn all(&self) -> impl Iterator<Item = &VenueGenderStat> {
        self.stats.values()
    }

    pub fn for_gender(&self, gender: Gender) -> impl Iterator<Item = &VenueGenderStat> {
        self.stats.values().filter(move |s| s.gender == gender)
    }

    /// Pairs with enough athletes to take part in modelling.
    pub fn eligible(
        &self,
        gender: Gender,
        min_count: usize,
    ) -> impl Iterator<Item = &VenueGenderStat> {
        self.for_gender(gender).filter(move |s| s.count >= min_count)
    }

    /// Median over both genders combined; the baseline ranking statistic.
    pub fn overall_median(&self, venue: &str) -> Option<f64> {
        self.overall_medians.get(venue).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::results::ResultRecord;
    use approx::assert_relative_eq;

    #[test]
    fn median_averages_middle_pair() {
        assert_eq!(median(&[]), None);
        assert_relative_eq!(median(&[3.0]).unwrap(), 3.0);
        assert_relative_eq!(median(&[3800.0, 3600.0]).unwrap(), 3700.0);
        assert_relative_eq!(median(&[5.0, 1.0, 3.0]).unwrap(), 3.0);
        assert_relative_eq!(median(&[4.0, 1.0, 3.0, 2.0]).unwrap(), 2.5);
    }

    #[test]
    fn sample_variance_uses_n_minus_one() {
        assert_eq!(sample_variance(&[1.0]), None);
        assert_relative_eq!(sample_variance(&[1.0, 3.0]).unwrap(), 2.0);
    }

    #[test]
    fn computes_per_venue_gender_and_overall() {
        let set = ResultSet::new(vec![
            ResultRecord::new("Venue A", Gender::Men, "a", 3600.0),
            ResultRecord::new("Venue A", Gender::Women, "b", 3800.0),
            ResultRecord::new("Venue B", Gender::Men, "c", 4000.0),
            ResultRecord::new("Venue B", Gender::Women, "d", 4200.0),
        ]);
        let stats = VenueStatistics::compute(&set);
        assert_eq!(stats.all().count(), 4);
        assert_relative_eq!(stats.overall_median("Venue A").unwrap(), 3700.0);

        let a_men = stats.get("Venue A", Gender::Men).unwrap();
        assert_eq!(a_men.count, 1);
        assert_relative_eq!(a_men.median_seconds, 3600.0);
        assert_eq!(a_men.std_seconds, None);
        assert!(stats.get("Venue C", Gender::Men).is_none());
    }

    #[test]
    fn eligibility_threshold_is_inclusive() {
        let mut records = Vec::new();
        for i in 0..20 {
            records.push(ResultRecord::new("Big", Gender::Men, &format!("b{i}"), 4000.0 + i as f64));
        }
        for i in 0..5 {
            records.push(ResultRecord::new("Small", Gender::Men, &format!("s{i}"), 4000.0 + i as f64));
        }
        let stats = VenueStatistics::compute(&ResultSet::new(records));
        let eligible: Vec<_> = stats.eligible(Gender::Men, 20).map(|s| s.venue.as_str()).collect();
        assert_eq!(eligible, vec!["Big"]);
        assert_eq!(stats.eligible(Gender::Men, 5).count(), 2);
    }
}
