use super::baseline::BaselineSelection;
use super::correction::{
    CorrectionModel, CorrectionRecord, Exclusion, GenderCorrections, ModelError, Strategy,
};
use super::results::ResultSet;
use super::stats::VenueStatistics;

/// Median-difference model: `correction = venue median - baseline median`.
///
/// Needs only within-venue aggregates, so it works on any dataset where the
/// baseline venue has enough athletes. No hypothesis test is performed.
pub struct PercentileModel {
    min_athletes: usize,
}

impl PercentileModel {
    pub fn new(min_athletes: usize) -> Self {
        PercentileModel { min_athletes }
    }
}

impl CorrectionModel for PercentileModel {
    fn strategy(&self) -> Strategy {
        Strategy::Percentile
    }

    fn compute(
        &self,
        results: &ResultSet,
        baseline: &BaselineSelection,
    ) -> Result<GenderCorrections, ModelError> {
        let gender = baseline.gender;
        let stats = VenueStatistics::compute(results);
        let base = stats
            .get(&baseline.venue, gender)
            .filter(|s| s.count >= self.min_athletes)
            .ok_or_else(|| ModelError::InsufficientBaseline {
                venue: baseline.venue.clone(),
                gender,
            })?;

        let mut out = GenderCorrections::default();
        for stat in stats.for_gender(gender) {
            if stat.count < self.min_athletes {
                out.excluded.push(Exclusion {
                    venue: stat.venue.clone(),
                    gender,
                    count: stat.count,
                    reason: format!("insufficient data (n < {})", self.min_athletes),
                });
                continue;
            }
            out.records.push(CorrectionRecord {
                venue: stat.venue.clone(),
                gender,
                correction_seconds: stat.median_seconds - base.median_seconds,
                ci_low: None,
                ci_high: None,
                p_value: None,
                sample_size: stat.count,
                strategy: self.strategy(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::baseline::{select_baseline, ReferenceVenue};
    use crate::model::results::{Gender, ResultRecord};
    use approx::assert_relative_eq;

    fn venue_rows(venue: &str, gender: Gender, n: usize, median: f64) -> Vec<ResultRecord> {
        (0..n)
            .map(|i| {
                let offset = (i as f64 - (n / 2) as f64) * 5.0;
                ResultRecord::new(venue, gender, &format!("{venue}{gender}{i}"), median + offset)
            })
            .collect()
    }

    #[test]
    fn scenario_corrections_relative_to_baseline() {
        let mut rows = venue_rows("Venue A", Gender::Men, 21, 4200.0);
        rows.extend(venue_rows("Venue B", Gender::Men, 21, 4800.0));
        let set = ResultSet::new(rows);
        let stats = VenueStatistics::compute(&set);
        let baseline = select_baseline(&stats, Gender::Men, 20, &ReferenceVenue::Named("Venue B".into())).unwrap();

        let out = PercentileModel::new(20).compute(&set, &baseline).unwrap();
        let a = out.records.iter().find(|r| r.venue == "Venue A").unwrap();
        let b = out.records.iter().find(|r| r.venue == "Venue B").unwrap();
        assert_relative_eq!(a.correction_seconds, -600.0);
        assert_relative_eq!(b.correction_seconds, 0.0);
        assert!(a.p_value.is_none());
        assert_eq!(a.sample_size, 21);
    }

    #[test]
    fn venue_below_threshold_is_excluded() {
        let mut rows = venue_rows("Big", Gender::Men, 30, 4500.0);
        rows.extend(venue_rows("Small", Gender::Men, 5, 4000.0));
        let set = ResultSet::new(rows);
        let stats = VenueStatistics::compute(&set);
        let baseline = select_baseline(&stats, Gender::Men, 20, &ReferenceVenue::Median).unwrap();

        let out = PercentileModel::new(20).compute(&set, &baseline).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.excluded.len(), 1);
        assert_eq!(out.excluded[0].venue, "Small");
        assert_eq!(out.excluded[0].count, 5);
    }

    #[test]
    fn thin_baseline_is_rejected() {
        let set = ResultSet::new(venue_rows("Small", Gender::Women, 5, 5000.0));
        let baseline = BaselineSelection {
            venue: "Small".into(),
            gender: Gender::Women,
            median_seconds: 5000.0,
            position: 0,
            candidates: 1,
            warning: None,
        };
        let err = PercentileModel::new(20).compute(&set, &baseline).unwrap_err();
        assert!(matches!(err, ModelError::InsufficientBaseline { .. }));
    }
}
