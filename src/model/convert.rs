//! Finish-time parsing/formatting and conversion between venues.

use serde::Serialize;
use thiserror::Error;

use super::correction::CorrectionTable;
use super::results::Gender;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConvertError {
    #[error("invalid time format '{0}', expected HH:MM:SS or MM:SS")]
    InvalidTimeFormat(String),
    #[error("unknown venue '{venue}' for {gender}")]
    UnknownVenue { venue: String, gender: Gender },
    #[error("gender is required (M or W)")]
    MissingGender,
}

impl ConvertError {
    /// Stable machine-readable error kind for API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::InvalidTimeFormat(_) => "InvalidTimeFormat",
            ConvertError::UnknownVenue { .. } => "UnknownVenue",
            ConvertError::MissingGender => "MissingGender",
        }
    }
}

/// Parse `HH:MM:SS` or `MM:SS` into seconds. Minutes may exceed 59 in the
/// two-part form (`90:00`).
pub fn parse_time(input: &str) -> Result<u32, ConvertError> {
    let invalid = || ConvertError::InvalidTimeFormat(input.to_string());
    let parts = input
        .trim()
        .split(':')
        .map(|p| {
            let p = p.trim();
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            p.parse::<u32>().map_err(|_| invalid())
        })
        .collect::<Result<Vec<u32>, _>>()?;

    let total = match parts.as_slice() {
        [h, m, s] => h
            .checked_mul(3600)
            .and_then(|h| m.checked_mul(60).and_then(|m| h.checked_add(m)))
            .and_then(|hm| hm.checked_add(*s)),
        [m, s] => m.checked_mul(60).and_then(|m| m.checked_add(*s)),
        _ => None,
    };
    total.ok_or_else(invalid)
}

/// `H:MM:SS`, rounded to the nearest second, `-` prefixed when negative.
pub fn format_time(seconds: f64) -> String {
    let total = seconds.round() as i64;
    let sign = if total < 0 { "-" } else { "" };
    let total = total.abs();
    format!("{}{}:{:02}:{:02}", sign, total / 3600, (total % 3600) / 60, total % 60)
}

/// Display percentage for a correction. Inverted so that a fast venue
/// (negative correction) reads as a positive percentage to add.
pub fn correction_percentage(correction_seconds: f64, baseline_median_seconds: f64) -> f64 {
    if baseline_median_seconds == 0.0 {
        return 0.0;
    }
    -(correction_seconds / baseline_median_seconds) * 100.0
}

pub fn format_correction(percentage: f64) -> String {
    if percentage.abs() < 0.05 {
        return "0.0%".to_string();
    }
    let sign = if percentage > 0.0 { "+" } else { "" };
    format!("{}{:.1}%", sign, percentage)
}

/// Where a converted time should be expressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Baseline-equivalent time.
    Normalized,
    Venue(String),
}

impl Target {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.eq_ignore_ascii_case("normalized") {
            Target::Normalized
        } else {
            Target::Venue(s.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversion {
    pub gender: Gender,
    pub from_venue: String,
    pub to_venue: String,
    pub original_seconds: f64,
    pub converted_seconds: f64,
    pub from_correction_seconds: f64,
    pub to_correction_seconds: f64,
}

impl Conversion {
    /// Signed: converted minus original.
    pub fn difference_seconds(&self) -> f64 {
        self.converted_seconds - self.original_seconds
    }

    pub fn faster(&self) -> bool {
        self.difference_seconds() < 0.0
    }
}

/// Additive conversion over a published correction table:
/// `normalized = raw - correction(from)`, `converted = normalized + correction(to)`.
pub struct TimeConverter<'a> {
    table: &'a CorrectionTable,
}

impl<'a> TimeConverter<'a> {
    pub fn new(table: &'a CorrectionTable) -> Self {
        TimeConverter { table }
    }

    fn lookup(&self, venue: &str, gender: Gender) -> Result<f64, ConvertError> {
        self.table
            .correction(venue, gender)
            .ok_or_else(|| ConvertError::UnknownVenue {
                venue: venue.to_string(),
                gender,
            })
    }

    pub fn convert(
        &self,
        raw_seconds: f64,
        from_venue: &str,
        target: &Target,
        gender: Option<Gender>,
    ) -> Result<Conversion, ConvertError> {
        let gender = gender.ok_or(ConvertError::MissingGender)?;
        let from_correction = self.lookup(from_venue, gender)?;
        let (to_venue, to_correction) = match target {
            Target::Normalized => {
                let label = self
                    .table
                    .baseline(gender)
                    .map(|b| format!("Normalized ({})", b.venue))
                    .unwrap_or_else(|| "Normalized".to_string());
                (label, 0.0)
            }
            Target::Venue(venue) => (venue.clone(), self.lookup(venue, gender)?),
        };
        let normalized = raw_seconds - from_correction;
        Ok(Conversion {
            gender,
            from_venue: from_venue.to_string(),
            to_venue,
            original_seconds: raw_seconds,
            converted_seconds: normalized + to_correction,
            from_correction_seconds: from_correction,
            to_correction_seconds: to_correction,
        })
    }

    /// Convert user input. An absent or unrecognised gender is `MissingGender`.
    pub fn convert_str(
        &self,
        finish_time: &str,
        from_venue: &str,
        to_venue: &str,
        gender: Option<&str>,
    ) -> Result<Conversion, ConvertError> {
        let raw = parse_time(finish_time)?;
        let gender = gender.and_then(|g| g.parse::<Gender>().ok());
        self.convert(raw as f64, from_venue, &Target::parse(to_venue), gender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::baseline::BaselineSelection;
    use crate::model::correction::{CorrectionRecord, Strategy};
    use approx::assert_relative_eq;

    fn table() -> CorrectionTable {
        let rec = |venue: &str, gender, corr| CorrectionRecord {
            venue: String::from(venue),
            gender,
            correction_seconds: corr,
            ci_low: None,
            ci_high: None,
            p_value: None,
            sample_size: 40,
            strategy: Strategy::Percentile,
        };
        CorrectionTable::new(
            vec![
                rec("A", Gender::Men, -600.0),
                rec("B", Gender::Men, 0.0),
                rec("C", Gender::Men, 240.0),
                rec("A", Gender::Women, -650.0),
                rec("B", Gender::Women, 0.0),
            ],
            vec![BaselineSelection {
                venue: "B".into(),
                gender: Gender::Men,
                median_seconds: 4800.0,
                position: 1,
                candidates: 3,
                warning: None,
            }],
        )
    }

    #[test]
    fn parses_both_formats() {
        assert_eq!(parse_time("1:15:30").unwrap(), 4530);
        assert_eq!(parse_time(" 45:30 ").unwrap(), 2730);
        assert_eq!(parse_time("90:00").unwrap(), 5400);
        assert_eq!(parse_time("00:00:00").unwrap(), 0);
    }

    #[test]
    fn rejects_malformed_times() {
        for bad in ["", "1:2:3:4", "abc", "-1:00", "1:xx", "75", "1::00", "1.5:00"] {
            assert_eq!(
                parse_time(bad).unwrap_err(),
                ConvertError::InvalidTimeFormat(bad.to_string()),
                "{bad}"
            );
        }
    }

    #[test]
    fn formats_times() {
        assert_eq!(format_time(4530.0), "1:15:30");
        assert_eq!(format_time(2730.4), "0:45:30");
        assert_eq!(format_time(-125.0), "-0:02:05");
        assert_eq!(format_time(36000.0), "10:00:00");
    }

    #[test]
    fn normalizes_fast_venue_time() {
        let t = table();
        let conv = TimeConverter::new(&t)
            .convert_str("1:10:00", "A", "normalized", Some("M"))
            .unwrap();
        assert_relative_eq!(conv.converted_seconds, 4800.0);
        assert_eq!(format_time(conv.converted_seconds), "1:20:00");
        assert!(!conv.faster());
        assert_eq!(conv.to_venue, "Normalized (B)");
    }

    #[test]
    fn converts_between_venues_and_back() {
        let t = table();
        let conv = TimeConverter::new(&t);
        let there = conv.convert(4200.0, "A", &Target::Venue("C".into()), Some(Gender::Men)).unwrap();
        assert_relative_eq!(there.converted_seconds, 5040.0);
        let back = conv
            .convert(there.converted_seconds, "C", &Target::Venue("A".into()), Some(Gender::Men))
            .unwrap();
        assert_relative_eq!(back.converted_seconds, 4200.0);
        assert!(back.faster());
    }

    #[test]
    fn unknown_venue_and_gender_errors() {
        let t = table();
        let conv = TimeConverter::new(&t);
        let err = conv.convert_str("1:10:00", "Nowhere", "normalized", Some("M")).unwrap_err();
        assert_eq!(err.kind(), "UnknownVenue");
        // C has no women's correction.
        let err = conv.convert_str("1:10:00", "A", "C", Some("W")).unwrap_err();
        assert_eq!(
            err,
            ConvertError::UnknownVenue {
                venue: "C".into(),
                gender: Gender::Women
            }
        );
        assert_eq!(
            conv.convert_str("1:10:00", "A", "B", None).unwrap_err(),
            ConvertError::MissingGender
        );
        assert_eq!(
            conv.convert_str("1:10:00", "A", "B", Some("x")).unwrap_err().kind(),
            "MissingGender"
        );
        assert_eq!(
            conv.convert_str("soon", "A", "B", Some("M")).unwrap_err().kind(),
            "InvalidTimeFormat"
        );
    }

    #[test]
    fn blank_target_is_an_unknown_venue() {
        let t = table();
        let conv = TimeConverter::new(&t);
        assert_eq!(Target::parse("  "), Target::Venue(String::new()));
        assert_eq!(Target::parse("Normalized"), Target::Normalized);
        let err = conv.convert_str("1:10:00", "A", "", Some("M")).unwrap_err();
        assert_eq!(
            err,
            ConvertError::UnknownVenue {
                venue: String::new(),
                gender: Gender::Men
            }
        );
    }

    #[test]
    fn percentage_display() {
        assert_relative_eq!(correction_percentage(-754.0, 4800.0), 15.7083, epsilon = 1e-4);
        assert_relative_eq!(correction_percentage(100.0, 0.0), 0.0);
        assert_eq!(format_correction(15.7), "+15.7%");
        assert_eq!(format_correction(-8.8), "-8.8%");
        assert_eq!(format_correction(0.02), "0.0%");
        assert_eq!(format_correction(correction_percentage(421.5, 4800.0)), "-8.8%");
    }
}
