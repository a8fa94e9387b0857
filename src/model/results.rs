use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Competition category. Corrections are always computed per gender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Men,
    #[serde(rename = "W")]
    Women,
}

impl Gender {
    pub const ALL: [Gender; 2] = [Gender::Men, Gender::Women];

    /// Single-letter code used in storage and on the wire ("M" | "W").
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Men => "M",
            Gender::Women => "W",
        }
    }

    /// Plural label used in reports and JSON exports.
    pub fn label(&self) -> &'static str {
        match self {
            Gender::Men => "men",
            Gender::Women => "women",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" | "men" | "male" => Ok(Gender::Men),
            "w" | "women" | "female" | "f" => Ok(Gender::Women),
            other => anyhow::bail!("unrecognised gender '{}' (expected M or W)", other),
        }
    }
}

/// One athlete's cleaned result at one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub venue: String,
    pub gender: Gender,
    /// Unique per athlete within an event. Only stable across events when
    /// upstream had a birth date or bib to build it from.
    pub athlete_key: String,
    pub finish_seconds: f64,
    /// Only used to order an athlete's observations for display.
    pub event_date: Option<NaiveDate>,
}

impl ResultRecord {
    pub fn new(venue: &str, gender: Gender, athlete_key: &str, finish_seconds: f64) -> Self {
        ResultRecord {
            venue: venue.to_string(),
            gender,
            athlete_key: athlete_key.to_string(),
            finish_seconds,
            event_date: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.finish_seconds.is_finite()
            && self.finish_seconds > 0.0
            && !self.venue.trim().is_empty()
            && !self.athlete_key.trim().is_empty()
    }
}

/// Immutable collection of results for one analysis run.
///
/// Records with a non-positive or non-finite time are dropped on
/// construction, so every statistic downstream can assume `finish_seconds > 0`.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    records: Vec<ResultRecord>,
    rejected: usize,
}

impl ResultSet {
    pub fn new(records: impl IntoIterator<Item = ResultRecord>) -> Self {
        let mut kept = Vec::new();
        let mut rejected = 0usize;
        for record in records {
            if record.is_valid() {
                kept.push(record);
            } else {
                rejected += 1;
            }
        }
        if rejected > 0 {
            warn!("Dropped {} result(s) with missing or non-positive finish time", rejected);
        }
        ResultSet {
            records: kept,
            rejected,
        }
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of input rows excluded for failing validation.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn for_gender(&self, gender: Gender) -> impl Iterator<Item = &ResultRecord> {
        self.records.iter().filter(move |r| r.gender == gender)
    }

    /// Distinct venue names, sorted.
    pub fn venues(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.venue.as_str()).collect()
    }

    /// Distinct venues visited by each athlete, keyed per gender.
    pub fn venues_by_athlete(&self) -> BTreeMap<(Gender, &str), BTreeSet<&str>> {
        let mut map: BTreeMap<(Gender, &str), BTreeSet<&str>> = BTreeMap::new();
        for r in &self.records {
            map.entry((r.gender, r.athlete_key.as_str()))
                .or_default()
                .insert(r.venue.as_str());
        }
        map
    }

    /// Athletes with results at two or more distinct venues within one gender.
    ///
    /// This is a lower bound: athletes whose key was synthesised per event
    /// upstream cannot be matched across venues.
    pub fn repeat_athletes(&self) -> BTreeSet<(Gender, &str)> {
        self.venues_by_athlete()
            .into_iter()
            .filter(|(_, venues)| venues.len() >= 2)
            .map(|(key, _)| key)
            .collect()
    }
}
