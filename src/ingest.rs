//! CSV boundary: cleaned result rows in, synthetic or exported rows out.
//!
//! Expected columns: `venue, gender, athlete_key` plus either
//! `finish_seconds` or `finish_time` (`H:MM:SS`), and optionally
//! `event_date` (`YYYY-MM-DD`). Rows that cannot be interpreted are skipped
//! and counted rather than failing the whole import.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, warn};

use crate::model::convert::{format_time, parse_time};
use crate::model::{Gender, ResultRecord, ResultSet};

#[derive(Debug, Deserialize)]
struct CsvRow {
    venue: String,
    gender: String,
    athlete_key: String,
    #[serde(alias = "finish_time_seconds")]
    finish_seconds: Option<f64>,
    finish_time: Option<String>,
    event_date: Option<String>,
}

impl CsvRow {
    fn into_record(self) -> Result<ResultRecord> {
        let gender: Gender = self.gender.parse()?;
        let finish_seconds = match (self.finish_seconds, self.finish_time.as_deref()) {
            (Some(secs), _) => secs,
            (None, Some(text)) if !text.trim().is_empty() => parse_time(text)? as f64,
            _ => anyhow::bail!("row has neither finish_seconds nor finish_time"),
        };
        let event_date = match self.event_date.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => Some(
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .with_context(|| format!("invalid event_date '{}'", d))?,
            ),
            _ => None,
        };
        let mut record = ResultRecord::new(self.venue.trim(), gender, self.athlete_key.trim(), finish_seconds);
        record.event_date = event_date;
        Ok(record)
    }
}

#[derive(Debug)]
pub struct Import {
    pub records: Vec<ResultRecord>,
    pub skipped: usize,
}

pub fn read_results<R: Read>(reader: R) -> Result<Import> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut records = Vec::new();
    let mut skipped = 0;
    for (i, row) in csv_reader.deserialize::<CsvRow>().enumerate() {
        let parsed = row.map_err(anyhow::Error::from).and_then(CsvRow::into_record);
        match parsed {
            Ok(record) if record.is_valid() => records.push(record),
            Ok(_) => {
                debug!("Row {}: non-positive finish time or empty key", i + 2);
                skipped += 1;
            }
            Err(e) => {
                debug!("Row {}: {}", i + 2, e);
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!("Skipped {} unusable CSV row(s)", skipped);
    }
    Ok(Import { records, skipped })
}

pub fn read_results_file(path: &Path) -> Result<Import> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    read_results(file)
}

pub fn write_results<W: Write>(results: &ResultSet, writer: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(["venue", "gender", "athlete_key", "finish_seconds", "finish_time", "event_date"])?;
    for r in results.records() {
        writer.write_record([
            r.venue.clone(),
            r.gender.to_string(),
            r.athlete_key.clone(),
            format!("{:.0}", r.finish_seconds),
            format_time(r.finish_seconds),
            r.event_date.map(|d| d.to_string()).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_results_file(results: &ResultSet, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_results(results, file)
}
