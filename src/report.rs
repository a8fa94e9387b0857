//! Human-readable and exported views of a correction run.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::model::convert::format_time;
use crate::model::{CorrectionTable, Gender, ResultRecord, RunDiagnostics, VenueStatistics};

/// Signed `+M:SS` offset, e.g. `-10:00` or `+4:05`.
pub fn format_offset(seconds: f64) -> String {
    let total = seconds.round() as i64;
    let sign = if total < 0 { "-" } else { "+" };
    let total = total.abs();
    format!("{}{}:{:02}", sign, total / 60, total % 60)
}

/// Men vs. women side by side, followed by run diagnostics.
pub fn summary_text(table: &CorrectionTable, diagnostics: &RunDiagnostics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "=".repeat(72));
    let _ = writeln!(out, "VENUE COURSE CORRECTIONS");
    let _ = writeln!(out, "{}", "=".repeat(72));
    for b in table.baselines() {
        let _ = write!(
            out,
            "Baseline ({}): {} (median {}, position {} of {})",
            b.gender.label(),
            b.venue,
            format_time(b.median_seconds),
            b.position + 1,
            b.candidates
        );
        match diagnostics.for_gender(b.gender) {
            Some(g) => {
                let _ = writeln!(out, " via {}", g.strategy);
            }
            None => {
                let _ = writeln!(out);
            }
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "{:<28} {:>10} {:>10} {:>10}", "Venue", "Men", "Women", "Diff");
    let _ = writeln!(out, "{}", "-".repeat(72));

    let venues: BTreeSet<&str> = table.records().iter().map(|r| r.venue.as_str()).collect();
    let mut diffs = Vec::new();
    for venue in &venues {
        let men = table.correction(venue, Gender::Men);
        let women = table.correction(venue, Gender::Women);
        let cell = |c: Option<f64>| c.map(format_offset).unwrap_or_else(|| "n/a".into());
        let diff = match (men, women) {
            (Some(m), Some(w)) => {
                diffs.push((m - w).abs());
                format_offset((m - w).abs()).trim_start_matches('+').to_string()
            }
            _ => "".into(),
        };
        let _ = writeln!(out, "{:<28} {:>10} {:>10} {:>10}", venue, cell(men), cell(women), diff);
    }
    if !diffs.is_empty() {
        let avg = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let max = diffs.iter().cloned().fold(0.0, f64::max);
        let _ = writeln!(out, "{}", "-".repeat(72));
        let _ = writeln!(
            out,
            "Average men/women difference: {:.0}s, maximum: {:.0}s",
            avg, max
        );
    }

    let _ = writeln!(out);
    for g in &diagnostics.genders {
        let _ = write!(out, "{}: {} ({} venues)", g.gender.label(), g.strategy, g.venues);
        if let Some(reason) = &g.fallback_reason {
            let _ = write!(out, ", fallback because {}", reason);
        }
        let _ = writeln!(out);
        for ex in &g.excluded {
            let _ = writeln!(out, "  excluded {} (n={}): {}", ex.venue, ex.count, ex.reason);
        }
    }
    if let Some(v) = &diagnostics.validation {
        let _ = writeln!(
            out,
            "Validation: {} repeat athletes (lower bound), variance {:.0} -> {:.0} ({:.1}% reduction), {}/{} pairs within {:.1}pp",
            v.athletes,
            v.raw_variance,
            v.adjusted_variance,
            v.variance_reduction_pct,
            v.pairs_within_tolerance,
            v.pairs_checked,
            v.tolerance_pct
        );
    }
    if let Some(c) = &diagnostics.gender_consistency {
        let _ = writeln!(
            out,
            "Gender consistency: mean {:.2}pp, max {:.2}pp, recommendation {:?}",
            c.mean_difference_pct, c.max_difference_pct, c.recommendation
        );
    }
    for w in &diagnostics.warnings {
        let _ = writeln!(out, "warning: {}", w);
    }
    out
}

/// One row per (venue, gender) with statistics and the published correction.
pub fn write_stats_csv<W: Write>(stats: &VenueStatistics, table: &CorrectionTable, writer: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record([
        "venue",
        "gender",
        "count",
        "median_seconds",
        "mean_seconds",
        "std_seconds",
        "correction_seconds",
        "correction_minutes",
    ])?;
    for s in stats.all() {
        let corr = table.correction(&s.venue, s.gender);
        writer.write_record([
            s.venue.clone(),
            s.gender.to_string(),
            s.count.to_string(),
            format!("{:.1}", s.median_seconds),
            format!("{:.1}", s.mean_seconds),
            s.std_seconds.map(|v| format!("{:.1}", v)).unwrap_or_default(),
            corr.map(|c| format!("{:.1}", c)).unwrap_or_default(),
            corr.map(|c| format!("{:.2}", c / 60.0)).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_stats_csv_file(stats: &VenueStatistics, table: &CorrectionTable, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_stats_csv(stats, table, file)
}

/// `{"men": {venue: seconds}, "women": {venue: seconds}}`
pub fn corrections_json(table: &CorrectionTable) -> Value {
    let by_gender = |gender: Gender| {
        let map: Map<String, Value> = table
            .for_gender(gender)
            .map(|r| (r.venue.clone(), json!(r.correction_seconds)))
            .collect();
        Value::Object(map)
    };
    json!({
        "men": by_gender(Gender::Men),
        "women": by_gender(Gender::Women),
    })
}

pub fn write_corrections_json_file(table: &CorrectionTable, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, &corrections_json(table))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub venue: String,
    pub event_date: Option<chrono::NaiveDate>,
    pub raw_seconds: f64,
    pub correction_seconds: Option<f64>,
    /// Baseline-equivalent time; `None` for venues without a correction.
    pub adjusted_seconds: Option<f64>,
    /// Gap to the athlete's best adjusted time.
    pub vs_best_seconds: Option<f64>,
}

/// An athlete's results in input order with corrections applied.
pub fn athlete_comparison(results: &[ResultRecord], table: &CorrectionTable) -> Vec<ComparisonRow> {
    let mut rows: Vec<ComparisonRow> = results
        .iter()
        .map(|r| {
            let correction = table.correction(&r.venue, r.gender);
            ComparisonRow {
                venue: r.venue.clone(),
                event_date: r.event_date,
                raw_seconds: r.finish_seconds,
                correction_seconds: correction,
                adjusted_seconds: correction.map(|c| r.finish_seconds - c),
                vs_best_seconds: None,
            }
        })
        .collect();
    let best = rows
        .iter()
        .filter_map(|r| r.adjusted_seconds)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
    if let Some(best) = best {
        for row in &mut rows {
            row.vs_best_seconds = row.adjusted_seconds.map(|a| a - best);
        }
    }
    rows
}

pub fn comparison_text(athlete: &str, rows: &[ComparisonRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ATHLETE COMPARISON: {}", athlete);
    let _ = writeln!(
        out,
        "{:<12} {:<24} {:>9} {:>9} {:>9} {:>9}",
        "Date", "Venue", "Raw", "Adjusted", "Effect", "vs Best"
    );
    for r in rows {
        let date = r.event_date.map(|d| d.to_string()).unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<12} {:<24} {:>9} {:>9} {:>9} {:>9}",
            date,
            r.venue,
            format_time(r.raw_seconds),
            r.adjusted_seconds.map(format_time).unwrap_or_else(|| "n/a".into()),
            r.correction_seconds.map(format_offset).unwrap_or_default(),
            r.vs_best_seconds.map(format_offset).unwrap_or_default(),
        );
    }
    let adjusted: Vec<f64> = rows.iter().filter_map(|r| r.adjusted_seconds).collect();
    if !adjusted.is_empty() {
        let best = adjusted.iter().cloned().fold(f64::INFINITY, f64::min);
        let worst = adjusted.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = adjusted.iter().sum::<f64>() / adjusted.len() as f64;
        let venues: BTreeSet<&str> = rows.iter().map(|r| r.venue.as_str()).collect();
        let _ = writeln!(
            out,
            "Best adjusted {}, worst {}, average {} over {} events at {} venues",
            format_time(best),
            format_time(worst),
            format_time(avg),
            rows.len(),
            venues.len()
        );
    }
    out
}
