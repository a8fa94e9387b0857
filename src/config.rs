use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::model::ReferenceVenue;

/// Venue course-correction model and time converter
#[derive(Parser, Debug, Clone)]
#[command(name = "course-correct", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, global = true, env = "DATABASE_PATH", default_value = "course_correct.db")]
    pub database_path: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Import cleaned results from a CSV file
    Import {
        /// CSV with venue, gender, athlete_key, finish_seconds[, event_date]
        #[arg(long)]
        input: PathBuf,

        /// Drop previously imported results first
        #[arg(long, default_value = "false")]
        replace: bool,
    },

    /// Fit corrections from stored results and publish the table
    Build {
        #[command(flatten)]
        model: ModelArgs,

        /// Also write the stats CSV and corrections JSON into this directory
        #[arg(long, env = "REPORT_DIR")]
        report_dir: Option<PathBuf>,
    },

    /// Serve the converter page and JSON API
    Serve {
        /// HTTP listen address
        #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:5000")]
        addr: String,
    },

    /// Export the published table and its diagnostics
    Report {
        /// Detailed per-venue statistics CSV
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Corrections JSON ({"men": {...}, "women": {...}})
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Generate a synthetic results CSV with known venue effects
    Simulate {
        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value = "6")]
        venues: usize,

        /// Athletes per gender
        #[arg(long, default_value = "400")]
        athletes: usize,

        /// Share of athletes racing more than one venue (0.0–1.0)
        #[arg(long, default_value = "0.4")]
        repeat_fraction: f64,

        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Compare one athlete's results across venues
    Compare {
        /// Athlete key as stored in the results table
        #[arg(long)]
        athlete: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Minimum athletes of one gender for a venue to be corrected
    #[arg(long, env = "MIN_ATHLETES_PER_VENUE", default_value = "20")]
    pub min_athletes_per_venue: usize,

    /// Minimum repeat athletes needed to fit the mixed-effects model
    #[arg(long, env = "MIN_REPEAT_ATHLETES", default_value = "10")]
    pub min_repeat_athletes: usize,

    /// Baseline venue: "fastest", "median" or a venue name
    #[arg(long, env = "REFERENCE_VENUE", default_value = "median")]
    pub reference_venue: ReferenceVenue,

    /// Pairwise validation tolerance in percentage points
    #[arg(long, env = "VALIDATION_TOLERANCE_PCT", default_value = "5.0")]
    pub validation_tolerance_pct: f64,

    /// Skip the mixed-effects model and use median differences only
    #[arg(long = "percentile-only", env = "FORCE_PERCENTILE", default_value = "false")]
    pub force_percentile: bool,

    /// Iteration cap for the variance optimizer
    #[arg(long, env = "MAX_ITERATIONS", default_value = "200")]
    pub max_iterations: usize,

    /// Mean men/women gap (percentage points) below which one shared factor is adequate
    #[arg(long, env = "GENDER_THRESHOLD_PCT", default_value = "2.0")]
    pub gender_threshold_pct: f64,
}

/// Thresholds for one model run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub min_athletes_per_venue: usize,
    pub min_repeat_athletes: usize,
    pub reference_venue: ReferenceVenue,
    pub validation_tolerance_pct: f64,
    pub force_percentile: bool,
    pub max_iterations: usize,
    pub gender_threshold_pct: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            min_athletes_per_venue: 20,
            min_repeat_athletes: 10,
            reference_venue: ReferenceVenue::Median,
            validation_tolerance_pct: 5.0,
            force_percentile: false,
            max_iterations: 200,
            gender_threshold_pct: 2.0,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_athletes_per_venue == 0 {
            anyhow::bail!("min_athletes_per_venue must be at least 1");
        }
        if self.min_repeat_athletes < 2 {
            anyhow::bail!("min_repeat_athletes must be at least 2");
        }
        if self.validation_tolerance_pct <= 0.0 {
            anyhow::bail!("validation_tolerance_pct must be positive");
        }
        if self.max_iterations == 0 {
            anyhow::bail!("max_iterations must be positive");
        }
        if self.gender_threshold_pct <= 0.0 {
            anyhow::bail!("gender_threshold_pct must be positive");
        }
        Ok(())
    }
}

impl From<ModelArgs> for ModelConfig {
    fn from(args: ModelArgs) -> Self {
        ModelConfig {
            min_athletes_per_venue: args.min_athletes_per_venue,
            min_repeat_athletes: args.min_repeat_athletes,
            reference_venue: args.reference_venue,
            validation_tolerance_pct: args.validation_tolerance_pct,
            force_percentile: args.force_percentile,
            max_iterations: args.max_iterations,
            gender_threshold_pct: args.gender_threshold_pct,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_path.trim().is_empty() {
            anyhow::bail!("DATABASE_PATH must not be empty");
        }
        match &self.command {
            Command::Build { model, .. } => ModelConfig::from(model.clone()).validate()?,
            Command::Simulate {
                venues,
                athletes,
                repeat_fraction,
                ..
            } => {
                if *venues < 2 {
                    anyhow::bail!("--venues must be at least 2");
                }
                if *athletes == 0 {
                    anyhow::bail!("--athletes must be positive");
                }
                if !(0.0..=1.0).contains(repeat_fraction) {
                    anyhow::bail!("--repeat-fraction must be between 0.0 and 1.0");
                }
            }
            Command::Serve { addr } => {
                if addr.parse::<std::net::SocketAddr>().is_err() {
                    anyhow::bail!("invalid SERVER_ADDR '{}'", addr);
                }
            }
            Command::Import { .. } | Command::Report { .. } | Command::Compare { .. } => {}
        }
        Ok(())
    }
}
