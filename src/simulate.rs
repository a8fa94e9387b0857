//! Seeded synthetic result generator with known venue effects.
//!
//! `finish = gender base + athlete ability + venue effect + noise`, all in
//! seconds. The injected effects are returned alongside the results so the
//! model and the validator can be checked against ground truth.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use std::collections::BTreeMap;
use tracing::info;

use crate::model::{Gender, ResultRecord, ResultSet};

const CITIES: [&str; 14] = [
    "Amsterdam", "Berlin", "Chicago", "Dallas", "Glasgow", "Hamburg", "London", "Madrid",
    "Melbourne", "Paris", "Singapore", "Stockholm", "Toronto", "Vienna",
];

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub venues: usize,
    pub athletes_per_gender: usize,
    /// Share of athletes who race at two or three venues.
    pub repeat_fraction: f64,
    pub seed: u64,
    /// Venue effects are drawn uniformly from ±this many seconds.
    pub effect_spread_seconds: f64,
    pub ability_sd_seconds: f64,
    pub noise_sd_seconds: f64,
    /// Women's venue effect relative to men's at the same venue.
    pub women_effect_ratio: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            venues: 6,
            athletes_per_gender: 400,
            repeat_fraction: 0.4,
            seed: 42,
            effect_spread_seconds: 360.0,
            ability_sd_seconds: 420.0,
            noise_sd_seconds: 120.0,
            women_effect_ratio: 1.1,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.venues < 2 {
            anyhow::bail!("simulation needs at least 2 venues");
        }
        if self.athletes_per_gender == 0 {
            anyhow::bail!("athletes_per_gender must be positive");
        }
        if !(0.0..=1.0).contains(&self.repeat_fraction) {
            anyhow::bail!("repeat_fraction must be between 0.0 and 1.0");
        }
        if self.noise_sd_seconds <= 0.0 || self.ability_sd_seconds <= 0.0 {
            anyhow::bail!("standard deviations must be positive");
        }
        Ok(())
    }
}

pub struct SimulatedData {
    pub results: ResultSet,
    /// Injected additive effect per (venue, gender), in seconds.
    pub venue_effects: BTreeMap<(String, Gender), f64>,
}

fn venue_name(i: usize) -> String {
    let city = CITIES[i % CITIES.len()];
    match i / CITIES.len() {
        0 => format!("{} 2025", city),
        round => format!("{} 2025 #{}", city, round + 1),
    }
}

pub fn simulate(config: &SimulationConfig) -> Result<SimulatedData> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let ability = Normal::new(0.0, config.ability_sd_seconds)?;
    let noise = Normal::new(0.0, config.noise_sd_seconds)?;
    let season_start = NaiveDate::from_ymd_opt(2025, 1, 11).context("invalid season start")?;

    let venues: Vec<(String, NaiveDate, f64)> = (0..config.venues)
        .map(|i| {
            let effect = rng.gen_range(-config.effect_spread_seconds..=config.effect_spread_seconds);
            (venue_name(i), season_start + Duration::weeks(2 * i as i64), effect)
        })
        .collect();

    let mut venue_effects = BTreeMap::new();
    let mut records = Vec::new();
    let max_visits = config.venues.min(3);

    for gender in Gender::ALL {
        let (base, effect_scale) = match gender {
            Gender::Men => (4800.0, 1.0),
            Gender::Women => (5500.0, config.women_effect_ratio),
        };
        for (name, _, effect) in &venues {
            venue_effects.insert((name.clone(), gender), effect * effect_scale);
        }

        for a in 0..config.athletes_per_gender {
            let key = format!("{}-{:05}", gender, a);
            let athlete = base + ability.sample(&mut rng);
            let visits = if rng.gen_bool(config.repeat_fraction) {
                rng.gen_range(2..=max_visits)
            } else {
                1
            };
            for v in sample(&mut rng, venues.len(), visits).into_iter() {
                let (name, date, effect) = &venues[v];
                let finish = (athlete + effect * effect_scale + noise.sample(&mut rng)).max(1800.0);
                let mut record = ResultRecord::new(name, gender, &key, finish.round());
                record.event_date = Some(*date);
                records.push(record);
            }
        }
    }

    info!(
        "Simulated {} results across {} venues (seed {})",
        records.len(),
        venues.len(),
        config.seed
    );
    Ok(SimulatedData {
        results: ResultSet::new(records),
        venue_effects,
    })
}
