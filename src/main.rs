use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tracing::{info, warn};

mod config;
mod db;
mod ingest;
mod model;
mod report;
mod simulate;
mod web;

use config::{Command, Config, ModelConfig};
use db::Database;
use model::run_model;
use simulate::{simulate, SimulationConfig};
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    match config.command {
        Command::Import { input, replace } => {
            let import = ingest::read_results_file(&input)?;
            let inserted = db.insert_results(&import.records, replace)?;
            info!(
                "Imported {} result(s) from {} ({} skipped)",
                inserted,
                input.display(),
                import.skipped
            );
        }

        Command::Build { model, report_dir } => {
            let model_config = ModelConfig::from(model);
            let results = db.load_results()?;
            if results.is_empty() {
                anyhow::bail!("no results stored; run `import` or `simulate` first");
            }
            info!(
                "Loaded {} result(s) across {} venue(s)",
                results.len(),
                results.venues().len()
            );

            let run = run_model(&results, &model_config)?;
            let run_id = db.replace_corrections(&run.table, &run.diagnostics)?;
            info!(
                "Published {} correction(s) as run {}",
                run.table.records().len(),
                run_id
            );
            println!("{}", report::summary_text(&run.table, &run.diagnostics));

            if let Some(dir) = report_dir {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                report::write_stats_csv_file(&run.stats, &run.table, &dir.join("venue_statistics.csv"))?;
                report::write_corrections_json_file(&run.table, &dir.join("corrections.json"))?;
                info!("Reports written to {}", dir.display());
            }
        }

        Command::Serve { addr } => {
            let summary = db.summary()?;
            if summary.corrections == 0 {
                warn!("No corrections published yet; run `build` first");
            }
            let app = web::router(AppState { db: db.clone() });
            let addr: SocketAddr = addr.parse()?;
            info!(
                "Converter listening on http://{} ({} corrections, {} results)",
                addr, summary.corrections, summary.results
            );
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }

        Command::Report { csv, json } => {
            let table = db.load_corrections()?;
            let run = db
                .latest_run()?
                .context("no model run has been published; run `build` first")?;
            println!("{}", report::summary_text(&table, &run.diagnostics));
            if let Some(path) = csv {
                let results = db.load_results()?;
                let stats = model::VenueStatistics::compute(&results);
                report::write_stats_csv_file(&stats, &table, &path)?;
                info!("Statistics written to {}", path.display());
            }
            if let Some(path) = json {
                report::write_corrections_json_file(&table, &path)?;
                info!("Corrections written to {}", path.display());
            }
        }

        Command::Simulate {
            output,
            venues,
            athletes,
            repeat_fraction,
            seed,
        } => {
            let data = simulate(&SimulationConfig {
                venues,
                athletes_per_gender: athletes,
                repeat_fraction,
                seed,
                ..Default::default()
            })?;
            ingest::write_results_file(&data.results, &output)?;
            for ((venue, gender), effect) in &data.venue_effects {
                info!("Injected effect {} ({}): {:+.0}s", venue, gender, effect);
            }
            info!("Wrote {} result(s) to {}", data.results.len(), output.display());
        }

        Command::Compare { athlete } => {
            let races = db.athlete_results(&athlete)?;
            if races.is_empty() {
                anyhow::bail!("no results found for athlete '{}'", athlete);
            }
            let table = db.load_corrections()?;
            let rows = report::athlete_comparison(&races, &table);
            println!("{}", report::comparison_text(&athlete, &rows));
        }
    }

    Ok(())
}
