mod display;
mod scenario;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use zzik_core::cell::{cell_boundary, cell_center, to_cell};
use zzik_core::{Coordinate, DEFAULT_RESOLUTION, EngineConfig, GeoPoint, HistoryEntry, distance_meters};
use zzik_guard::{FraudInput, assess, detect_fraud};

use crate::scenario::{Remotes, Scenario};

#[derive(Parser)]
#[command(name = "zzik", version, about = "Check-in fraud engine utilities")]
struct Cli {
    /// Engine config (JSON). Defaults apply for every missing key.
    #[arg(long, env = "ZZIK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spatial cell of a coordinate.
    #[command(allow_negative_numbers = true)]
    Cell {
        lat: f64,
        lng: f64,
        #[arg(long, default_value_t = DEFAULT_RESOLUTION)]
        resolution: u8,
        /// Also print the cell's boundary vertices.
        #[arg(long)]
        boundary: bool,
    },
    /// Great-circle distance in metres.
    #[command(allow_negative_numbers = true)]
    Distance {
        lat1: f64,
        lng1: f64,
        lat2: f64,
        lng2: f64,
    },
    /// Fraud-score one check-in attempt.
    #[command(allow_negative_numbers = true)]
    Score {
        lat: f64,
        lng: f64,
        /// GPS accuracy radius in metres.
        accuracy: f64,
        poi_lat: f64,
        poi_lng: f64,
        #[arg(long, requires_all = ["prev_lng", "prev_secs_ago"])]
        prev_lat: Option<f64>,
        #[arg(long)]
        prev_lng: Option<f64>,
        /// Seconds since the previous check-in.
        #[arg(long)]
        prev_secs_ago: Option<i64>,
    },
    /// Replay a scenario file through the check-in pipeline.
    Simulate {
        scenario: PathBuf,
        /// Persist to a DuckDB file instead of memory.
        #[arg(long)]
        db: Option<PathBuf>,
        /// External QR validation service.
        #[arg(long, env = "ZZIK_QR_URL")]
        qr_url: Option<String>,
        /// External streak service.
        #[arg(long, env = "ZZIK_STREAK_URL")]
        streak_url: Option<String>,
        /// Print outcomes as JSON lines instead of cards.
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_json_file(p)
            .with_context(|| format!("loading config {}", p.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn seconds_before(now: DateTime<Utc>, secs: i64) -> anyhow::Result<DateTime<Utc>> {
    Duration::try_seconds(secs)
        .and_then(|ago| now.checked_sub_signed(ago))
        .with_context(|| format!("--prev-secs-ago {secs} is out of range"))
}

#[cfg(feature = "http")]
fn remotes(qr_url: Option<String>, streak_url: Option<String>) -> anyhow::Result<Remotes> {
    use std::sync::Arc;
    use zzik_remote::{QrClient, StreakClient};
    use zzik_store::{QrVerifier, StreakHook};

    Ok(Remotes {
        qr: qr_url.map(|u| Arc::new(QrClient::new(&u)) as Arc<dyn QrVerifier>),
        streak: streak_url.map(|u| Arc::new(StreakClient::new(&u)) as Arc<dyn StreakHook>),
    })
}

#[cfg(not(feature = "http"))]
fn remotes(qr_url: Option<String>, streak_url: Option<String>) -> anyhow::Result<Remotes> {
    if qr_url.is_some() || streak_url.is_some() {
        anyhow::bail!("remote services need a build with the `http` feature");
    }
    Ok(Remotes::default())
}

async fn simulate(
    path: &Path,
    db: Option<&Path>,
    config: EngineConfig,
    remotes: Remotes,
    json: bool,
) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(path)?;
    let outcomes = match db {
        None => scenario::replay_in_memory(&scenario, config, remotes).await?,
        #[cfg(feature = "duckdb")]
        Some(db) => scenario::replay_duckdb(db, &scenario, config, remotes).await?,
        #[cfg(not(feature = "duckdb"))]
        Some(_) => anyhow::bail!("--db needs a build with the `duckdb` feature"),
    };

    for outcome in &outcomes {
        if json {
            println!("{}", serde_json::to_string(outcome)?);
        } else {
            display::print_outcome_card(outcome);
        }
    }
    if !json {
        println!("{}", display::summary_line(&outcomes));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(config = ?config, "engine config loaded");

    match cli.command {
        Command::Cell {
            lat,
            lng,
            resolution,
            boundary,
        } => {
            let cell = to_cell(lat, lng, resolution)?;
            let center = cell_center(&cell)?;
            println!("{cell}");
            println!("  center {:.6}, {:.6}", center.lat, center.lng);
            if boundary {
                for v in cell_boundary(&cell)? {
                    println!("  vertex {:.6}, {:.6}", v.lat, v.lng);
                }
            }
        }
        Command::Distance {
            lat1,
            lng1,
            lat2,
            lng2,
        } => {
            let a = GeoPoint::new(lat1, lng1)?;
            let b = GeoPoint::new(lat2, lng2)?;
            println!("{:.1} m", distance_meters(a, b));
        }
        Command::Score {
            lat,
            lng,
            accuracy,
            poi_lat,
            poi_lng,
            prev_lat,
            prev_lng,
            prev_secs_ago,
        } => {
            let now = Utc::now();
            let current = Coordinate {
                lat,
                lng,
                accuracy_m: accuracy,
                timestamp: now,
            };
            current.validate()?;
            let poi = GeoPoint::new(poi_lat, poi_lng)?;
            let previous = match (prev_lat, prev_lng, prev_secs_ago) {
                (Some(plat), Some(plng), Some(ago)) => Some(HistoryEntry {
                    location: GeoPoint::new(plat, plng)?,
                    checked_at: seconds_before(now, ago)?,
                    poi_id: String::new(),
                    fraud_score: None,
                    cell: None,
                }),
                _ => None,
            };
            let result = detect_fraud(&FraudInput {
                current,
                poi,
                poi_cell: None,
                previous: previous.as_ref(),
            });
            display::print_fraud_card(&result, &assess(result.score));
        }
        Command::Simulate {
            scenario,
            db,
            qr_url,
            streak_url,
            json,
        } => {
            let remotes = remotes(qr_url, streak_url)?;
            simulate(&scenario, db.as_deref(), config, remotes, json).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_offset_is_bounded() {
        let now = Utc::now();
        assert_eq!(seconds_before(now, 90).unwrap(), now - Duration::seconds(90));
        let err = seconds_before(now, i64::MAX).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
