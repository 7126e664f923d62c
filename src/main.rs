//! MES Bot - bar-driven futures decision engine
//!
//! Two entry points:
//! - `replay`: feed a CSV of 1-minute bars through the full pipeline
//!   against the in-process sim broker and print the event summary.
//! - `demo`: run a seeded synthetic session end to end.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mesbot_backend::engine::config::EngineConfig;
use mesbot_backend::engine::events::EventType;
use mesbot_backend::engine::price::Px;
use mesbot_backend::engine::runner::{MarketEvent, ReplayRunner};
use mesbot_backend::{Bar, Quote, Tick};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mesbot", about = "Bar-driven futures decision engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Starting account equity in USD.
    #[arg(long, default_value_t = 1000.0, global = true)]
    equity: f64,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a CSV of bars: ts,open,high,low,close,volume[,bid,ask]
    Replay {
        /// Path to the bar file.
        file: PathBuf,
    },
    /// Run a seeded synthetic session.
    Demo {
        /// RNG seed for the synthetic tape.
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Number of one-minute bars to synthesize.
        #[arg(long, default_value_t = 390)]
        bars: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,mesbot_backend=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::default()
        .normalize()
        .context("config normalization failed")?;
    info!(config_hash = %config.config_hash, "engine configured");

    let mut runner = ReplayRunner::new(config, cli.equity);
    let events = match cli.command {
        Command::Replay { file } => load_bar_file(&file, runner.tick_size())?,
        Command::Demo { seed, bars } => synthetic_session(seed, bars, runner.tick_size()),
    };

    let processed = runner.run(events);
    print_summary(&runner, processed);
    Ok(())
}

fn load_bar_file(path: &PathBuf, tick_size: f64) -> Result<Vec<MarketEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut events = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("ts") {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 6 {
            anyhow::bail!("line {}: expected at least 6 fields", line_no + 1);
        }
        let ts: DateTime<Utc> = fields[0]
            .parse()
            .with_context(|| format!("line {}: bad timestamp", line_no + 1))?;
        let parse = |i: usize| -> Result<f64> {
            fields[i]
                .parse::<f64>()
                .with_context(|| format!("line {}: bad number in field {}", line_no + 1, i))
        };
        let bar = Bar {
            timestamp: ts,
            open: Px::from_f64(parse(1)?, tick_size),
            high: Px::from_f64(parse(2)?, tick_size),
            low: Px::from_f64(parse(3)?, tick_size),
            close: Px::from_f64(parse(4)?, tick_size),
            volume: parse(5)? as u64,
            tick_count: 0,
            bid: fields.get(6).and_then(|f| f.parse::<f64>().ok()).map(|p| Px::from_f64(p, tick_size)),
            ask: fields.get(7).and_then(|f| f.parse::<f64>().ok()).map(|p| Px::from_f64(p, tick_size)),
        };
        events.push(MarketEvent::Bar(bar));
    }
    Ok(events)
}

/// Seeded random-walk tape starting at the 09:30 open.
fn synthetic_session(seed: u64, bars: u32, tick_size: f64) -> Vec<MarketEvent> {
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let open_ts = New_York
        .with_ymd_and_hms(2025, 3, 11, 9, 30, 0)
        .unwrap()
        .with_timezone(&Utc);

    let mut events = Vec::new();
    let mut price: f64 = 5600.0;
    for i in 0..bars {
        let ts = open_ts + chrono::Duration::minutes(i as i64);
        let drift: f64 = rng.gen_range(-3..=3) as f64 * tick_size;
        price += drift;
        events.push(MarketEvent::Quote(Quote {
            bid: Px::from_f64(price - tick_size, tick_size),
            ask: Px::from_f64(price, tick_size),
        }));
        // A few ticks inside the minute.
        for s in [5i64, 20, 40, 55] {
            let wiggle = rng.gen_range(-2..=2) as f64 * tick_size;
            events.push(MarketEvent::Tick(Tick {
                timestamp: ts + chrono::Duration::seconds(s),
                price: Px::from_f64(price + wiggle, tick_size),
                size: rng.gen_range(50..500),
            }));
        }
    }
    events
}

fn print_summary(runner: &ReplayRunner, processed: usize) {
    let sink = runner.orchestrator().sink();
    let count = |t: EventType| sink.of_type(t).len();
    println!("bars processed:     {processed}");
    println!("events emitted:     {}", sink.len());
    println!("  decisions:        {}", count(EventType::Decision));
    println!("  order intents:    {}", count(EventType::OrderIntent));
    println!("  fills:            {}", count(EventType::FillEvent));
    println!("  attributions:     {}", count(EventType::Attribution));
    println!("  learning updates: {}", count(EventType::LearningUpdate));
    let risk = runner.orchestrator().risk();
    println!("daily pnl:          ${:.2}", risk.daily_pnl);
    println!("daily trades:       {}", risk.daily_trades);
}
