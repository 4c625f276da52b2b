use anyhow::{Context, Result};
use clap::Parser;
use shopload_core::{
    Config, HttpTransport, MockTransport, Orchestrator, PhaseOutcome, RampPlanner, RunContext,
    Transport,
};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shopload")]
#[command(about = "Shop API load test - drives listing and purchase clients and verifies every response")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Transport mode: mock or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// Target base URL (overrides config)
    #[arg(long)]
    base_url: Option<String>,

    /// Skip the warm-up phase
    #[arg(long)]
    skip_warmup: bool,

    /// Simulated latency of the mock transport in milliseconds
    #[arg(long, default_value = "5")]
    mock_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(base_url) = args.base_url {
        config.target.base_url = base_url;
        config.validate().context("Invalid --base-url")?;
    }

    init_logging(&config)?;

    info!("Target: {}", config.target.base_url);
    info!("Client profiles: {}", config.clients.len());

    let transport: Arc<dyn Transport> = match args.mode.as_str() {
        "mock" => Arc::new(MockTransport::new(args.mock_delay_ms)),
        "http" => Arc::new(
            HttpTransport::new(&config.target).context("Failed to create HTTP transport")?,
        ),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    info!("Using transport: {}", transport.name());
    print_ramp_schedule(&RampPlanner::new(config.ramp.clone()));

    let ctx = Arc::new(RunContext::new(transport, config.report.clone()));
    let orchestrator = Orchestrator::new(ctx, config.clients.clone());

    let start = Instant::now();
    let outcomes = orchestrator.run_all(&config, args.skip_warmup).await;
    info!("Run finished in {:.3}s", start.elapsed().as_secs_f64());

    print_summary(&outcomes);

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    Ok(())
}

fn print_ramp_schedule(planner: &RampPlanner) {
    println!("\n=== Ramp Schedule ===");
    println!("Total clients: {}", planner.total_clients());
    println!("Spawn duration: {}ms", planner.spawn_duration_ms());
    println!();

    for wave in planner.waves() {
        println!(
            "Wave {}: +{} clients at {}ms ({} total)",
            wave.index, wave.clients, wave.offset_ms, wave.cumulative
        );
    }
    println!();
}

fn print_summary(outcomes: &[PhaseOutcome]) {
    println!("\n=== Run Summary ===");
    for outcome in outcomes {
        let report = &outcome.report;
        println!(
            "{:<10} clients={:<6} requests={:<9} errors={:<6} transport_failures={:<6} duration={:.3}s",
            report.phase,
            outcome.spawned,
            report.total_requests,
            report.total_errors(),
            outcome.clients.transport_failures,
            outcome.duration.as_secs_f64()
        );
    }
    println!();
}
