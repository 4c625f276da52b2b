use anyhow::{Context, Result};
use clap::Parser;
use shopload_core::{
    listing_for, verify_listing, verify_purchase, Config, ContentType, Endpoint, HttpTransport,
    Outcome, Request, RunContext, TargetConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Preflight checks for a shop load run (URL sanity and response contract)")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Target base URL (overrides config)
    #[arg(long)]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(base_url) = args.base_url {
        cfg.target.base_url = base_url;
    }

    info!("Validating target base URL...");
    let base = validate_base_url(&cfg.target.base_url)
        .with_context(|| format!("Invalid target.base_url: {}", cfg.target.base_url))?;

    let transport = HttpTransport::new(&cfg.target).context("Failed to build HTTP transport")?;
    let ctx = RunContext::new(Arc::new(transport), cfg.report.clone());
    let driver = ctx.driver();

    println!();
    println!("=== Preflight ({}) ===", base.as_str().trim_end_matches('/'));

    let mut failures = 0u64;

    let listing = driver.send(&Request::get(Endpoint::Listing)).await;
    if !check("GET /", &listing, verify_listing("", &listing)) {
        failures = failures.saturating_add(1);
    }

    // Probe both encodings with the first anonymous item.
    let item = listing_for("").items.remove(0);
    let payload = serde_json::to_string(&item)?;
    for content_type in [ContentType::Form, ContentType::Multipart] {
        let label = format!("POST /buy ({})", content_type.mime());
        let outcome = driver
            .send(&Request::post(Endpoint::Purchase, content_type, payload.clone()))
            .await;
        if !check(&label, &outcome, verify_purchase(&item.name, &outcome)) {
            failures = failures.saturating_add(1);
        }
    }

    if failures > 0 {
        anyhow::bail!("Preflight failed: {failures} contract check(s) failed");
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

fn check(
    label: &str,
    outcome: &Outcome,
    verdict: Result<(), shopload_core::VerificationError>,
) -> bool {
    match (outcome, verdict) {
        (Err(e), _) => {
            println!("{:<50} -> ERROR", label);
            warn!("Request failed: {} error={}", label, e);
            false
        }
        (Ok(response), Ok(())) => {
            println!(
                "{:<50} -> {} ({}ms)",
                label,
                response.status,
                response.elapsed.as_millis()
            );
            true
        }
        (Ok(response), Err(err)) => {
            println!(
                "{:<50} -> {} MISMATCH ({}ms)",
                label,
                response.status,
                response.elapsed.as_millis()
            );
            warn!("Contract violation: {}", err);
            false
        }
    }
}

fn validate_base_url(raw: &str) -> Result<url::Url> {
    let url = TargetConfig::new(raw).validate_base_url()?;
    if !url.username().is_empty() || url.password().is_some() {
        anyhow::bail!("Base URL must not include credentials (got {raw})");
    }
    Ok(url)
}
