#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use foreman_core::telemetry;
use foreman_sim::campaign::{self, CampaignConfig};

/// Runs the default campaign, or `SEEDS` seeds starting at `FIRST_SEED`
/// when given, and prints the report as JSON.
fn main() -> Result<()> {
    let _ = telemetry::init_tracing();

    let mut args = std::env::args().skip(1);
    let mut config = CampaignConfig::default();
    if let Some(seeds) = args.next() {
        let seeds: u64 = seeds.parse().context("SEEDS must be a number")?;
        let first: u64 = args
            .next()
            .map(|raw| raw.parse())
            .transpose()
            .context("FIRST_SEED must be a number")?
            .unwrap_or(0);
        config.seed_range = first..first.saturating_add(seeds);
    }

    let report = campaign::run_campaign(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(seed) = report.first_failure {
        bail!(
            "{} of {} seeds failed; replay seed {seed} first",
            report.failures.len(),
            report.seeds_run
        );
    }
    Ok(())
}
