use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use bombard::{
    Bombardier, Campaign, HttpTransport, RunArgs, StdoutSink, Supply, report::ReportSink,
};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Fire the requests of a campaign book and follow their chains.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Campaign book (YAML)
    campaign: PathBuf,
    /// Number of concurrent workers
    #[clap(short = 't', long = "threads", default_value_t = 10)]
    threads: usize,
    /// How many times to queue each request
    #[clap(short, long, default_value_t = 1)]
    repeat: usize,
    /// Per-request timeout in seconds
    #[clap(long, default_value_t = 10.0)]
    timeout: f64,
    /// Do not send anything, answer with each request's `dry` payload
    #[clap(short = 'x', long)]
    dry: bool,
    /// Only show progress milestones, warnings and the report
    #[clap(short, long, conflicts_with = "verbose")]
    quiet: bool,
    /// Log request and response bodies
    #[clap(short, long)]
    verbose: bool,
    /// Report durations in milliseconds
    #[clap(long)]
    ms: bool,
    /// Latency threshold in milliseconds
    #[clap(long, default_value_t = 1000)]
    threshold: u64,
    /// Override a supply value, `name=value`; values are parsed as JSON when possible
    #[clap(short, long = "supply", value_parser = parse_supply)]
    supply: Vec<(String, Value)>,
}

fn parse_supply(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

impl Cli {
    fn run_args(&self) -> anyhow::Result<RunArgs> {
        let timeout = Duration::try_from_secs_f64(self.timeout)
            .with_context(|| format!("invalid timeout {}", self.timeout))?;
        Ok(RunArgs {
            workers: self.threads,
            repeat: self.repeat,
            timeout,
            dry: self.dry,
            quiet: self.quiet,
            verbose: self.verbose,
            ms: self.ms,
            threshold: self.threshold,
        })
    }

    fn log_filter(&self) -> EnvFilter {
        let default = if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_target(false)
        .init();

    let args = cli.run_args()?;
    args.validate().context("invalid run parameters")?;

    let mut campaign = Campaign::load(&cli.campaign)
        .with_context(|| format!("cannot load campaign {}", cli.campaign.display()))?;
    let overrides: Supply = cli.supply.iter().cloned().collect();
    campaign.supply.extend(overrides);
    if campaign.firing().is_empty() {
        bail!("campaign {} has nothing to fire", cli.campaign.display());
    }

    let engine = Arc::new(
        Bombardier::builder()
            .args(args)
            .campaign(Arc::new(campaign))
            .transport(Arc::new(HttpTransport::default()))
            .build(),
    );

    let queued = engine.fire_campaign();
    tracing::info!("Queued {} requests from {}", queued.len(), cli.campaign.display());
    let summary = engine.bombard().await?;

    StdoutSink
        .emit(&summary)
        .await
        .map_err(|e| anyhow::anyhow!("cannot print report: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn supply_values_are_json_when_possible() {
        assert_eq!(parse_supply("n=3").unwrap(), ("n".into(), json!(3)));
        assert_eq!(parse_supply("host=http://x").unwrap(), ("host".into(), json!("http://x")));
        assert_eq!(parse_supply("ids=[1,2]").unwrap(), ("ids".into(), json!([1, 2])));
        assert!(parse_supply("novalue").is_err());
    }

    #[test]
    fn flags_map_to_run_args() {
        let cli = Cli::parse_from(["bombard", "c.yaml", "-t", "4", "-x", "--timeout", "0.5", "-s", "a=1"]);
        let args = cli.run_args().unwrap();
        assert_eq!(args.workers, 4);
        assert!(args.dry);
        assert_eq!(args.timeout, Duration::from_millis(500));
        assert_eq!(cli.supply, vec![("a".to_string(), json!(1))]);
    }
}
