use std::path::PathBuf;

use clap::Parser;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "clawtalk",
    about = "Conversation gateway between Slack and a local LLM host",
    version
)]
pub struct CliArgs {
    /// Data directory; defaults to $HOME/.clawtalk.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Gateway bind address.
    #[arg(long, default_value = "0.0.0.0:8790")]
    pub bind: String,

    /// Path to the host's configuration file.
    #[arg(long)]
    pub openclaw_config: Option<PathBuf>,

    /// Config-level override for the host webhook forward URL.
    #[arg(long)]
    pub forward_url: Option<String>,

    /// Host endpoint that runs prompts for talks and jobs.
    #[arg(long)]
    pub prompt_endpoint: Option<String>,

    /// Host endpoint used to deliver Slack-bound job output.
    #[arg(long)]
    pub slack_send_endpoint: Option<String>,

    /// Upper bound for a single LLM run, in milliseconds.
    #[arg(long, default_value_t = 240_000, value_parser = parse_positive_u64)]
    pub base_timeout_ms: u64,

    /// Floor for the adaptive timeout, in milliseconds.
    #[arg(long, value_parser = parse_positive_u64)]
    pub min_timeout_ms: Option<u64>,

    /// Scheduler tick interval, in seconds.
    #[arg(long, default_value_t = 60, value_parser = parse_positive_u64)]
    pub tick_interval_seconds: u64,

    /// State backend hint used for cold-start tool baselines.
    #[arg(long, default_value = "stream_store")]
    pub state_backend: String,

    /// Skip the startup reconciliation of talk bindings into the host config.
    #[arg(long, default_value_t = false)]
    pub skip_reconcile: bool,
}
