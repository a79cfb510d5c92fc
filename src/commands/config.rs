use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use threatdbx::config::{ConfigUpdate, load_or_default};

#[derive(Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long)]
    pub event_shards: Option<u32>,

    #[arg(long)]
    pub counter_shards: Option<u32>,

    #[arg(long)]
    pub score_cap: Option<f64>,

    #[arg(long)]
    pub payload_budget_bytes: Option<usize>,

    #[arg(long)]
    pub max_request_bytes: Option<usize>,

    #[arg(long)]
    pub event_ttl_days: Option<i64>,

    #[arg(long)]
    pub aggregate_ttl_days: Option<i64>,

    #[arg(long)]
    pub page_limit: Option<usize>,

    #[arg(long)]
    pub max_page_limit: Option<usize>,

    #[arg(long)]
    pub rulepack_ttl_secs: Option<i64>,

    #[arg(long)]
    pub default_locale: Option<String>,

    #[arg(long)]
    pub fallback_locale: Option<String>,

    /// Shared ingest signing key; pass an empty string to clear it
    #[arg(long)]
    pub ingest_signing_key: Option<String>,

    /// Print the resulting configuration as TOML
    #[arg(long)]
    pub show: bool,
}

pub fn execute(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;

    let show = args.show;
    config.apply_update(ConfigUpdate {
        port: args.port,
        data_dir: args.data_dir,
        event_shards: args.event_shards,
        counter_shards: args.counter_shards,
        score_cap: args.score_cap,
        payload_budget_bytes: args.payload_budget_bytes,
        max_request_bytes: args.max_request_bytes,
        event_ttl_days: args.event_ttl_days,
        aggregate_ttl_days: args.aggregate_ttl_days,
        page_limit: args.page_limit,
        max_page_limit: args.max_page_limit,
        rulepack_ttl_secs: args.rulepack_ttl_secs,
        default_locale: args.default_locale,
        fallback_locale: args.fallback_locale,
        ingest_signing_key: args.ingest_signing_key,
    });

    config.validate()?;
    config.ensure_data_dirs()?;
    config.save(&path)?;

    if show {
        print!("{}", toml::to_string_pretty(&config)?);
    } else {
        println!("Configuration saved to {}", path.display());
    }
    Ok(())
}
