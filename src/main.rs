use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LoggingConfig, ServiceConfig};
use ratewarden::ratelimit::{presets, RateLimitConfig, RateLimiter};

#[derive(Parser)]
#[command(name = "ratewarden", version, about = "Inspect and exercise Ratewarden rate limits")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the built-in rules as JSON
    Presets,

    /// Run admission checks against a rule and print each decision
    Probe {
        #[command(flatten)]
        rule: RuleArgs,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        calls: u32,
    },

    /// Print the window, queue and circuit state of a rule
    Status {
        #[command(flatten)]
        rule: RuleArgs,
    },

    /// Reset state for one identifier, or every identifier
    Clear {
        #[arg(long)]
        identifier: Option<String>,
    },
}

/// A built-in rule by identifier, optionally overridden, or an ad-hoc rule.
#[derive(clap::Args)]
struct RuleArgs {
    #[arg(long)]
    identifier: String,

    #[arg(long)]
    max_requests: Option<u32>,

    #[arg(long)]
    window_ms: Option<u64>,

    #[arg(long)]
    burst: Option<u32>,
}

impl RuleArgs {
    fn resolve(&self) -> anyhow::Result<RateLimitConfig> {
        let mut rule = match presets::find(&self.identifier) {
            Some(rule) => rule,
            None => match (self.max_requests, self.window_ms) {
                (Some(max), Some(window)) => RateLimitConfig::new(&self.identifier, max, window),
                _ => bail!(
                    "{} is not a built-in rule; pass --max-requests and --window-ms",
                    self.identifier
                ),
            },
        };

        if let Some(max) = self.max_requests {
            rule.max_requests = max;
        }
        if let Some(window) = self.window_ms {
            rule.window_ms = window;
        }
        if let Some(burst) = self.burst {
            rule = rule.with_burst_limit(burst);
        }

        rule.validate()?;
        Ok(rule)
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config =
        ServiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratewarden");

    if let Command::Presets = cli.command {
        println!("{}", serde_json::to_string_pretty(&presets::all())?);
        return Ok(());
    }

    let limiter = RateLimiter::connect(&config.store).await;
    info!(backend = limiter.backend(), "Rate limiter initialized");

    match cli.command {
        Command::Presets => {}
        Command::Probe { rule, calls } => {
            let rule = rule.resolve()?;
            for call in 1..=calls {
                let result = limiter.check_rate_limit(&rule).await;
                println!("{}", json!({ "call": call, "result": result }));
            }
        }
        Command::Status { rule } => {
            let rule = rule.resolve()?;
            limiter.register(&rule);
            let status = limiter.get_rate_limit_status(&rule.identifier).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Clear { identifier } => {
            limiter.clear_rate_limits(identifier.as_deref()).await;
            println!("{}", json!({ "cleared": identifier.as_deref().unwrap_or("*") }));
        }
    }

    Ok(())
}
