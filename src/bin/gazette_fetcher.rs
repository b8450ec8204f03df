//! `gazette-fetcher`: consumes discovered-story messages, fetches each URL
//! politely (one scoreboard slot per origin at a time), and republishes the
//! story with its HTTP metadata and raw HTML populated.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gazette::app::stats;
use gazette::app::CommonArgs;
use gazette::fetcher::Fetcher;
use gazette::scoreboard::ScoreBoard;
use gazette::transport::amqp::AmqpTransport;
use gazette::worker::{WorkerConfig, WorkerFramework};

#[derive(Parser, Debug)]
#[command(name = "gazette-fetcher", about = "Fetches discovered story URLs")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// deployment id used to derive the configuration barrier exchange name
    #[arg(long, env = "DEPLOYMENT_ID", default_value = "default")]
    deployment_id: String,

    /// maximum concurrent requests to a single origin
    #[arg(long, default_value_t = 2)]
    slot_requests: u32,

    /// minimum spacing between requests to an origin once its average
    /// response time is known; seeds the scoreboard's connection-error
    /// cooldown window before any measurement exists
    #[arg(long, default_value_t = 60)]
    issue_interval: u64,

    /// process-wide cap on concurrent in-flight fetches
    #[arg(long, default_value_t = 64)]
    max_active: u32,

    /// how often to run the scoreboard's periodic idle-slot sweep, in seconds
    #[arg(long, default_value_t = 30)]
    periodic_seconds: u64,

    #[arg(long, default_value_t = gazette::worker::config::DEFAULT_PREFETCH)]
    prefetch: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging();

    let (_conn, transport) = AmqpTransport::connect(&cli.common.rabbitmq_url)
        .await
        .context("connecting to RabbitMQ")?;
    let transport = Arc::new(transport);

    let mut config = WorkerConfig::new("gazette-fetcher", &cli.deployment_id)
        .with_no_quarantine(["ConnectionError"]);
    config.prefetch = cli.prefetch;
    config.from_quarantine = cli.common.from_quarantine;

    let scoreboard = Arc::new(ScoreBoard::new(
        cli.max_active,
        cli.slot_requests,
        Duration::from_secs(cli.issue_interval),
    ));
    let stats = stats::from_env("gazette-fetcher");
    let fetcher = Arc::new(Fetcher::new(Arc::clone(&scoreboard), Arc::clone(&stats))?);

    let periodic_scoreboard = Arc::clone(&scoreboard);
    let periodic_stats = Arc::clone(&stats);
    let periodic_interval = Duration::from_secs(cli.periodic_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(periodic_interval);
        loop {
            ticker.tick().await;
            periodic_scoreboard.periodic(periodic_stats.as_ref(), log::log_enabled!(log::Level::Debug));
        }
    });

    let framework = WorkerFramework::new(transport, config);
    framework.run(fetcher).await
}
