//! `gazette-queuer`: reads discovered-link input (one CSV row or bare URL
//! per line) and publishes a fresh [`Story`] onto the fetcher's input queue
//! for each one.
//!
//! Input format, per line: `link,title,domain,pub_date,via` or, with no
//! commas present, a bare URL (the remaining RSS fields are left empty).
//! No quoting support — this is meant for RSS/CSV exports already free of
//! embedded commas, not a general CSV dialect.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gazette::app::CommonArgs;
use gazette::story::{RssEntryUpdate, Story};
use gazette::transport::amqp::AmqpTransport;
use gazette::transport::{MessageHeaders, Transport};
use gazette::worker::WorkerConfig;

#[derive(Parser, Debug)]
#[command(name = "gazette-queuer", about = "Publishes discovered story URLs for fetching")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, env = "DEPLOYMENT_ID", default_value = "default")]
    deployment_id: String,

    /// label recorded on each story's `via` field, identifying this feed/run
    #[arg(long, default_value = "queuer")]
    via: String,

    /// input files, each one story per line (see module docs for the format)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn parse_line(line: &str, via: &str) -> Option<RssEntryUpdate> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = line.split(',').collect();
    let fetch_date = gazette::app::now_iso8601();
    if fields.len() == 1 {
        return Some(RssEntryUpdate {
            link: Some(fields[0].to_string()),
            fetch_date: Some(fetch_date),
            via: Some(via.to_string()),
            ..Default::default()
        });
    }
    Some(RssEntryUpdate {
        link: fields.first().map(|s| s.to_string()),
        title: fields.get(1).map(|s| s.to_string()),
        domain: fields.get(2).map(|s| s.to_string()),
        pub_date: fields.get(3).map(|s| s.to_string()),
        fetch_date: Some(fetch_date),
        via: Some(fields.get(4).map(|s| s.to_string()).unwrap_or_else(|| via.to_string())),
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging();

    let (_conn, transport) = AmqpTransport::connect(&cli.common.rabbitmq_url)
        .await
        .context("connecting to RabbitMQ")?;
    let transport = Arc::new(transport);
    let config = WorkerConfig::new("gazette-fetcher", &cli.deployment_id);

    transport.tx_select().await.context("entering transaction mode")?;

    let mut queued = 0u64;
    for input in &cli.inputs {
        let text = std::fs::read_to_string(input)
            .with_context(|| format!("reading {}", input.display()))?;
        for line in text.lines() {
            let Some(update) = parse_line(line, &cli.via) else {
                continue;
            };
            let mut story = Story::new();
            story.update_rss(update);
            let body = story.dump().context("serializing queued story")?;

            transport
                .publish(
                    "",
                    &config.input_queue(),
                    body,
                    &MessageHeaders::default(),
                    None,
                )
                .await
                .context("publishing story")?;
            queued += 1;
        }
    }
    transport.tx_commit().await.context("committing queued stories")?;

    log::info!("queued {queued} stories from {} input file(s)", cli.inputs.len());
    Ok(())
}
