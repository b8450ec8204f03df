//! `gazette-archiver`: batches fetched stories into WARC files and uploads
//! them to the configured blob store(s).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gazette::app::CommonArgs;
use gazette::storage::{ArchiveBatchHandler, ArchiveWriterConfig};
use gazette::transport::amqp::AmqpTransport;
use gazette::worker::batch::{BatchConfig, BatchWorker};
use gazette::worker::WorkerConfig;

/// Time reserved per batch for `end_of_batch` work (the WARC write + blob
/// store upload), subtracted from the broker consumer-ack timeout when
/// validating `--batch-seconds`.
const WORK_TIME_SECONDS: u64 = 120;
/// RabbitMQ's default per-message consumer-ack timeout.
const CONSUMER_TIMEOUT_SECONDS: u64 = 1800;

#[derive(Parser, Debug)]
#[command(name = "gazette-archiver", about = "Archives fetched stories to WARC files")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, env = "DEPLOYMENT_ID", default_value = "default")]
    deployment_id: String,

    /// maximum stories per archive file
    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    /// maximum seconds to wait for `batch_size` stories before flushing early
    #[arg(long, default_value_t = 300)]
    batch_seconds: u64,

    /// directory to spool `.warc.gz` files in before (and after, if
    /// `--remove-after-upload` is unset) uploading them
    #[arg(long, env = "ARCHIVE_SPOOL_DIR", default_value = "./spool")]
    spool_dir: PathBuf,

    /// prefix for archive file names, before the timestamp/serial/hostname suffix
    #[arg(long, default_value = "gazette")]
    filename_prefix: String,

    /// delete the local spool file once every configured blob store upload succeeds
    #[arg(long)]
    remove_after_upload: bool,

    /// logical store name used to resolve `{STORE}_{PROVIDER}_*` env vars
    #[arg(long, default_value = "ARCHIVE")]
    store_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging();

    let batch = BatchConfig {
        batch_size: cli.batch_size,
        batch_seconds: cli.batch_seconds,
    };
    batch
        .validate(WORK_TIME_SECONDS, CONSUMER_TIMEOUT_SECONDS)
        .context("validating --batch-size/--batch-seconds")?;

    std::fs::create_dir_all(&cli.spool_dir)
        .with_context(|| format!("creating spool dir {}", cli.spool_dir.display()))?;

    let (_conn, transport) = AmqpTransport::connect(&cli.common.rabbitmq_url)
        .await
        .context("connecting to RabbitMQ")?;
    let transport = Arc::new(transport);

    let mut config = WorkerConfig::new("gazette-archiver", &cli.deployment_id);
    config.from_quarantine = cli.common.from_quarantine;

    let stores = gazette::storage::blobstores(&cli.store_name);
    if stores.is_empty() {
        log::warn!(
            "no blob stores configured for {}_*; archives will only be spooled locally",
            cli.store_name
        );
    }

    let stats = gazette::app::stats::from_env("gazette-archiver");
    let handler = Arc::new(ArchiveBatchHandler::with_stats(
        ArchiveWriterConfig {
            spool_dir: cli.spool_dir,
            filename_prefix: cli.filename_prefix,
            remove_after_upload: cli.remove_after_upload,
        },
        stores,
        stats,
    ));

    let worker = BatchWorker::new(transport, config, batch);
    worker.run(handler).await
}
