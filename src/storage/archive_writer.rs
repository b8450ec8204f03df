//! Archive Writer: turns a batch of fetched stories into a WARC file and
//! hands it to the blob store.
//!
//! Each story becomes a `response`/`metadata` record pair: the `response`
//! record carries the raw HTTP response (status line, a minimal header
//! block, and the HTML body) as it was fetched; the `metadata` record
//! carries the full story JSON (every view, not just raw HTML) and refers
//! back to its response via `WARC-Refers-To`. Every record is gzip-framed on
//! its own, so a file truncated mid-write still has every complete record up
//! to that point readable — this is also why a single `GzEncoder` wrapping
//! the whole file is never used here.
//!
//! Rotation is driven entirely by the batch boundary: one file per
//! `end_of_batch`, never mid-batch by size, matching the worker framework's
//! "ack the whole batch together or not at all" contract.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use warc::{BufferedBody, Record, RecordBuilder, WarcHeader, WarcWriter};

use crate::app::stats::{NullStats, Stats};
use crate::storage::blob_store::BlobStore;
use crate::story::Story;
use crate::worker::batch::BatchHandler;

/// Where finished `.warc.gz` files land before (and, if upload fails or
/// removal is disabled, after) being handed to the blob store.
pub struct ArchiveWriterConfig {
    pub spool_dir: PathBuf,
    pub filename_prefix: String,
    pub remove_after_upload: bool,
}

/// Batch sink that buffers stories in memory for the duration of one batch,
/// then on `end_of_batch` serializes them all into one WARC file and
/// uploads it to every configured blob store.
///
/// Each `end_of_batch` outcome is tagged on `stats` with one of five labels
/// under the `archive.` prefix: `empty` (nothing to write), `noarch` (the
/// WARC file itself could not be written), `nostore` (written but no blob
/// store configured), `uploaded` (per successful store upload), `noupload`
/// (per failed store upload).
pub struct ArchiveBatchHandler {
    config: ArchiveWriterConfig,
    stores: Vec<std::sync::Arc<dyn BlobStore>>,
    stats: std::sync::Arc<dyn Stats>,
    pending: Mutex<Vec<Story>>,
    serial: std::sync::atomic::AtomicU64,
}

impl ArchiveBatchHandler {
    pub fn new(config: ArchiveWriterConfig, stores: Vec<std::sync::Arc<dyn BlobStore>>) -> Self {
        Self::with_stats(config, stores, std::sync::Arc::new(NullStats))
    }

    pub fn with_stats(
        config: ArchiveWriterConfig,
        stores: Vec<std::sync::Arc<dyn BlobStore>>,
        stats: std::sync::Arc<dyn Stats>,
    ) -> Self {
        ArchiveBatchHandler {
            config,
            stores,
            stats,
            pending: Mutex::new(Vec::new()),
            serial: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn next_filename(&self) -> String {
        let serial = self
            .serial
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let timestamp = compact_timestamp();
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        format!(
            "{}-{timestamp}-{serial}-{host}.warc.gz",
            self.config.filename_prefix
        )
    }
}

#[async_trait]
impl BatchHandler for ArchiveBatchHandler {
    async fn on_message(&self, body: &[u8]) -> Result<()> {
        let story = Story::load(body).context("parsing story for archival")?;
        self.pending.lock().unwrap().push(story);
        Ok(())
    }

    async fn end_of_batch(&self) -> Result<()> {
        let stories = std::mem::take(&mut *self.pending.lock().unwrap());
        if stories.is_empty() {
            self.stats.incr("archive.empty", 1.0);
            return Ok(());
        }

        let filename = self.next_filename();
        let path = self.config.spool_dir.join(&filename);
        let t0 = std::time::Instant::now();
        if let Err(err) = write_warc_file(&path, &stories) {
            self.stats.incr("archive.noarch", 1.0);
            return Err(err).context("writing WARC file");
        }
        log::info!("wrote {} stories to {}", stories.len(), path.display());

        if self.stores.is_empty() {
            self.stats.incr("archive.nostore", 1.0);
            return Ok(());
        }

        let mut any_failed = false;
        for store in &self.stores {
            match store.upload_file(&path, &filename).await {
                Ok(()) => {
                    self.stats.incr("archive.uploaded", 1.0);
                    self.stats.gauge("archive.upload_seconds", t0.elapsed().as_secs_f64());
                    log::info!("uploaded {filename} to {}", store.provider_tag());
                }
                Err(err) => {
                    any_failed = true;
                    self.stats.incr("archive.noupload", 1.0);
                    log::error!("uploading {filename} to {} failed: {err:#}", store.provider_tag());
                }
            }
        }

        if any_failed {
            anyhow::bail!("one or more blob store uploads failed for {filename}");
        }

        if self.config.remove_after_upload {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("removing spooled {}: {err}", path.display());
            }
        }
        Ok(())
    }
}

/// Writes every story to `path` as a gzip-concatenated sequence of WARC
/// records: one `warcinfo` record, then one `response`/`metadata` pair per
/// story. Bails entirely rather than writing a partial file that omits a
/// story's metadata half — `?` on the first error drops the whole write.
fn write_warc_file(path: &Path, stories: &[Story]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);

    write_record(&mut out, warcinfo_record()?)?;
    for story in stories {
        let response_id = new_record_id();
        let response = response_record(story, &response_id)?;
        write_record(&mut out, response)?;

        let metadata = metadata_record(story, &response_id)?;
        write_record(&mut out, metadata)?;
    }
    out.flush()?;
    Ok(())
}

/// Gzip-frames `record` on its own and appends it to `out`. Each call
/// produces one complete gzip member, so a reader can stop at any member
/// boundary and still have decoded every record before it.
fn write_record<W: Write>(out: &mut W, record: Record<BufferedBody>) -> Result<()> {
    let mut encoder = GzEncoder::new(out, Compression::default());
    {
        let mut warc_writer = WarcWriter::new(&mut encoder);
        warc_writer
            .write_record(&record)
            .context("writing WARC record")?;
    }
    encoder.finish()?;
    Ok(())
}

fn warcinfo_record() -> Result<Record<BufferedBody>> {
    let body = format!(
        "software: gazette/{}\r\nformat: WARC File Format 1.1\r\n",
        env!("CARGO_PKG_VERSION")
    );
    RecordBuilder::default()
        .header(WarcHeader::WarcType, "warcinfo")
        .header(WarcHeader::RecordID, new_record_id())
        .header(WarcHeader::ContentType, "application/warc-fields")
        .body(body.into_bytes())
        .build()
        .context("building warcinfo record")
}

fn response_record(story: &Story, record_id: &str) -> Result<Record<BufferedBody>> {
    let http = story.http_metadata();
    let status = http.response_code.unwrap_or(0);
    let html = &story.raw_html().html;
    let header_block = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset={}\r\nContent-Length: {}\r\n\r\n",
        if story.raw_html().encoding.is_empty() {
            "utf-8"
        } else {
            &story.raw_html().encoding
        },
        html.len()
    );
    let mut body = header_block.into_bytes();
    body.extend_from_slice(html);

    let target_uri = if http.final_url.is_empty() {
        story.rss().link.clone()
    } else {
        http.final_url.clone()
    };

    RecordBuilder::default()
        .header(WarcHeader::WarcType, "response")
        .header(WarcHeader::RecordID, record_id)
        .header(WarcHeader::TargetURI, target_uri)
        .header(WarcHeader::ContentType, "application/http;msgtype=response")
        .body(body)
        .build()
        .context("building response record")
}

fn metadata_record(story: &Story, refers_to: &str) -> Result<Record<BufferedBody>> {
    let body = story.dump().context("serializing story for metadata record")?;
    RecordBuilder::default()
        .header(WarcHeader::WarcType, "metadata")
        .header(WarcHeader::RecordID, new_record_id())
        .header(WarcHeader::RefersTo, refers_to)
        .header(WarcHeader::ContentType, "application/json")
        .body(body)
        .build()
        .context("building metadata record")
}

/// A `urn:uuid:` record ID built from 16 random bytes with the version (4,
/// random) and variant (RFC 4122) bits set — avoids pulling in a dedicated
/// uuid crate for the one thing WARC needs it for.
fn new_record_id() -> String {
    let mut bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "<urn:uuid:{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}>",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        bytes[6], bytes[7],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}

fn compact_timestamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    crate::app::humantime_iso8601(secs)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::{ContentMetadataUpdate, HttpMetadataUpdate, RawHtmlUpdate, RssEntryUpdate};

    fn sample_story() -> Story {
        let mut s = Story::new();
        s.update_rss(RssEntryUpdate {
            link: Some("https://example.org/a".into()),
            title: Some("headline".into()),
            ..Default::default()
        });
        s.update_http_metadata(HttpMetadataUpdate {
            final_url: Some("https://example.org/a".into()),
            response_code: Some(200),
            ..Default::default()
        });
        s.update_raw_html(RawHtmlUpdate {
            html: Some(b"<html><body>hi</body></html>".to_vec()),
            encoding: Some("utf-8".into()),
        });
        s.update_content_metadata(ContentMetadataUpdate {
            article_title: Some("headline".into()),
            ..Default::default()
        });
        s
    }

    #[test]
    fn record_id_has_uuid_shape() {
        let id = new_record_id();
        assert!(id.starts_with("<urn:uuid:"));
        assert!(id.ends_with('>'));
        assert_eq!(id.len(), "<urn:uuid:00000000-0000-0000-0000-000000000000>".len());
    }

    #[test]
    fn writes_readable_gzip_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.warc.gz");
        let stories = vec![sample_story()];
        write_warc_file(&path, &stories).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let mut decoder = flate2::read::MultiGzDecoder::new(&bytes[..]);
        let mut decoded = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut decoded).unwrap();
        assert!(decoded.contains("WARC-Type: warcinfo"));
        assert!(decoded.contains("WARC-Type: response"));
        assert!(decoded.contains("WARC-Type: metadata"));
        assert!(decoded.contains("hi</body>"));
    }

    #[tokio::test]
    async fn empty_batch_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ArchiveBatchHandler::new(
            ArchiveWriterConfig {
                spool_dir: dir.path().to_path_buf(),
                filename_prefix: "test".into(),
                remove_after_upload: false,
            },
            Vec::new(),
        );
        handler.end_of_batch().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn batch_produces_one_file_per_story_set() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ArchiveBatchHandler::new(
            ArchiveWriterConfig {
                spool_dir: dir.path().to_path_buf(),
                filename_prefix: "test".into(),
                remove_after_upload: false,
            },
            Vec::new(),
        );
        let story = sample_story();
        handler.on_message(&story.dump().unwrap()).await.unwrap();
        handler.end_of_batch().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
