//! Covers the archive writer's upload contract from outside the crate: a
//! failed upload must leave the spooled file in place regardless of
//! `remove_after_upload`, and a successful upload only removes it when that
//! flag is set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gazette::app::stats::NullStats;
use gazette::storage::blob_store::BlobStore;
use gazette::storage::{ArchiveBatchHandler, ArchiveWriterConfig};
use gazette::story::{HttpMetadataUpdate, RawHtmlUpdate, RssEntryUpdate, Story};
use gazette::worker::batch::BatchHandler;

struct FakeStore {
    fail: bool,
    uploads: AtomicUsize,
}

#[async_trait]
impl BlobStore for FakeStore {
    async fn upload_file(&self, _local_path: &Path, _remote_key: &str) -> anyhow::Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("simulated upload failure")
        } else {
            Ok(())
        }
    }

    async fn list_objects(&self, _prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn download_file(&self, _key: &str, _local_path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn provider_tag(&self) -> &'static str {
        "fake"
    }
}

fn sample_story_bytes() -> Vec<u8> {
    let mut story = Story::new();
    story.update_rss(RssEntryUpdate {
        link: Some("https://example.org/a".into()),
        title: Some("headline".into()),
        ..Default::default()
    });
    story.update_http_metadata(HttpMetadataUpdate {
        final_url: Some("https://example.org/a".into()),
        response_code: Some(200),
        ..Default::default()
    });
    story.update_raw_html(RawHtmlUpdate {
        html: Some(b"<html><body>hi</body></html>".to_vec()),
        encoding: Some("utf-8".into()),
    });
    story.dump().unwrap()
}

fn only_file_in(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .next()
}

#[tokio::test]
async fn failed_upload_keeps_the_spool_file_even_with_remove_after_upload() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore {
        fail: true,
        uploads: AtomicUsize::new(0),
    });
    let handler = ArchiveBatchHandler::with_stats(
        ArchiveWriterConfig {
            spool_dir: dir.path().to_path_buf(),
            filename_prefix: "gazette".into(),
            remove_after_upload: true,
        },
        vec![store.clone()],
        Arc::new(NullStats),
    );

    handler.on_message(&sample_story_bytes()).await.unwrap();
    let result = handler.end_of_batch().await;

    assert!(result.is_err());
    assert_eq!(store.uploads.load(Ordering::SeqCst), 1);
    assert!(only_file_in(dir.path()).is_some(), "spool file must survive a failed upload");
}

#[tokio::test]
async fn successful_upload_removes_spool_file_only_when_requested() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore {
        fail: false,
        uploads: AtomicUsize::new(0),
    });
    let handler = ArchiveBatchHandler::with_stats(
        ArchiveWriterConfig {
            spool_dir: dir.path().to_path_buf(),
            filename_prefix: "gazette".into(),
            remove_after_upload: true,
        },
        vec![store],
        Arc::new(NullStats),
    );

    handler.on_message(&sample_story_bytes()).await.unwrap();
    handler.end_of_batch().await.unwrap();

    assert!(only_file_in(dir.path()).is_none(), "spool file must be removed after a successful upload");
}

#[tokio::test]
async fn successful_upload_keeps_spool_file_when_remove_after_upload_is_unset() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore {
        fail: false,
        uploads: AtomicUsize::new(0),
    });
    let handler = ArchiveBatchHandler::with_stats(
        ArchiveWriterConfig {
            spool_dir: dir.path().to_path_buf(),
            filename_prefix: "gazette".into(),
            remove_after_upload: false,
        },
        vec![store],
        Arc::new(NullStats),
    );

    handler.on_message(&sample_story_bytes()).await.unwrap();
    handler.end_of_batch().await.unwrap();

    assert!(only_file_in(dir.path()).is_some());
}
