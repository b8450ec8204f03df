//! Exercises `Fetcher::process` directly against a local HTTP stub, covering
//! the classification outcomes that matter most: success, non-news skip,
//! a retryable HTTP status, connect failure, and per-origin scheduler
//! contention.

use std::sync::Arc;
use std::time::Duration;

use gazette::app::stats::NullStats;
use gazette::fetcher::Fetcher;
use gazette::scoreboard::ScoreBoard;
use gazette::story::{RssEntryUpdate, Story};
use gazette::worker::HandlerOutcome;

fn story_for(link: &str) -> Vec<u8> {
    let mut story = Story::new();
    story.update_rss(RssEntryUpdate {
        link: Some(link.to_string()),
        ..Default::default()
    });
    story.dump().unwrap()
}

fn fetcher(max_active: u32, target_concurrency: u32) -> Fetcher {
    let scoreboard = Arc::new(ScoreBoard::new(max_active, target_concurrency, Duration::from_secs(60)));
    Fetcher::new(scoreboard, Arc::new(NullStats)).unwrap()
}

#[tokio::test]
async fn successful_fetch_populates_http_metadata_and_raw_html() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/article")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><body>hello</body></html>")
        .create_async()
        .await;

    let body = story_for(&format!("{}/article", server.url()));
    let outcome = fetcher(10, 2).process(&body).await;

    mock.assert_async().await;
    match outcome {
        HandlerOutcome::Success { outputs } => {
            assert_eq!(outputs.len(), 1);
            let fetched = Story::load(&outputs[0].body).unwrap();
            assert_eq!(fetched.http_metadata().response_code, Some(200));
            assert!(!fetched.raw_html().html.is_empty());
        }
        _ => panic!("expected Success outcome"),
    }
}

#[tokio::test]
async fn non_news_domain_is_skipped_without_a_request() {
    let body = story_for("https://www.facebook.com/some/post");
    let outcome = fetcher(10, 2).process(&body).await;
    match outcome {
        HandlerOutcome::Success { outputs } => assert!(outputs.is_empty()),
        _ => panic!("expected a quiet Success with no outputs"),
    }
}

#[tokio::test]
async fn retryable_http_status_yields_transient_outcome() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/flaky")
        .with_status(503)
        .create_async()
        .await;

    let body = story_for(&format!("{}/flaky", server.url()));
    let outcome = fetcher(10, 2).process(&body).await;

    mock.assert_async().await;
    match outcome {
        HandlerOutcome::Transient { kind, .. } => assert_eq!(kind, "Retry"),
        _ => panic!("expected Transient outcome for a 503"),
    }
}

#[tokio::test]
async fn non_retryable_http_status_is_dropped_quietly() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/gone")
        .with_status(410)
        .create_async()
        .await;

    let body = story_for(&format!("{}/gone", server.url()));
    let outcome = fetcher(10, 2).process(&body).await;

    mock.assert_async().await;
    match outcome {
        HandlerOutcome::Success { outputs } => assert!(outputs.is_empty()),
        _ => panic!("expected a quiet Success for a non-retryable 4xx"),
    }
}

#[tokio::test]
async fn connect_failure_yields_transient_connection_error() {
    // Nothing is listening on this port; the client should hit a connect error.
    let body = story_for("http://127.0.0.1:1/unreachable");
    let outcome = fetcher(10, 2).process(&body).await;
    match outcome {
        HandlerOutcome::Transient { kind, .. } => assert_eq!(kind, "ConnectionError"),
        other => panic!("expected a connection error, got a different outcome: {other:?}"),
    }
}

#[tokio::test]
async fn second_concurrent_request_to_same_origin_is_requeued_when_busy() {
    let url = "http://busy.example.invalid/slow";
    let scoreboard = Arc::new(ScoreBoard::new(10, 1, Duration::from_secs(60)));
    let fqdn = gazette::fetcher::url_fqdn(url).unwrap();

    // Hold the only slot for this origin directly, rather than racing a real
    // in-flight fetch, so the second `process` call deterministically finds
    // the origin busy before any request would go out.
    let held = scoreboard.issue(&fqdn, "holder-of-the-only-slot", url);
    assert_eq!(held.status, gazette::scoreboard::IssueStatus::Ok);

    let fetcher = Fetcher::new(Arc::clone(&scoreboard), Arc::new(NullStats)).unwrap();
    let body = story_for(url);
    let outcome = fetcher.process(&body).await;

    match outcome {
        HandlerOutcome::Requeue { .. } => {}
        other => panic!("expected Requeue while the origin's only slot is held, got {other:?}"),
    }

    held.slot
        .unwrap()
        .retire(gazette::scoreboard::ConnStatus::Data, Duration::from_millis(1));
}
