//! Queue-coupled worker framework and polite concurrent fetcher for a
//! news-content ingestion pipeline.
//!
//! The hard core lives in [`worker`] (the two-activity broker runtime and
//! its retry/quarantine/requeue state machine), [`scoreboard`] (per-origin
//! fetch admission control), and [`fetcher`] (the HTTP client built on top
//! of both). [`story`] carries the per-article record through every stage;
//! [`transport`] abstracts the broker; [`storage`] holds the WARC archive
//! writer and blob store upload layer; [`app`] is the shared CLI/logging/
//! stats harness every binary links against.

pub mod app;
pub mod error;
pub mod fetcher;
pub mod scoreboard;
pub mod storage;
pub mod story;
pub mod transport;
pub mod worker;

pub use error::{Error, Result};
