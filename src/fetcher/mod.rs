//! Fetcher Worker: the polite, concurrent HTTP fetcher. Each input Story
//! carries an RSS-discovered URL; this stage issues a scoreboard slot for
//! the URL's origin, fetches the page (following redirects itself so each
//! hop can be re-validated), and emits a Story with its HTTP metadata and
//! raw HTML views populated.

pub mod non_news;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use url::Url;

use crate::app::stats::Stats;
use crate::scoreboard::{ConnStatus, Fqdn, IssueStatus, ScoreBoard};
use crate::story::{HttpMetadataUpdate, RawHtmlUpdate, Story};
use crate::worker::{HandlerOutcome, OutboundMessage};

const CONNECT_SECONDS: u64 = 30;
const READ_SECONDS: u64 = 30;
const MAX_REDIRECTS: u32 = 30;
const USER_AGENT: &str = "mediacloud bot for open academic research (+https://mediacloud.org)";

/// HTTP statuses the fetcher retries rather than discarding.
const RETRY_HTTP_CODES: &[u16] = &[408, 429, 500, 502, 503, 504, 522, 524];
/// Statuses that earn their own counter label instead of being grouped by
/// status class.
const SEPARATE_COUNTS: &[u16] = &[403, 404, 429];

const ACCEPTABLE_CONTENT_TYPE_PREFIXES: &[&str] = &[
    "text/",
    "application/xhtml",
    "application/vnd.wap.xhtml+xml",
    "application/xml",
];

fn max_html_bytes() -> usize {
    std::env::var("MAX_HTML_BYTES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000_000)
}

/// Extracts the lowercased host from a URL. Returns `None` for anything
/// without a parseable host (relative URLs, `mailto:`, etc).
pub fn url_fqdn(url: &str) -> Option<Fqdn> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(Fqdn::new(host.to_ascii_lowercase()))
}

struct FetchOutcome {
    resp: Option<reqwest::Response>,
    counter: &'static str,
}

pub struct Fetcher {
    client: Client,
    scoreboard: Arc<ScoreBoard>,
    stats: Arc<dyn Stats>,
    holder_seq: AtomicU64,
}

impl Fetcher {
    pub fn new(scoreboard: Arc<ScoreBoard>, stats: Arc<dyn Stats>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(CONNECT_SECONDS))
            .timeout(Duration::from_secs(CONNECT_SECONDS + READ_SECONDS))
            .build()?;
        Ok(Fetcher {
            client,
            scoreboard,
            stats,
            holder_seq: AtomicU64::new(0),
        })
    }

    fn incr(&self, status: &str) {
        self.stats.incr(&format!("fetched-stories.{status}"), 1.0);
    }

    fn next_holder(&self) -> String {
        let n = self.holder_seq.fetch_add(1, Ordering::Relaxed);
        format!("fetch-{n}")
    }

    /// Follows redirects by hand so every hop can be FQDN-checked before
    /// the next request goes out.
    async fn fetch(&self, mut url: String) -> FetchOutcome {
        let mut redirects = 0u32;
        loop {
            let resp = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(err) if err.is_builder() || err.is_request() => {
                    return FetchOutcome {
                        resp: None,
                        counter: "badurl2",
                    };
                }
                Err(err) => {
                    warn!("connect error fetching {url}: {err:#}");
                    return FetchOutcome {
                        resp: None,
                        counter: "noconn",
                    };
                }
            };

            if !resp.status().is_redirection() {
                return FetchOutcome {
                    resp: Some(resp),
                    counter: "SNH",
                };
            }

            let Some(location) = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return FetchOutcome {
                    resp: None,
                    counter: "badredir",
                };
            };

            let next_url = match Url::parse(&url).and_then(|base| base.join(location)) {
                Ok(u) => u,
                Err(_) => {
                    return FetchOutcome {
                        resp: None,
                        counter: "badredir2",
                    };
                }
            };

            redirects += 1;
            if redirects >= MAX_REDIRECTS {
                return FetchOutcome {
                    resp: None,
                    counter: "maxredir",
                };
            }

            let Some(next_fqdn) = next_url.host_str().map(|h| Fqdn::new(h.to_ascii_lowercase()))
            else {
                return FetchOutcome {
                    resp: None,
                    counter: "badredir2",
                };
            };

            info!("redirect ({}) => {}", resp.status(), next_url);
            if non_news::non_news_fqdn(&next_fqdn.0) {
                return FetchOutcome {
                    resp: None,
                    counter: "non-news2",
                };
            }

            url = next_url.to_string();
        }
    }

    pub async fn process(&self, body: &[u8]) -> HandlerOutcome {
        let story = match Story::load(body) {
            Ok(s) => s,
            Err(err) => {
                return HandlerOutcome::Quarantine {
                    reason: format!("undecodable story: {err}"),
                }
            }
        };

        let url = story.rss().link.clone();
        if url.is_empty() {
            self.incr("no-url");
            return HandlerOutcome::Success { outputs: vec![] };
        }

        let Some(fqdn) = url_fqdn(&url) else {
            self.incr("badurl1");
            return HandlerOutcome::Success { outputs: vec![] };
        };

        if non_news::non_news_fqdn(&fqdn.0) {
            self.incr("non-news");
            return HandlerOutcome::Success { outputs: vec![] };
        }

        let holder = self.next_holder();
        let ir = self.scoreboard.issue(&fqdn, &holder, &url);
        let Some(slot) = ir.slot else {
            return match ir.status {
                IssueStatus::Skipped => {
                    self.incr("skipped");
                    HandlerOutcome::Transient {
                        kind: "Retry".to_string(),
                        reason: "skipped due to recent connection failure".to_string(),
                    }
                }
                _ => {
                    self.incr("busy");
                    HandlerOutcome::Requeue {
                        reason: "busy".to_string(),
                    }
                }
            };
        };

        info!("fetch {url}");
        let t0 = Instant::now();
        let fret = self.fetch(url.clone()).await;

        let Some(resp) = fret.resp else {
            let conn_status = if fret.counter == "noconn" {
                ConnStatus::NoConn
            } else {
                ConnStatus::NoData
            };
            slot.retire(conn_status, t0.elapsed());
            self.incr(fret.counter);
            return match fret.counter {
                "noconn" => HandlerOutcome::Transient {
                    kind: "ConnectionError".to_string(),
                    reason: "connection error".to_string(),
                },
                _ => HandlerOutcome::Success { outputs: vec![] },
            };
        };

        let status = resp.status();
        if status != StatusCode::OK {
            slot.retire(ConnStatus::NoData, t0.elapsed());
            let code = status.as_u16();
            let counter: String = if SEPARATE_COUNTS.contains(&code) {
                format!("http-{code}")
            } else {
                format!("http-{}xx", code / 100)
            };

            if RETRY_HTTP_CODES.contains(&code) {
                self.incr(&counter);
                return HandlerOutcome::Transient {
                    kind: "Retry".to_string(),
                    reason: format!("HTTP {code}"),
                };
            }
            self.incr(&counter);
            return HandlerOutcome::Success { outputs: vec![] };
        }

        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let acceptable = ACCEPTABLE_CONTENT_TYPE_PREFIXES
            .iter()
            .any(|prefix| content_type.starts_with(prefix));
        if !acceptable {
            slot.retire(ConnStatus::NoData, t0.elapsed());
            self.incr("not-text");
            return HandlerOutcome::Success { outputs: vec![] };
        }

        let content = match resp.bytes().await {
            Ok(b) => b,
            Err(err) => {
                slot.retire(ConnStatus::NoConn, t0.elapsed());
                self.incr("noconn");
                return HandlerOutcome::Transient {
                    kind: "ConnectionError".to_string(),
                    reason: format!("body read failed: {err}"),
                };
            }
        };

        if content.is_empty() {
            slot.retire(ConnStatus::NoData, t0.elapsed());
            self.incr("no-html");
            return HandlerOutcome::Success { outputs: vec![] };
        }
        slot.retire(ConnStatus::Data, t0.elapsed());
        if content.len() > max_html_bytes() {
            self.incr("oversized");
            return HandlerOutcome::Success { outputs: vec![] };
        }

        let mut story = story;
        story.update_http_metadata(HttpMetadataUpdate {
            final_url: Some(final_url.clone()),
            response_code: Some(status.as_u16()),
            fetch_timestamp: Some(crate::app::now_unix_seconds()),
            encoding: Some(content_type),
        });
        story.update_raw_html(RawHtmlUpdate {
            html: Some(content.to_vec()),
            encoding: None,
        });

        self.incr("success");
        let out = match story.dump() {
            Ok(b) => b,
            Err(err) => {
                return HandlerOutcome::Quarantine {
                    reason: format!("could not serialize fetched story: {err}"),
                }
            }
        };
        HandlerOutcome::Success {
            outputs: vec![OutboundMessage::to_default_exchange(out)],
        }
    }
}

#[async_trait::async_trait]
impl crate::worker::Handler for Fetcher {
    async fn process(&self, body: &[u8]) -> HandlerOutcome {
        Fetcher::process(self, body).await
    }
}
