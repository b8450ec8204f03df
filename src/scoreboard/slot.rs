use std::time::Duration;

use super::lock::Timer;

pub const SLOT_RECENT_MINUTES: u64 = 5;
/// exponential moving average coefficient for avg_seconds, as used by TCP
/// for RTT estimation.
pub const ALPHA: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStatus {
    /// slot assigned; caller must call `retire`
    Ok,
    /// too many fetches active, or too soon since the last one
    Busy,
    /// recent connection error at this origin
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    NoConn,
    BadUrl,
    NoData,
    Data,
}

/// A slot for a single origin (e.g. FQDN) within a [`super::ScoreBoard`].
pub struct Slot {
    pub active_count: u32,
    pub last_issue: Timer,
    pub last_conn_error: Timer,
    pub avg_seconds: f64,
    pub issue_interval: Duration,
    pub active_holders: Vec<String>,
    target_concurrency: u32,
}

impl Slot {
    pub fn new(target_concurrency: u32, conn_retry: Duration) -> Self {
        Slot {
            active_count: 0,
            last_issue: Timer::new(Some(Duration::from_secs(SLOT_RECENT_MINUTES * 60))),
            last_conn_error: Timer::new(Some(conn_retry)),
            avg_seconds: 0.0,
            issue_interval: Duration::ZERO,
            active_holders: Vec::new(),
            target_concurrency,
        }
    }

    /// Caller must already hold the scoreboard's big lock.
    pub fn try_issue(&mut self, holder: &str) -> IssueStatus {
        if self.avg_seconds == 0.0 {
            if self.active_count >= self.target_concurrency {
                return IssueStatus::Busy;
            }
        } else if self.last_issue.elapsed() < self.issue_interval {
            return IssueStatus::Busy;
        }

        if !self.last_conn_error.expired() {
            return IssueStatus::Skipped;
        }

        self.active_count += 1;
        self.last_issue.reset();
        self.active_holders.push(holder.to_string());
        IssueStatus::Ok
    }

    /// Caller must already hold the scoreboard's big lock.
    pub fn retire(&mut self, holder: &str, conn_status: ConnStatus, elapsed: Duration) {
        assert!(self.active_count > 0, "retire called with no active fetch");
        self.active_count -= 1;
        if let Some(pos) = self.active_holders.iter().position(|h| h == holder) {
            self.active_holders.remove(pos);
        }

        let secs = elapsed.as_secs_f64();
        let old_avg = self.avg_seconds;
        match conn_status {
            ConnStatus::NoConn => self.last_conn_error.reset(),
            ConnStatus::Data => {
                if self.avg_seconds == 0.0 {
                    self.avg_seconds = secs;
                } else {
                    self.avg_seconds += (secs - self.avg_seconds) * super::slot::ALPHA;
                }
            }
            ConnStatus::NoData => {
                if self.avg_seconds == 0.0 {
                    self.avg_seconds = secs;
                }
            }
            ConnStatus::BadUrl => {}
        }

        if self.avg_seconds != old_avg {
            self.issue_interval =
                Duration::from_secs_f64(self.avg_seconds / self.target_concurrency as f64);
        }
    }

    pub fn removable(&self) -> bool {
        self.active_count == 0 && self.last_issue.expired() && self.last_conn_error.expired()
    }
}
