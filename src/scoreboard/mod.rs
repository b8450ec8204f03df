//! Scheduler for the concurrent fetcher: per-origin admission control plus
//! a process-wide concurrency cap. "Scoreboard"/"issue"/"retire"
//! terminology borrowed from CPU instruction scheduling.
//!
//! Hides locking and data-structure details behind `issue`/`retire`.

pub mod lock;
pub mod slot;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::info;

pub use lock::{Lock, LockError, Timer};
pub use slot::{ConnStatus, IssueStatus, Slot};

/// An origin identity used as the scoreboard key. Currently just the
/// fully-qualified domain name; kept as a newtype so a future switch to a
/// richer origin key (e.g. IP-set based) doesn't ripple through call sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fqdn(pub String);

impl Fqdn {
    pub fn new(s: impl Into<String>) -> Self {
        Fqdn(s.into())
    }
}

impl std::fmt::Display for Fqdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct IssueReturn<'a> {
    pub status: IssueStatus,
    pub slot: Option<SlotHandle<'a>>,
}

/// A held slot. Drop without calling `retire` only on the skip/busy path;
/// an `Ok` issue must be retired exactly once.
pub struct SlotHandle<'a> {
    board: &'a ScoreBoard,
    fqdn: Fqdn,
    holder: String,
}

impl<'a> SlotHandle<'a> {
    pub fn retire(self, conn_status: ConnStatus, elapsed: Duration) {
        self.board.retire(&self.fqdn, &self.holder, conn_status, elapsed);
    }
}

const TS_IDLE: &str = "idle";

struct HolderStatus {
    info: String,
    ts: Instant,
}

struct Inner {
    slots: HashMap<Fqdn, Slot>,
    active_fetches: u32,
    active_slots: u32,
    holder_status: HashMap<String, HolderStatus>,
}

/// Keeps score of active fetches by origin (FQDN).
///
/// All mutable state lives behind a single process-wide lock, matching the
/// source's rationale: time spent holding it is always small, and having
/// one lock per slot would create lock-ordering hazards for no benefit.
pub struct ScoreBoard {
    big_lock: Lock,
    inner: parking_lot::Mutex<Inner>,
    pub max_active: u32,
    pub target_concurrency: u32,
    pub conn_retry: Duration,
}

impl ScoreBoard {
    pub fn new(max_active: u32, target_concurrency: u32, conn_retry: Duration) -> Self {
        ScoreBoard {
            big_lock: Lock::new("scoreboard"),
            inner: parking_lot::Mutex::new(Inner {
                slots: HashMap::new(),
                active_fetches: 0,
                active_slots: 0,
                holder_status: HashMap::new(),
            }),
            max_active,
            target_concurrency,
            conn_retry,
        }
    }

    /// Try to admit `holder` (an identifier for the task, analogous to
    /// thread name in the source) to fetch from `fqdn`. `note` is typically
    /// the full URL, recorded for `debug_info_nolock`.
    pub fn issue(&self, fqdn: &Fqdn, holder: &str, note: &str) -> IssueReturn<'_> {
        let guard = self
            .big_lock
            .acquire(holder, || self.debug_info_nolock())
            .expect("scoreboard lock");

        let mut inner = self.inner.lock();
        if inner.active_fetches >= self.max_active {
            drop(guard);
            return IssueReturn {
                status: IssueStatus::Busy,
                slot: None,
            };
        }

        let slot = inner
            .slots
            .entry(fqdn.clone())
            .or_insert_with(|| Slot::new(self.target_concurrency, self.conn_retry));
        let status = slot.try_issue(holder);

        if status == IssueStatus::Ok {
            if slot.active_count == 1 {
                inner.active_slots += 1;
            }
            inner.active_fetches += 1;
            inner.holder_status.insert(
                holder.to_string(),
                HolderStatus {
                    info: note.to_string(),
                    ts: Instant::now(),
                },
            );
            drop(inner);
            drop(guard);
            return IssueReturn {
                status,
                slot: Some(SlotHandle {
                    board: self,
                    fqdn: fqdn.clone(),
                    holder: holder.to_string(),
                }),
            };
        }

        drop(inner);
        drop(guard);
        IssueReturn { status, slot: None }
    }

    fn retire(&self, fqdn: &Fqdn, holder: &str, conn_status: ConnStatus, elapsed: Duration) {
        let guard = self
            .big_lock
            .acquire(holder, || self.debug_info_nolock())
            .expect("scoreboard lock");

        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(fqdn)
            .expect("retire called for unknown slot");
        slot.retire(holder, conn_status, elapsed);
        let slot_idle = slot.active_count == 0;

        assert!(inner.active_fetches > 0, "retire with no active fetch");
        inner.active_fetches -= 1;
        if slot_idle {
            assert!(inner.active_slots > 0, "retire with no active slot");
            inner.active_slots -= 1;
        }
        inner.holder_status.insert(
            holder.to_string(),
            HolderStatus {
                info: TS_IDLE.to_string(),
                ts: Instant::now(),
            },
        );
        drop(inner);
        drop(guard);
    }

    /// Called periodically from the main task to age out idle slots and
    /// report gauges. `dump_slots` additionally logs per-slot debug info.
    pub fn periodic(&self, stats: &dyn crate::app::stats::Stats, dump_slots: bool) {
        let holder = "periodic";
        let guard = self
            .big_lock
            .acquire(holder, || self.debug_info_nolock())
            .expect("scoreboard lock");

        let mut inner = self.inner.lock();
        inner.slots.retain(|_, slot| !slot.removable());

        let recent = inner.slots.len();
        let active_fetches = inner.active_fetches;
        let active_slots = inner.active_slots;

        if dump_slots {
            self.debug_info_locked(&inner);
        }
        drop(inner);
        drop(guard);

        info!(
            "{recent} recently active; {active_fetches} URLs in {active_slots} domains active"
        );
        stats.gauge("active.recent", recent as f64);
        stats.gauge("active.fetches", active_fetches as f64);
        stats.gauge("active.slots", active_slots as f64);
    }

    /// Dumps scoreboard state without acquiring `big_lock`. Called from the
    /// lock's own timeout handler, where attempting to acquire it again
    /// would deadlock, and by `periodic` while already holding it.
    pub fn debug_info_nolock(&self) {
        if let Some(inner) = self.inner.try_lock() {
            self.debug_info_locked(&inner);
        } else {
            info!("scoreboard inner lock also unavailable; skipping debug dump");
        }
    }

    fn debug_info_locked(&self, inner: &Inner) {
        for (fqdn, slot) in inner.slots.iter() {
            info!(
                "{fqdn}: {} last issue: {} last err: {}",
                slot.active_holders.join(","),
                slot.last_issue,
                slot.last_conn_error,
            );
        }

        let lock_owner = inner
            .holder_status
            .keys()
            .find(|h| self.big_lock.held_by(h))
            .cloned();

        let now = Instant::now();
        for (holder, status) in inner.holder_status.iter() {
            if status.info == TS_IDLE {
                continue;
            }
            let have_lock = if lock_owner.as_deref() == Some(holder.as_str()) {
                " *LOCK*"
            } else {
                ""
            };
            info!(
                "{holder}{have_lock} {:.3} {}",
                (now - status.ts).as_secs_f64(),
                status.info
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_busy_at_concurrency_limit() {
        let board = ScoreBoard::new(10, 1, Duration::from_secs(60));
        let fqdn = Fqdn::new("example.com");

        let r1 = board.issue(&fqdn, "t1", "http://example.com/a");
        assert_eq!(r1.status, IssueStatus::Ok);

        let r2 = board.issue(&fqdn, "t2", "http://example.com/b");
        assert_eq!(r2.status, IssueStatus::Busy);

        r1.slot.unwrap().retire(ConnStatus::Data, Duration::from_millis(10));

        let r3 = board.issue(&fqdn, "t3", "http://example.com/c");
        assert_eq!(r3.status, IssueStatus::Ok);
    }

    #[test]
    fn max_active_caps_process_wide() {
        let board = ScoreBoard::new(1, 5, Duration::from_secs(60));
        let a = Fqdn::new("a.example.com");
        let b = Fqdn::new("b.example.com");

        let r1 = board.issue(&a, "t1", "http://a.example.com/");
        assert_eq!(r1.status, IssueStatus::Ok);

        let r2 = board.issue(&b, "t2", "http://b.example.com/");
        assert_eq!(r2.status, IssueStatus::Busy);
    }

    #[test]
    fn conn_error_skips_until_retry_window_passes() {
        let board = ScoreBoard::new(10, 1, Duration::from_secs(3600));
        let fqdn = Fqdn::new("flaky.example.com");

        let r1 = board.issue(&fqdn, "t1", "http://flaky.example.com/");
        assert_eq!(r1.status, IssueStatus::Ok);
        r1.slot
            .unwrap()
            .retire(ConnStatus::NoConn, Duration::from_millis(5));

        let r2 = board.issue(&fqdn, "t2", "http://flaky.example.com/");
        assert_eq!(r2.status, IssueStatus::Skipped);
    }
}
