//! A non-recursive mutex with an acquisition timeout and a fatal diagnostic
//! dump on timeout, matching the source's `sched.Lock`. Built on
//! `parking_lot::Mutex` for `try_lock_for`.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
pub enum LockError {
    /// took too long to get the lock
    Timeout(String),
    /// the current holder (or a would-be re-entrant caller) already owns it
    AlreadyHeld(String),
    /// asserted held but wasn't
    NotHeld(String),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Timeout(name) => write!(f, "timed out acquiring lock {name}"),
            LockError::AlreadyHeld(name) => write!(f, "lock {name} already held (non-recursive)"),
            LockError::NotHeld(name) => write!(f, "lock {name} not held"),
        }
    }
}

impl std::error::Error for LockError {}

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(120);

/// Wraps `parking_lot::Mutex<()>`, tracking which holder id currently owns
/// it so re-entrance from the same logical owner is detected rather than
/// silently deadlocking (parking_lot's plain Mutex is not reentrant either,
/// but without tracking, a re-entrant call would just hang until the
/// timeout; tracking turns it into an immediate, diagnosable error).
pub struct Lock {
    name: &'static str,
    inner: Mutex<()>,
    owner: Mutex<Option<String>>,
}

pub struct Guard<'a> {
    lock: &'a Lock,
    _inner: parking_lot::MutexGuard<'a, ()>,
}

impl Lock {
    pub fn new(name: &'static str) -> Self {
        Lock {
            name,
            inner: Mutex::new(()),
            owner: Mutex::new(None),
        }
    }

    pub fn held_by(&self, holder: &str) -> bool {
        self.owner.lock().as_deref() == Some(holder)
    }

    /// Acquire the lock, failing fast if `holder` already owns it, and with
    /// a 120s acquisition timeout otherwise. On either failure, `on_timeout`
    /// is invoked to dump scoreboard state without the lock held.
    pub fn acquire(&self, holder: &str, on_timeout: impl FnOnce()) -> Result<Guard<'_>, LockError> {
        if self.held_by(holder) {
            on_timeout();
            return Err(LockError::AlreadyHeld(self.name.to_string()));
        }
        match self.inner.try_lock_for(ACQUIRE_TIMEOUT) {
            Some(guard) => {
                *self.owner.lock() = Some(holder.to_string());
                Ok(Guard {
                    lock: self,
                    _inner: guard,
                })
            }
            None => {
                on_timeout();
                Err(LockError::Timeout(self.name.to_string()))
            }
        }
    }

    pub fn assert_held(&self, holder: &str) -> Result<(), LockError> {
        if self.held_by(holder) {
            Ok(())
        } else {
            Err(LockError::NotHeld(self.name.to_string()))
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        *self.lock.owner.lock() = None;
    }
}

const NEVER: Option<Instant> = None;

/// Measures elapsed time since `reset`; doesn't start ticking until then.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    last: Option<Instant>,
    duration: Option<Duration>,
}

impl Timer {
    pub fn new(duration: Option<Duration>) -> Self {
        Timer {
            last: NEVER,
            duration,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self.last {
            None => Duration::MAX,
            Some(t) => t.elapsed(),
        }
    }

    pub fn reset(&mut self) {
        self.last = Some(Instant::now());
    }

    pub fn expired(&self) -> bool {
        match self.duration {
            None => false,
            Some(d) => self.elapsed() >= d,
        }
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.last.is_none() {
            write!(f, "not set")
        } else if self.expired() {
            write!(f, "expired")
        } else {
            write!(f, "{:.3}", self.elapsed().as_secs_f64())
        }
    }
}
