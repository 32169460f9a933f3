//! Rate limiting of refresh requests.
//!
//! A [`RefreshThrottle`] is owned by the single task that runs refreshes for
//! one live query; any number of [`ThrottleHandle`]s feed it signals. Signals
//! arriving inside a throttle window collapse into one refresh started when
//! the window closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

struct ThrottleShared {
    pending: AtomicBool,
    notify: Notify,
}

/// Cloneable, non-blocking sender of refresh requests.
#[derive(Clone)]
pub struct ThrottleHandle {
    shared: Arc<ThrottleShared>,
}

impl ThrottleHandle {
    /// Requests a refresh. Never blocks.
    pub fn signal(&self) {
        self.shared.pending.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    /// Whether a request is waiting to be served.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire)
    }
}

pub struct RefreshThrottle {
    interval: Duration,
    shared: Arc<ThrottleShared>,
    last_start: Option<Instant>,
}

impl RefreshThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            shared: Arc::new(ThrottleShared {
                pending: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            last_start: None,
        }
    }

    pub fn handle(&self) -> ThrottleHandle {
        ThrottleHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until a refresh may start: at least one signal is pending and the
    /// window since the previous start has elapsed.
    ///
    /// Every signal received up to the moment this returns is considered
    /// served by the refresh the caller is about to run.
    pub async fn acquire(&mut self) {
        while !self.shared.pending.swap(false, Ordering::AcqRel) {
            self.shared.notify.notified().await;
        }

        if let Some(last) = self.last_start {
            sleep_until(last + self.interval).await;
        }

        self.shared.pending.store(false, Ordering::Release);
        self.last_start = Some(Instant::now());
    }
}
