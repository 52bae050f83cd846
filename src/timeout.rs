//! Request and idle timers racing an Attempt.
//!
//! [`TimeoutsHolder::arm`] spawns up to two timer tasks. The first one to
//! fire delivers an [`Error::Timeout`] through the [`TimeoutSignal`], which
//! the Attempt races against its own progress. Later firings and firings
//! after [`TimeoutsHolder::cancel`] are no-ops.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::Error;

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Deadline for the whole Attempt.
    Request,
    /// No bytes sent or received for too long.
    Idle,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Request => write!(f, "request timeout"),
            TimeoutKind::Idle => write!(f, "read timeout"),
        }
    }
}

/// The timers of one Attempt.
///
/// Both timers are cancelled when the holder is dropped.
pub struct TimeoutsHolder {
    shared: Arc<Shared>,
    request_timer: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

/// Receives the error of the first timer to fire.
pub struct TimeoutSignal {
    rx: Option<oneshot::Receiver<Error>>,
}

struct Shared {
    start: Instant,
    // Micros since start of the last activity.
    last_touch: AtomicU64,
    remote: Mutex<Option<SocketAddr>>,
    fire: Mutex<Option<oneshot::Sender<Error>>>,
    request_cancelled: AtomicBool,
    idle_cancelled: AtomicBool,
}

impl TimeoutsHolder {
    /// Start the timers. `None` disables a timer.
    ///
    /// Must be called within a tokio runtime.
    pub fn arm(request: Option<Duration>, idle: Option<Duration>) -> (TimeoutsHolder, TimeoutSignal) {
        let (tx, rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            start: Instant::now(),
            last_touch: AtomicU64::new(0),
            remote: Mutex::new(None),
            fire: Mutex::new(Some(tx)),
            request_cancelled: AtomicBool::new(false),
            idle_cancelled: AtomicBool::new(false),
        });

        let request_timer = request.map(|after| {
            let shared = shared.clone();
            tokio::spawn(async move {
                sleep_until(shared.start + after).await;
                shared.fire(TimeoutKind::Request, after);
            })
        });

        let idle_timer = idle.map(|after| {
            let shared = shared.clone();
            tokio::spawn(async move {
                let mut deadline = shared.start + after;
                loop {
                    sleep_until(deadline).await;
                    let next = shared.last_activity() + after;
                    if next > Instant::now() {
                        deadline = next;
                        continue;
                    }
                    shared.fire(TimeoutKind::Idle, after);
                    break;
                }
            })
        });

        let holder = TimeoutsHolder {
            shared,
            request_timer,
            idle_timer,
        };

        (holder, TimeoutSignal { rx: Some(rx) })
    }

    /// Record activity, pushing the idle deadline forward.
    pub fn touch(&self) {
        let micros = self.shared.start.elapsed().as_micros() as u64;
        self.shared.last_touch.fetch_max(micros, Ordering::Relaxed);
    }

    /// Remote address to report in a timeout error.
    pub fn set_remote(&self, remote: SocketAddr) {
        *self.shared.remote.lock() = Some(remote);
    }

    /// Cancel the request timer only.
    pub fn cancel_request_timer(&self) {
        self.shared.request_cancelled.store(true, Ordering::Release);
        if let Some(h) = &self.request_timer {
            h.abort();
        }
    }

    /// Cancel the idle timer only.
    pub fn cancel_idle_timer(&self) {
        self.shared.idle_cancelled.store(true, Ordering::Release);
        if let Some(h) = &self.idle_timer {
            h.abort();
        }
    }

    /// Cancel both timers. Idempotent.
    pub fn cancel(&self) {
        self.cancel_request_timer();
        self.cancel_idle_timer();
    }
}

impl Drop for TimeoutsHolder {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Shared {
    fn last_activity(&self) -> Instant {
        self.start + Duration::from_micros(self.last_touch.load(Ordering::Relaxed))
    }

    fn fire(&self, kind: TimeoutKind, after: Duration) {
        let cancelled = match kind {
            TimeoutKind::Request => &self.request_cancelled,
            TimeoutKind::Idle => &self.idle_cancelled,
        };
        if cancelled.load(Ordering::Acquire) {
            return;
        }

        // First timer to take the sender wins.
        let Some(tx) = self.fire.lock().take() else {
            return;
        };

        let remote = *self.remote.lock();
        debug!("Fire {} of {:?}", kind, after);

        let _ = tx.send(Error::Timeout {
            kind,
            after,
            remote,
        });
    }
}

impl TimeoutSignal {
    /// Wait for a timer to fire.
    ///
    /// Pending forever once the timers are cancelled or a timeout has
    /// already been returned.
    pub async fn fired(&mut self) -> Error {
        let fired = match self.rx.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        };
        self.rx = None;

        match fired {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }
}

impl fmt::Debug for TimeoutsHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutsHolder")
            .field("request", &self.request_timer.is_some())
            .field("idle", &self.idle_timer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::{sleep, timeout};

    const MS: Duration = Duration::from_millis(1);

    #[tokio::test(start_paused = true)]
    async fn request_timer_fires() {
        let (holder, mut signal) = TimeoutsHolder::arm(Some(100 * MS), None);
        holder.set_remote("10.0.0.1:443".parse().unwrap());

        let start = Instant::now();
        let err = signal.fired().await;

        assert!(start.elapsed() >= 100 * MS);
        assert_eq!(
            err,
            Error::Timeout {
                kind: TimeoutKind::Request,
                after: 100 * MS,
                remote: Some("10.0.0.1:443".parse().unwrap()),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_timer_ignores_activity() {
        let (holder, mut signal) = TimeoutsHolder::arm(Some(100 * MS), None);
        let start = Instant::now();

        let fired = async {
            let err = signal.fired().await;
            (err, start.elapsed())
        };
        let touching = async {
            loop {
                sleep(10 * MS).await;
                holder.touch();
            }
        };

        let (err, elapsed) = tokio::select! {
            r = fired => r,
            _ = touching => unreachable!(),
        };

        assert!(matches!(err, Error::Timeout { kind: TimeoutKind::Request, .. }));
        assert!(elapsed >= 100 * MS && elapsed < 110 * MS);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_pushed_by_activity() {
        let (holder, mut signal) = TimeoutsHolder::arm(None, Some(100 * MS));

        for _ in 0..5 {
            sleep(60 * MS).await;
            holder.touch();
        }

        let start = Instant::now();
        let err = signal.fired().await;

        assert!(start.elapsed() >= 100 * MS);
        assert!(matches!(err, Error::Timeout { kind: TimeoutKind::Idle, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn first_timer_wins() {
        let (_holder, mut signal) = TimeoutsHolder::arm(Some(200 * MS), Some(50 * MS));
        let err = signal.fired().await;
        assert!(matches!(err, Error::Timeout { kind: TimeoutKind::Idle, .. }));

        // The request timer firing later is discarded.
        let res = timeout(Duration::from_secs(1), signal.fired()).await;
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_silences_timers() {
        let (holder, mut signal) = TimeoutsHolder::arm(Some(50 * MS), Some(50 * MS));
        holder.cancel();
        holder.cancel();

        let res = timeout(Duration::from_secs(10), signal.fired()).await;
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_one_timer_keeps_the_other() {
        let (holder, mut signal) = TimeoutsHolder::arm(Some(100 * MS), Some(50 * MS));
        holder.cancel_idle_timer();

        let err = signal.fired().await;
        assert!(matches!(err, Error::Timeout { kind: TimeoutKind::Request, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fire_is_noop() {
        let (holder, mut signal) = TimeoutsHolder::arm(Some(10 * MS), None);
        let _ = signal.fired().await;
        holder.cancel();
        drop(holder);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let (holder, mut signal) = TimeoutsHolder::arm(Some(10 * MS), None);
        drop(holder);
        let res = timeout(Duration::from_secs(1), signal.fired()).await;
        assert!(res.is_err());
    }
}
