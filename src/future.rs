use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::Error;

/// Observable state of a [`ResponseFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// Submitted, not yet started.
    New,
    /// An Attempt is running.
    InFlight,
    /// Resolved with a value.
    Completed,
    /// Resolved with an error.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl FutureState {
    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FutureState::Completed | FutureState::Failed | FutureState::Cancelled
        )
    }
}

/// Runs listener callbacks.
pub trait Executor: Send + Sync + 'static {
    /// Run `task`, now or later.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs listeners on the thread that resolves the future.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task()
    }
}

impl Executor for tokio::runtime::Handle {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.spawn(async move { task() });
    }
}

/// Handle to the outcome of one logical request.
///
/// The future resolves exactly once, to a value, an error or cancellation.
/// Completion attempts racing each other (a timer firing as the response
/// arrives) are settled by the first one, the rest are discarded.
///
/// Clones share the same outcome.
pub struct ResponseFuture<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    done: Notify,
    cancel: Notify,
    redirect_count: AtomicU32,
    current_retry: AtomicU32,
    max_retry: u32,
    in_auth: AtomicBool,
}

struct State<T> {
    phase: Phase,
    result: Option<Result<T, Error>>,
    listeners: Vec<(Box<dyn FnOnce() + Send>, Box<dyn Executor>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    InFlight,
    // The engine is running the handler's terminal callback.
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl<T: Send + 'static> ResponseFuture<T> {
    pub(crate) fn new(max_retry: u32) -> Self {
        ResponseFuture {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    phase: Phase::New,
                    result: None,
                    listeners: Vec::new(),
                }),
                cond: Condvar::new(),
                done: Notify::new(),
                cancel: Notify::new(),
                redirect_count: AtomicU32::new(0),
                current_retry: AtomicU32::new(0),
                max_retry,
                in_auth: AtomicBool::new(false),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> FutureState {
        match self.inner.state.lock().phase {
            Phase::New => FutureState::New,
            Phase::InFlight | Phase::Completing => FutureState::InFlight,
            Phase::Completed => FutureState::Completed,
            Phase::Failed => FutureState::Failed,
            Phase::Cancelled => FutureState::Cancelled,
        }
    }

    /// Whether the future has resolved.
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the future was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// Run `listener` on `executor` once the future has resolved.
    ///
    /// Runs right away if it already has.
    pub fn add_listener<F, E>(&self, listener: F, executor: E)
    where
        F: FnOnce() + Send + 'static,
        E: Executor,
    {
        let listener: Box<dyn FnOnce() + Send> = Box::new(listener);
        {
            let mut state = self.inner.state.lock();
            if !state.phase.is_terminal() {
                state.listeners.push((listener, Box::new(executor)));
                return;
            }
        }
        executor.execute(listener);
    }

    /// Cancel the request.
    ///
    /// Returns `true` if this call cancelled it, `false` if the future had
    /// already resolved or is being resolved. Calling it again is a no-op.
    pub fn cancel(&self) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() || state.phase == Phase::Completing {
                return false;
            }
            state.phase = Phase::Cancelled;
            state.result = Some(Err(Error::Cancelled));
            std::mem::take(&mut state.listeners)
        };

        debug!("Cancel request");

        // Permit stored for a task that is not waiting yet.
        self.inner.cancel.notify_one();
        self.inner.cancel.notify_waiters();

        self.notify_done(listeners);
        true
    }

    /// The outcome, if resolved.
    pub fn try_get(&self) -> Option<Result<T, Error>>
    where
        T: Clone,
    {
        self.inner.state.lock().result.clone()
    }

    /// Wait for the outcome.
    pub async fn get(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        loop {
            let notified = self.inner.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(r) = self.try_get() {
                return r;
            }

            notified.await;
        }
    }

    /// Block the current thread until the outcome is known.
    ///
    /// Must not be called from an async context.
    pub fn wait(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(r) = &state.result {
                return r.clone();
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Number of redirects followed so far.
    pub fn redirect_count(&self) -> u32 {
        self.inner.redirect_count.load(Ordering::Acquire)
    }

    /// Number of retries consumed so far.
    pub fn current_retry(&self) -> u32 {
        self.inner.current_retry.load(Ordering::Acquire)
    }

    pub(crate) fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.phase == Phase::New {
            state.phase = Phase::InFlight;
        }
    }

    /// Claim the right to resolve the future. Only one caller ever gets `true`.
    pub(crate) fn begin_completion(&self) -> bool {
        let mut state = self.inner.state.lock();
        match state.phase {
            Phase::New | Phase::InFlight => {
                state.phase = Phase::Completing;
                true
            }
            _ => false,
        }
    }

    /// Resolve after a successful [`ResponseFuture::begin_completion`].
    pub(crate) fn finish(&self, result: Result<T, Error>) {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Completing {
                return;
            }
            state.phase = if result.is_ok() {
                Phase::Completed
            } else {
                Phase::Failed
            };
            state.result = Some(result);
            std::mem::take(&mut state.listeners)
        };
        self.notify_done(listeners);
    }

    /// Resolve with `error` unless already resolved, also taking over an
    /// unfinished completion.
    pub(crate) fn abandon(&self, error: Error) {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = Phase::Failed;
            state.result = Some(Err(error));
            std::mem::take(&mut state.listeners)
        };
        self.notify_done(listeners);
    }

    /// Resolves when the future is cancelled.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.inner.cancel.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return;
            }

            notified.await;
        }
    }

    /// Count one more redirect, returning the new total.
    pub(crate) fn increment_redirect(&self) -> u32 {
        self.inner.redirect_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Consume one retry. `false` when the budget is exhausted.
    pub(crate) fn increment_retry_and_check(&self) -> bool {
        let max = self.inner.max_retry;
        self.inner
            .current_retry
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    pub(crate) fn set_in_auth(&self, v: bool) {
        self.inner.in_auth.store(v, Ordering::Release);
    }

    pub(crate) fn is_in_auth(&self) -> bool {
        self.inner.in_auth.load(Ordering::Acquire)
    }

    fn notify_done(&self, listeners: Vec<(Box<dyn FnOnce() + Send>, Box<dyn Executor>)>) {
        self.inner.cond.notify_all();
        self.inner.done.notify_waiters();
        for (listener, executor) in listeners {
            executor.execute(listener);
        }
    }
}

impl<T> Clone for ResponseFuture<T> {
    fn clone(&self) -> Self {
        ResponseFuture {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResponseFuture")
            .field("phase", &state.phase)
            .field("redirects", &self.inner.redirect_count.load(Ordering::Relaxed))
            .field("retries", &self.inner.current_retry.load(Ordering::Relaxed))
            .finish()
    }
}
