use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// Lock a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a wait on a [`ResultBridge`] observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The producer delivered a value
    Complete(T),
    /// Nothing arrived before the timeout
    TimedOut,
    /// The bridge was canceled before a value arrived
    Canceled,
}

enum State<T> {
    Pending,
    Complete(T),
    Canceled,
}

/// Single-result rendezvous between a hardware callback and a waiting call.
///
/// The first of [`complete`](Self::complete) and [`cancel`](Self::cancel) wins, later calls
/// are no-ops. Any number of waiters observe the same outcome.
pub struct ResultBridge<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Clone> ResultBridge<T> {
    /// A pending bridge
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            notify: Notify::new(),
        }
    }

    /// Store `value` unless the bridge is already done. Returns whether the value was taken.
    pub fn complete(&self, value: T) -> bool {
        let mut state = lock(&self.state);
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Complete(value);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Force waiters to return without a value. Returns whether the bridge was still pending.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Canceled;
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Whether a value arrived or the bridge was canceled
    pub fn is_done(&self) -> bool {
        !matches!(*lock(&self.state), State::Pending)
    }

    fn current(&self) -> Option<Outcome<T>> {
        match &*lock(&self.state) {
            State::Pending => None,
            State::Complete(value) => Some(Outcome::Complete(value.clone())),
            State::Canceled => Some(Outcome::Canceled),
        }
    }

    /// Wait until the bridge completes, is canceled or `timeout` elapses
    pub async fn wait(&self, timeout: Duration) -> Outcome<T> {
        let settled = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Register interest before looking at the state so a completion in between is not lost
                notified.as_mut().enable();
                if let Some(outcome) = self.current() {
                    return outcome;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, settled).await {
            Ok(outcome) => outcome,
            Err(_) => self.current().unwrap_or(Outcome::TimedOut),
        }
    }
}

impl<T: Clone> Default for ResultBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Something an in-flight call can cancel without knowing its value type
pub(crate) trait Cancelable: Send + Sync {
    fn cancel(&self) -> bool;
}

impl<T: Clone + Send> Cancelable for ResultBridge<T> {
    fn cancel(&self) -> bool {
        ResultBridge::cancel(self)
    }
}
