//! Change-notification bridge.
//!
//! Turns a store's change feed into a blocking `wait_change(timeout)`
//! primitive. The feed listener is started lazily, by [`ChangeNotifier::start`]
//! or by the first waiter, and at most one listener runs at a time. Every
//! waiter registers its own one-shot slot keyed by a per-call token before the
//! listener is started; a change notice wakes and clears all registered slots.
//!
//! A change that lands after a caller last read the store but before its slot
//! is registered is not seen by that wait. Such a change costs at most one
//! wait timeout.
//!
//! If the feed cannot be subscribed, or dies later, the listener logs and
//! exits. Waits then fall back to their timeout, and the next caller tries to
//! start the listener again.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::DbEventResult;

/// Source of change notices for the event log.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    /// Subscribe from the current tail of the feed (no history).
    async fn subscribe(&self) -> DbEventResult<Box<dyn ChangeSubscription>>;
}

/// A live subscription to a [`ChangeFeed`].
#[async_trait]
pub trait ChangeSubscription: Send {
    /// Wait for the next write to the watched table.
    async fn next_change(&mut self) -> DbEventResult<()>;
}

#[derive(Default)]
struct Waiters {
    next_token: AtomicU64,
    slots: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl Waiters {
    fn register(self: &Arc<Self>) -> (WaitSlot, oneshot::Receiver<()>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(token, tx);

        (
            WaitSlot {
                token,
                waiters: self.clone(),
            },
            rx,
        )
    }

    fn notify_all(&self) -> usize {
        let slots: Vec<_> = self.slots.lock().drain().collect();
        let count = slots.len();
        for (_, tx) in slots {
            let _ = tx.send(());
        }
        count
    }
}

/// Deregisters its slot when the wait finishes, times out or is dropped.
struct WaitSlot {
    token: u64,
    waiters: Arc<Waiters>,
}

impl Drop for WaitSlot {
    fn drop(&mut self) {
        self.waiters.slots.lock().remove(&self.token);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Starting,
    Listening,
    Stopped,
}

pub struct ChangeNotifier {
    feed: Arc<dyn ChangeFeed>,
    waiters: Arc<Waiters>,
    listener: Mutex<Option<JoinHandle<()>>>,
    state: Arc<watch::Sender<ListenerState>>,
}

impl ChangeNotifier {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);

        Self {
            feed,
            waiters: Arc::new(Waiters::default()),
            listener: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    /// Start the listener if it is not running and wait until it is subscribed.
    ///
    /// Returns `true` if the listener is subscribed to the feed, `false` if the
    /// subscription failed or did not finish within `timeout`.
    pub async fn start(&self, timeout: Duration) -> bool {
        self.start_until(Instant::now() + timeout).await
    }

    /// Block until a change notice arrives or `timeout` elapses.
    ///
    /// Returns `true` if woken by a change notice, `false` on timeout.
    pub async fn wait_change(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let (_slot, rx) = self.waiters.register();
        self.start_until(deadline).await;
        let signaled = matches!(tokio::time::timeout_at(deadline, rx).await, Ok(Ok(())));

        debug!(signaled, "Wait for change finished");
        signaled
    }

    /// Number of callers currently blocked in `wait_change`.
    pub fn waiter_count(&self) -> usize {
        self.waiters.slots.lock().len()
    }

    pub fn is_listening(&self) -> bool {
        let running = self
            .listener
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);

        running && *self.state.borrow() == ListenerState::Listening
    }

    /// Stop the listener. Pending waiters return early.
    pub fn close(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.state.send_replace(ListenerState::Stopped);
        self.waiters.slots.lock().clear();
    }

    async fn start_until(&self, deadline: Instant) -> bool {
        self.ensure_listening();

        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|state| *state != ListenerState::Starting);
        let listening = match tokio::time::timeout_at(deadline, settled).await {
            Ok(Ok(state)) => *state == ListenerState::Listening,
            _ => false,
        };
        listening
    }

    fn ensure_listening(&self) {
        let mut listener = self.listener.lock();

        if let Some(handle) = listener.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        self.state.send_replace(ListenerState::Starting);
        *listener = Some(tokio::spawn(listen(
            self.feed.clone(),
            self.waiters.clone(),
            self.state.clone(),
        )));
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

async fn listen(
    feed: Arc<dyn ChangeFeed>,
    waiters: Arc<Waiters>,
    state: Arc<watch::Sender<ListenerState>>,
) {
    let mut subscription = match feed.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = ?e, "Change feed unavailable, waits fall back to timeout");
            state.send_replace(ListenerState::Stopped);
            return;
        }
    };

    state.send_replace(ListenerState::Listening);
    info!("Change feed listener started");

    loop {
        match subscription.next_change().await {
            Ok(()) => {
                let woken = waiters.notify_all();
                debug!(woken, "Change observed");
            }
            Err(e) => {
                warn!(error = ?e, "Change feed listener stopped, waits fall back to timeout");
                state.send_replace(ListenerState::Stopped);
                return;
            }
        }
    }
}
