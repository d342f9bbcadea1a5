//! Consumer run loop: fetch → dispatch → commit → backoff/reset → wait.
//!
//! Each [`Consumer::consume`] call spawns exactly one tokio task. Fetch,
//! handler, commit and wait all run sequentially on that task. Closing is
//! cooperative: the loop checks its state only at the top of each iteration,
//! so an in-flight fetch, handler or wait always completes first.

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::backoff::{Backoff, BackoffConfig, Backoffer};
use crate::driver::ConsumerDriver;
use crate::error::{DbEventError, DbEventResult};
use crate::event::Event;
use crate::metrics::ConsumerMetrics;

const DEFAULT_WAIT_CHANGE_TIMEOUT_SECS: u64 = 20;
const DEFAULT_BATCH_SIZE: i64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Upper bound on a single wait for new events after an empty fetch
    pub wait_change_timeout: Duration,
    /// Maximum number of events fetched per iteration
    pub batch_size: i64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            wait_change_timeout: Duration::from_secs(DEFAULT_WAIT_CHANGE_TIMEOUT_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ConsumerConfig {
    /// Create a ConsumerConfig from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            wait_change_timeout: Duration::from_secs(
                std::env::var("DB_EVENT_WAIT_CHANGE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_WAIT_CHANGE_TIMEOUT_SECS),
            ),
            batch_size: std::env::var("DB_EVENT_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
        }
        .normalized()
    }

    fn normalized(mut self) -> Self {
        if self.wait_change_timeout.is_zero() {
            self.wait_change_timeout = Duration::from_secs(DEFAULT_WAIT_CHANGE_TIMEOUT_SECS);
        }
        if self.batch_size <= 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        self
    }
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created, `consume` not called yet
    Idle,
    /// Run loop active
    Running,
    /// Close requested; the loop stops at its next iteration boundary
    Closing,
    /// Run loop finished (or closed before it ever started)
    Closed,
}

/// Everything the run loop owns once it starts.
struct RunParts {
    fetch_backoff: Box<dyn Backoffer>,
    handler_backoff: Box<dyn Backoffer>,
    metrics: Option<ConsumerMetrics>,
}

struct Shared {
    read_group: String,
    driver: Arc<dyn ConsumerDriver>,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    parts: Mutex<Option<RunParts>>,
}

impl Shared {
    fn is_running(&self) -> bool {
        *self.state.borrow() == ConsumerState::Running
    }
}

/// Competing consumer for one read group.
///
/// Cloning is cheap and every clone controls the same run loop, so a handler
/// can capture a clone and call [`Consumer::close`] on it.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Create a consumer with default fetch and handler backoffs.
    pub fn new(
        read_group: impl Into<String>,
        driver: Arc<dyn ConsumerDriver>,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);

        Self {
            shared: Arc::new(Shared {
                read_group: read_group.into(),
                driver,
                config: config.normalized(),
                state,
                parts: Mutex::new(Some(RunParts {
                    fetch_backoff: Box::new(Backoff::default()),
                    handler_backoff: Box::new(Backoff::default()),
                    metrics: None,
                })),
            }),
        }
    }

    /// Use the same backoff configuration for both failure paths (each path
    /// still gets its own instance).
    pub fn with_backoff_config(self, config: BackoffConfig) -> Self {
        self.with_backoffers(Backoff::new(config.clone()), Backoff::new(config))
    }

    /// Replace the fetch-path and handler-path backoffs.
    ///
    /// Has no effect once `consume` has been called.
    pub fn with_backoffers(
        self,
        fetch_backoff: impl Backoffer + 'static,
        handler_backoff: impl Backoffer + 'static,
    ) -> Self {
        if let Some(parts) = self.shared.parts.lock().as_mut() {
            parts.fetch_backoff = Box::new(fetch_backoff);
            parts.handler_backoff = Box::new(handler_backoff);
        }
        self
    }

    pub fn with_metrics(self, metrics: ConsumerMetrics) -> Self {
        if let Some(parts) = self.shared.parts.lock().as_mut() {
            parts.metrics = Some(metrics);
        }
        self
    }

    pub fn read_group(&self) -> &str {
        &self.shared.read_group
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state.borrow()
    }

    /// Start the run loop on a background task and return immediately.
    ///
    /// The handler is called once per delivered event. Returning an error
    /// leaves the cursor where it was, so the event is delivered again after
    /// the handler backoff. Handlers must therefore be idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DbEventError::ConsumerNotIdle`] if the consumer was already
    /// started or closed.
    pub fn consume<F, Fut>(&self, handler: F) -> DbEventResult<()>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut current = ConsumerState::Idle;
        let started = self.shared.state.send_if_modified(|state| {
            current = *state;
            if *state == ConsumerState::Idle {
                *state = ConsumerState::Running;
                true
            } else {
                false
            }
        });

        if !started {
            return Err(DbEventError::ConsumerNotIdle(current));
        }

        let parts = match self.shared.parts.lock().take() {
            Some(parts) => parts,
            None => {
                self.shared.state.send_replace(ConsumerState::Closed);
                return Err(DbEventError::ConsumerNotIdle(ConsumerState::Closed));
            }
        };

        tokio::spawn(run_loop(self.shared.clone(), parts, handler));
        Ok(())
    }

    /// Request the run loop to stop at its next iteration boundary.
    ///
    /// Safe to call any number of times, from anywhere (including from inside
    /// the handler). Closing an idle consumer moves it straight to `Closed`.
    pub fn close(&self) {
        self.shared.state.send_if_modified(|state| match *state {
            ConsumerState::Idle => {
                *state = ConsumerState::Closed;
                true
            }
            ConsumerState::Running => {
                *state = ConsumerState::Closing;
                true
            }
            ConsumerState::Closing | ConsumerState::Closed => false,
        });
    }

    /// Close and wait until the run loop has exited.
    ///
    /// Must not be awaited from inside the handler: the loop cannot finish
    /// while the handler is still waiting on it.
    pub async fn close_and_wait(&self) {
        self.close();
        self.wait().await;
    }

    /// Wait until the run loop has exited, without requesting it to stop.
    ///
    /// Returns once the consumer is `Closed`, for example after the handler
    /// called [`Consumer::close`]. An idle consumer never reaches `Closed` on
    /// its own, so this only returns for it after a `close`.
    pub async fn wait(&self) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, which we hold, so this only returns on Closed.
        let _ = rx.wait_for(|state| *state == ConsumerState::Closed).await;
    }
}

async fn run_loop<F, Fut>(shared: Arc<Shared>, mut parts: RunParts, handler: F)
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let read_group = shared.read_group.as_str();
    let driver = shared.driver.as_ref();

    info!(
        read_group = %read_group,
        batch_size = shared.config.batch_size,
        wait_change_timeout_secs = shared.config.wait_change_timeout.as_secs(),
        "Consumer starting"
    );

    while shared.is_running() {
        let events = match driver.fetch(read_group, shared.config.batch_size).await {
            Ok(events) => {
                parts.fetch_backoff.reset_sleep_backoff();
                events
            }
            Err(e) => {
                error!(
                    read_group = %read_group,
                    transient = e.is_transient(),
                    error = ?e,
                    "Error while fetching events"
                );
                if let Some(metrics) = &parts.metrics {
                    metrics.fetch_failures.inc();
                }
                parts.fetch_backoff.sleep_backoff().await;
                continue;
            }
        };

        if events.is_empty() {
            debug!(read_group = %read_group, "No events, waiting for change");
            driver.wait_change(shared.config.wait_change_timeout).await;
            continue;
        }

        for event in &events {
            let invocation = guarded(handler(event.clone()));

            match driver.commit_in_trans(read_group, event, invocation).await {
                Ok(()) => {
                    debug!(read_group = %read_group, event_id = event.id, "Event committed");
                    parts.handler_backoff.reset_sleep_backoff();
                    if let Some(metrics) = &parts.metrics {
                        metrics.committed.inc();
                        metrics.committed_offset.set(event.id);
                    }
                }
                Err(e) => {
                    error!(
                        read_group = %read_group,
                        event_id = event.id,
                        event_type = %event.event_type,
                        error = ?e,
                        "Cannot commit event"
                    );
                    if let Some(metrics) = &parts.metrics {
                        metrics.handler_failures.inc();
                    }
                    parts.handler_backoff.sleep_backoff().await;
                    // Later events in this batch are refetched from the uncommitted cursor.
                    break;
                }
            }
        }
    }

    shared.state.send_replace(ConsumerState::Closed);
    info!(read_group = %read_group, "Consumer stopped");
}

/// Turn a handler panic into an ordinary handler error so the loop survives it.
fn guarded<'a, Fut>(fut: Fut) -> crate::driver::HandlerFuture<'a>
where
    Fut: Future<Output = anyhow::Result<()>> + Send + 'a,
{
    Box::pin(async move {
        AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("event handler panicked")))
    })
}
