//! # layer-updates
//!
//! Update delivery for Telegram clients: everything between "the connection
//! received an `Updates` push" and "your handler ran".
//!
//! ## Features
//! - Handler groups with first-match-wins delivery and explicit
//!   [`DispatchOutcome`] propagation control
//! - Typed handlers with composable [`filters`], plus raw handlers that see
//!   every envelope
//! - A worker pool draining one shared FIFO queue
//! - Per-scope pts persistence through a pluggable [`StateStorage`]
//!   (in-memory, binary file, SQLite)
//! - Gap recovery via `updates.getDifference` / `getChannelDifference`
//! - A watchdog that pokes the server when pushes go quiet
//! - `FLOOD_WAIT` auto-retry with a configurable [`RetryPolicy`]
//!
//! The network layer is supplied through the [`Invoker`] trait.
//!
//! ```rust,no_run
//! # async fn f(invoker: std::sync::Arc<dyn layer_updates::Invoker>) -> Result<(), Box<dyn std::error::Error>> {
//! use layer_updates::{Client, Config, DispatchOutcome, UpdateHandler, filters};
//!
//! let client = Client::new(invoker, Config::default());
//! client.add_handler(
//!     UpdateHandler::message(|msg| async move {
//!         println!("{:?}", msg.text);
//!         Ok(DispatchOutcome::Handled)
//!     }).filter(filters::incoming()),
//!     0,
//! ).await?;
//! client.start().await?;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod cache;
mod dispatcher;
mod errors;
mod invoker;
mod pts;
mod recovery;
mod retry;
mod watchdog;
pub mod filters;
pub mod handler;
pub mod raw;
pub mod storage;
pub mod update;

pub use cache::Cache;
pub use dispatcher::{Dispatcher, UpdateSender};
pub use errors::{DispatchError, InvocationError, RpcError};
pub use filters::Filter;
pub use handler::{DispatchOutcome, Handler, HandlerError, HandlerId, HandlerResult, RawUpdateHandler, UpdateHandler};
pub use invoker::Invoker;
pub use recovery::RecoveryStats;
pub use retry::{AutoSleep, NoRetries, RetryContext, RetryPolicy};
pub use storage::{BinaryFileStorage, InMemoryStorage, StateRecord, StateStorage};
#[cfg(feature = "sqlite-session")]
pub use storage::SqliteStorage;
pub use update::{HandlerKind, ParsedUpdate, RawEnvelope};

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use raw::{PeerId, RemoteCall};
use update::Caches;

// ─── Config ──────────────────────────────────────────────────────────────────

/// Configuration for [`Client::new`].
#[derive(Clone)]
pub struct Config {
    /// Number of dispatch workers (default: `min(32, cpus + 4)`).
    pub workers:      usize,
    /// Neither persist pts nor recover gaps (default: false).
    pub skip_updates: bool,
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Where per-scope pts is kept (default: in memory).
    pub storage:      Arc<dyn StateStorage>,
    pub max_message_cache_size:             usize,
    pub max_business_connection_cache_size: usize,
    /// Idle time after which the watchdog calls `updates.getState`.
    pub watchdog_interval:        Duration,
    /// `limit` of recovery `getChannelDifference` calls.
    pub channel_difference_limit: i32,
    /// Most difference pages fetched for one scope in one recovery run.
    pub max_difference_pages:     usize,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            workers:      (cpus + 4).min(32),
            skip_updates: false,
            retry_policy: Arc::new(AutoSleep::default()),
            storage:      Arc::new(InMemoryStorage::new()),
            max_message_cache_size:             1000,
            max_business_connection_cache_size: 1000,
            watchdog_interval:        Duration::from_secs(15 * 60),
            channel_difference_limit: 10_000,
            max_difference_pages:     1000,
        }
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

pub(crate) struct ClientInner {
    pub(crate) invoker:  Arc<dyn Invoker>,
    pub(crate) storage:  Arc<dyn StateStorage>,
    retry_policy:        Arc<dyn RetryPolicy>,
    dispatcher:          Dispatcher,
    caches:              Arc<Caches>,
    pub(crate) skip_updates:             bool,
    pub(crate) channel_difference_limit: i32,
    pub(crate) max_difference_pages:     usize,
    watchdog_interval:   Duration,
    last_update:         Mutex<Instant>,
    watchdog_stop:       Mutex<Option<CancellationToken>>,
    tasks:               TaskTracker,
}

/// The update pipeline. Cheap to clone: internally Arc-wrapped.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Build a client on top of `invoker`. Must be called inside a Tokio
    /// runtime; nothing is dispatched until [`Client::start`].
    pub fn new(invoker: Arc<dyn Invoker>, config: Config) -> Self {
        let caches = Arc::new(Caches::new(
            config.max_message_cache_size,
            config.max_business_connection_cache_size,
        ));
        let dispatcher = Dispatcher::with_caches(config.workers, Arc::clone(&caches));
        tracing::debug!("[layer] Using {} state storage", config.storage.name());

        Self {
            inner: Arc::new(ClientInner {
                invoker,
                storage:      config.storage,
                retry_policy: config.retry_policy,
                dispatcher,
                caches,
                skip_updates:             config.skip_updates,
                channel_difference_limit: config.channel_difference_limit,
                max_difference_pages:     config.max_difference_pages,
                watchdog_interval:        config.watchdog_interval,
                last_update:   Mutex::new(Instant::now()),
                watchdog_stop: Mutex::new(None),
                tasks:         TaskTracker::new(),
            }),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Start the workers, catch up on missed updates (unless
    /// `skip_updates`) and start the watchdog.
    pub async fn start(&self) -> Result<(), InvocationError> {
        self.inner.dispatcher.start().await;
        self.touch();

        if !self.inner.skip_updates {
            self.recover_gaps().await?;
        }

        let mut slot = lock(&self.inner.watchdog_stop);
        if slot.is_none() {
            let stop = CancellationToken::new();
            self.inner.tasks.reopen();
            self.inner.tasks.spawn(watchdog::run(
                self.clone(),
                self.inner.watchdog_interval,
                stop.clone(),
            ));
            *slot = Some(stop);
        }
        Ok(())
    }

    /// Stop the watchdog, let the workers drain the queue, and drop all
    /// handlers.
    pub async fn stop(&self) {
        let stop = lock(&self.inner.watchdog_stop).take();
        if let Some(stop) = stop {
            stop.cancel();
            self.inner.tasks.close();
            self.inner.tasks.wait().await;
        }
        self.inner.dispatcher.stop().await;
    }

    // ── Handlers ───────────────────────────────────────────────────────────

    pub async fn add_handler(&self, handler: impl Into<Handler>, group: i32) -> Result<HandlerId, DispatchError> {
        self.inner.dispatcher.add_handler(handler, group).await
    }

    pub async fn remove_handler(&self, id: HandlerId, group: i32) -> Result<(), DispatchError> {
        self.inner.dispatcher.remove_handler(id, group).await
    }

    /// Producer handle for envelopes that bypass [`Client::handle_updates`].
    pub fn updates_sender(&self) -> UpdateSender {
        self.inner.dispatcher.sender()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    // ── Caches / state ─────────────────────────────────────────────────────

    /// A message seen in an earlier update, if still cached.
    pub fn cached_message(&self, chat_id: PeerId, message_id: i32) -> Option<update::Message> {
        self.inner.caches.message(chat_id, message_id)
    }

    pub fn business_connection(&self, id: &str) -> Option<update::BusinessConnection> {
        self.inner.caches.business_connection(id)
    }

    /// When the last push was handed to [`Client::handle_updates`].
    pub fn last_update_at(&self) -> Instant {
        *lock(&self.inner.last_update)
    }

    pub fn storage(&self) -> &Arc<dyn StateStorage> {
        &self.inner.storage
    }

    pub(crate) fn touch(&self) {
        *lock(&self.inner.last_update) = Instant::now();
    }

    pub(crate) fn enqueue(&self, envelope: RawEnvelope) {
        self.inner.dispatcher.queue().put_nowait(envelope);
    }

    // ── RPC ────────────────────────────────────────────────────────────────

    /// Call `req`, sleeping on flood waits as the retry policy allows.
    pub async fn invoke<R: RemoteCall>(&self, req: &R) -> Result<R::Return, InvocationError> {
        let mut fail_count   = NonZeroU32::MIN;
        let mut slept_so_far = Duration::default();
        loop {
            match self.inner.invoker.call(req.to_request()).await {
                Ok(response) => return R::from_response(response),
                Err(e) => {
                    let ctx = RetryContext { fail_count, slept_so_far, error: e };
                    match self.inner.retry_policy.should_retry(&ctx) {
                        ControlFlow::Continue(delay) => {
                            sleep(delay).await;
                            slept_so_far += delay;
                            fail_count = fail_count.saturating_add(1);
                        }
                        ControlFlow::Break(()) => return Err(ctx.error),
                    }
                }
            }
        }
    }
}
