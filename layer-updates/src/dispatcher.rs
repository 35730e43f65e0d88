//! Update queue, handler registry and the worker pool that connects them.
//!
//! The network layer (and gap recovery) push [`RawEnvelope`]s onto one shared
//! FIFO. `N` workers pop from it, parse each envelope once and walk the
//! handler groups in ascending order; within a group handlers run in the
//! order they were added. The first handler that handles the update ends its
//! delivery, across all groups.
//!
//! The registry is owned by a single control task. `add_handler` and
//! `remove_handler` are messages to that task, which applies them one at a
//! time and publishes an immutable snapshot through a `watch` channel.
//! Workers take the current snapshot once per envelope and never lock it, so a
//! registry change can never be observed half-applied by a running delivery.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::errors::DispatchError;
use crate::handler::{DispatchOutcome, Handler, HandlerId, HandlerResult};
use crate::update::{Caches, ParsedUpdate, RawEnvelope, UpdateParser};

// ─── UpdateQueue ─────────────────────────────────────────────────────────────

pub(crate) enum QueueItem {
    Envelope(RawEnvelope),
    /// One worker exits when it pops this.
    Stop,
}

/// Unbounded multi-consumer FIFO of envelopes.
#[derive(Clone)]
pub(crate) struct UpdateQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
}

impl UpdateQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Arc::new(Mutex::new(rx)) }
    }

    pub(crate) fn put_nowait(&self, envelope: RawEnvelope) {
        // The receiver lives as long as `self`, so this cannot fail.
        let _ = self.tx.send(QueueItem::Envelope(envelope));
    }

    fn push_stop(&self) {
        let _ = self.tx.send(QueueItem::Stop);
    }

    /// Wait for the next item; workers take turns holding the receiver.
    async fn pop(&self) -> Option<QueueItem> {
        self.rx.lock().await.recv().await
    }

    fn sender(&self) -> UpdateSender {
        UpdateSender { tx: self.tx.clone() }
    }
}

/// Handle given to whatever produces updates (usually the network layer).
#[derive(Clone, Debug)]
pub struct UpdateSender {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl UpdateSender {
    /// Enqueue an envelope without waiting.
    pub fn put_nowait(&self, envelope: RawEnvelope) -> Result<(), DispatchError> {
        self.tx.send(QueueItem::Envelope(envelope)).map_err(|_| DispatchError::Closed)
    }
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueItem::Envelope(e) => write!(f, "Envelope({})", e.update.name()),
            QueueItem::Stop        => f.write_str("Stop"),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Group number → handlers in registration order. `BTreeMap` keeps the
/// groups sorted, lowest first.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    groups: BTreeMap<i32, Vec<(HandlerId, Handler)>>,
}

impl Registry {
    fn add(&mut self, id: HandlerId, handler: Handler, group: i32) {
        self.groups.entry(group).or_default().push((id, handler));
    }

    fn remove(&mut self, id: HandlerId, group: i32) -> Result<(), DispatchError> {
        let handlers = self.groups.get_mut(&group).ok_or(DispatchError::UnknownGroup(group))?;
        let pos = handlers
            .iter()
            .position(|(h, _)| *h == id)
            .ok_or(DispatchError::UnknownHandler(id))?;
        handlers.remove(pos);
        Ok(())
    }

    fn iter(&self) -> impl Iterator<Item = &(HandlerId, Handler)> {
        self.groups.values().flatten()
    }
}

enum Control {
    Add    { id: HandlerId, handler: Handler, group: i32, done: oneshot::Sender<()> },
    Remove { id: HandlerId, group: i32, done: oneshot::Sender<Result<(), DispatchError>> },
    Clear  { done: oneshot::Sender<()> },
}

async fn control_loop(mut rx: mpsc::UnboundedReceiver<Control>, snapshot: watch::Sender<Arc<Registry>>) {
    let mut registry = Registry::default();
    while let Some(msg) = rx.recv().await {
        match msg {
            Control::Add { id, handler, group, done } => {
                registry.add(id, handler, group);
                snapshot.send_replace(Arc::new(registry.clone()));
                let _ = done.send(());
            }
            Control::Remove { id, group, done } => {
                let result = registry.remove(id, group);
                if result.is_ok() {
                    snapshot.send_replace(Arc::new(registry.clone()));
                }
                let _ = done.send(result);
            }
            Control::Clear { done } => {
                registry.groups.clear();
                snapshot.send_replace(Arc::new(Registry::default()));
                let _ = done.send(());
            }
        }
    }
}

// ─── Delivery ────────────────────────────────────────────────────────────────

/// Run `envelope` through the handler chain. Returns the handler that ended
/// delivery (by handling or aborting), if any.
pub(crate) async fn deliver(
    registry: &Registry,
    envelope: &RawEnvelope,
    parsed:   Option<&ParsedUpdate>,
) -> Option<HandlerId> {
    for (id, handler) in registry.iter() {
        let call = match handler {
            Handler::Update(h) => {
                let Some(parsed) = parsed else { continue };
                match h.check(parsed) {
                    Ok(true)  => h.call(parsed.clone()),
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::error!("[layer] filter of handler {id} failed on {}: {e}", envelope.update.name());
                        continue;
                    }
                }
            }
            Handler::Raw(h) => h.call(envelope.clone()),
        };

        match run_callback(call).await {
            Ok(DispatchOutcome::Handled) => return Some(*id),
            Ok(DispatchOutcome::Abort) => {
                tracing::trace!("[layer] handler {id} stopped propagation");
                return Some(*id);
            }
            Ok(DispatchOutcome::Skip) => continue,
            Err(e) => {
                tracing::error!("[layer] handler {id} failed on {}: {e}", envelope.update.name());
                continue;
            }
        }
    }
    None
}

async fn run_callback(call: BoxFuture<'static, HandlerResult>) -> HandlerResult {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("panicked: {msg}").into())
        }
    }
}

async fn worker(
    index:    usize,
    queue:    UpdateQueue,
    registry: watch::Receiver<Arc<Registry>>,
    parser:   Arc<UpdateParser>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            item = queue.pop() => item,
            _ = shutdown.cancelled() => None,
        };
        let envelope = match item {
            Some(QueueItem::Envelope(envelope)) => envelope,
            Some(QueueItem::Stop) | None        => break,
        };

        let parsed   = parser.parse(&envelope);
        let snapshot = registry.borrow().clone();
        match deliver(&snapshot, &envelope, parsed.as_ref()).await {
            Some(id) => tracing::trace!("[layer] worker {index}: {} ended at handler {id}", envelope.update.name()),
            None     => tracing::trace!("[layer] worker {index}: {} unhandled", envelope.update.name()),
        }
    }
    tracing::debug!("[layer] worker {index} stopped");
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// Owns the update queue, the handler registry and the worker pool.
///
/// Must be created inside a Tokio runtime (it spawns its control task).
pub struct Dispatcher {
    queue:    UpdateQueue,
    control:  mpsc::UnboundedSender<Control>,
    registry: watch::Receiver<Arc<Registry>>,
    parser:   Arc<UpdateParser>,
    workers:  usize,
    tracker:  TaskTracker,
    /// Number of running workers; also serializes `start` / `stop`.
    running:  Mutex<usize>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// A dispatcher with `workers` workers and default-sized caches.
    pub fn new(workers: usize) -> Self {
        Self::with_caches(workers, Arc::new(Caches::new(1000, 1000)))
    }

    pub(crate) fn with_caches(workers: usize, caches: Arc<Caches>) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (snapshot, registry)  = watch::channel(Arc::new(Registry::default()));
        tokio::spawn(control_loop(control_rx, snapshot));

        Self {
            queue:    UpdateQueue::new(),
            control,
            registry,
            parser:   Arc::new(UpdateParser::new(caches)),
            workers:  workers.max(1),
            tracker:  TaskTracker::new(),
            running:  Mutex::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the workers. Does nothing if they are already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if *running > 0 {
            return;
        }
        self.tracker.reopen();
        for index in 0..self.workers {
            self.tracker.spawn(worker(
                index,
                self.queue.clone(),
                self.registry.clone(),
                Arc::clone(&self.parser),
                self.shutdown.child_token(),
            ));
        }
        *running = self.workers;
        tracing::info!("[layer] Dispatcher started ({} workers)", self.workers);
    }

    /// Let every worker finish what is already queued, wait for them to exit,
    /// then drop all handlers.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if *running == 0 {
            return;
        }
        for _ in 0..*running {
            self.queue.push_stop();
        }
        self.tracker.close();
        self.tracker.wait().await;
        *running = 0;

        let (done, wait) = oneshot::channel();
        if self.control.send(Control::Clear { done }).is_ok() {
            let _ = wait.await;
        }
        tracing::info!("[layer] Dispatcher stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await > 0
    }

    /// Register `handler` in `group`. Lower groups run first.
    pub async fn add_handler(&self, handler: impl Into<Handler>, group: i32) -> Result<HandlerId, DispatchError> {
        let id = HandlerId::next();
        let (done, wait) = oneshot::channel();
        self.control
            .send(Control::Add { id, handler: handler.into(), group, done })
            .map_err(|_| DispatchError::Closed)?;
        wait.await.map_err(|_| DispatchError::Closed)?;
        Ok(id)
    }

    /// Remove a handler previously added to `group`.
    pub async fn remove_handler(&self, id: HandlerId, group: i32) -> Result<(), DispatchError> {
        let (done, wait) = oneshot::channel();
        self.control
            .send(Control::Remove { id, group, done })
            .map_err(|_| DispatchError::Closed)?;
        wait.await.map_err(|_| DispatchError::Closed)?
    }

    /// Group numbers currently registered, in delivery order.
    pub fn groups(&self) -> Vec<i32> {
        self.registry.borrow().groups.keys().copied().collect()
    }

    /// A producer handle onto the update queue.
    pub fn sender(&self) -> UpdateSender {
        self.queue.sender()
    }

    pub(crate) fn queue(&self) -> &UpdateQueue {
        &self.queue
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Workers of a dispatcher dropped without `stop` would otherwise wait
        // on the queue forever.
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{RawUpdateHandler, UpdateHandler};
    use crate::raw;

    fn noop() -> Handler {
        RawUpdateHandler::new(|_| async { Ok(DispatchOutcome::Handled) }).into()
    }

    #[tokio::test]
    async fn groups_stay_sorted() {
        let d = Dispatcher::new(1);
        for group in [2, 0, 1] {
            d.add_handler(noop(), group).await.unwrap();
        }
        assert_eq!(d.groups(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn remove_from_missing_group_fails() {
        let d = Dispatcher::new(1);
        let id = d.add_handler(noop(), 0).await.unwrap();
        assert_eq!(d.remove_handler(id, 5).await, Err(DispatchError::UnknownGroup(5)));
        assert_eq!(d.remove_handler(id, 0).await, Ok(()));
        assert_eq!(d.remove_handler(id, 0).await, Err(DispatchError::UnknownHandler(id)));
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let mut registry = Registry::default();
        let bad  = HandlerId::next();
        let good = HandlerId::next();
        registry.add(bad, RawUpdateHandler::new(|_| async { panic!("boom") }).into(), 0);
        registry.add(good, noop(), 0);

        let env = RawEnvelope::bare(raw::Update::Other { name: "updateConfig".into() });
        assert_eq!(deliver(&registry, &env, None).await, Some(good));
    }

    #[tokio::test]
    async fn typed_handlers_ignore_unparsed_updates() {
        let mut registry = Registry::default();
        let typed = HandlerId::next();
        registry.add(typed, UpdateHandler::message(|_| async { Ok(DispatchOutcome::Handled) }).into(), 0);

        let env = RawEnvelope::bare(raw::Update::Other { name: "updateConfig".into() });
        assert_eq!(deliver(&registry, &env, None).await, None);
    }

    #[tokio::test]
    async fn stop_drains_queue_and_clears_handlers() {
        let d = Dispatcher::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.add_handler(
            RawUpdateHandler::new(move |e| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(e.update.name().to_string());
                    Ok(DispatchOutcome::Handled)
                }
            }),
            0,
        ).await.unwrap();

        for i in 0..5 {
            d.sender().put_nowait(RawEnvelope::bare(raw::Update::Other { name: format!("u{i}") })).unwrap();
        }
        d.start().await;
        d.stop().await;

        let mut seen = Vec::new();
        while let Ok(name) = rx.try_recv() {
            seen.push(name);
        }
        seen.sort();
        assert_eq!(seen, vec!["u0", "u1", "u2", "u3", "u4"]);
        assert!(d.groups().is_empty());
        assert!(!d.is_running().await);
    }
}
