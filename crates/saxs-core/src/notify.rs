//! Notification fan-out and the single-consumer run loop.
//!
//! Background tasks (collectors, pollers, callers of `execute`) never invoke
//! subscriber callbacks themselves. They post through a [`Marshaler`], and the
//! one [`RunLoop`] owned by the host delivers every notification on its own
//! task, in posting order.
//!
//! Two kinds of work travel through the marshaler:
//!
//! - **Events**: lifecycle and property notifications addressed to a
//!   [`Notifier`]'s subscriber registry.
//! - **Deferred calls**: futures that must not run where they were scheduled,
//!   such as `disconnect(false)` raised while the transport lock is held.
//!
//! # Example
//!
//! ```rust
//! use saxs_core::notify::{Event, Marshaler, Notifier};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (marshaler, mut run_loop) = Marshaler::channel();
//! let notifier = Notifier::new("gauge", marshaler);
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = seen.clone();
//! notifier.subscribe(move |_event: &Event| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//! notifier.emit(Event::Connected { instrument: "gauge".into() });
//! assert_eq!(run_loop.dispatch_pending().await, 1);
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! # }
//! ```

use crate::value::{Category, Value};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Notifications consumed by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Connection reached Idle after a successful post-connect hook.
    Connected {
        /// Instrument name
        instrument: String,
    },
    /// Connection torn down. `clean` is false when a fault forced it.
    Disconnected {
        /// Instrument name
        instrument: String,
        /// True when caller-initiated
        clean: bool,
    },
    /// A cached property changed value or category.
    PropertyChanged {
        /// Instrument name
        instrument: String,
        /// Property name
        name: String,
        /// New value (`None` after a failed refresh)
        value: Option<Value>,
        /// New category
        category: Category,
    },
    /// A property changed into the `Error` category.
    PropertyError {
        /// Instrument name
        instrument: String,
        /// Property name
        name: String,
    },
    /// A property changed into the `Warning` category.
    PropertyWarning {
        /// Instrument name
        instrument: String,
        /// Property name
        name: String,
    },
    /// The controller could not be reached on the register bus.
    ControllerError {
        /// Instrument name
        instrument: String,
        /// Failure description
        reason: String,
    },
}

impl Event {
    /// Instrument that raised the event.
    pub fn instrument(&self) -> &str {
        match self {
            Event::Connected { instrument }
            | Event::Disconnected { instrument, .. }
            | Event::PropertyChanged { instrument, .. }
            | Event::PropertyError { instrument, .. }
            | Event::PropertyWarning { instrument, .. }
            | Event::ControllerError { instrument, .. } => instrument,
        }
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;
type Registry = Arc<RwLock<Vec<(SubscriptionId, Callback)>>>;
type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

enum Envelope {
    Event { registry: Registry, event: Event },
    Call { label: &'static str, job: Job },
}

/// Handle returned by [`Notifier::subscribe`]; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Marshaler
// =============================================================================

/// Posting side of the bridge into the run loop. Safe to clone and use from
/// any task.
#[derive(Clone)]
pub struct Marshaler {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl std::fmt::Debug for Marshaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marshaler")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Marshaler {
    /// Create a marshaler and the run loop that consumes it.
    pub fn channel() -> (Marshaler, RunLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Marshaler { tx }, RunLoop { rx })
    }

    /// Schedule `job` to run on the run loop.
    ///
    /// Returns false when the run loop is gone; the job is dropped.
    pub fn defer<F, Fut>(&self, label: &'static str, job: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::new(move || Box::pin(job()));
        let posted = self.tx.send(Envelope::Call { label, job }).is_ok();
        if !posted {
            tracing::debug!(job = label, "Run loop closed, deferred call dropped");
        }
        posted
    }

    fn post(&self, registry: Registry, event: Event) {
        if self.tx.send(Envelope::Event { registry, event }).is_err() {
            tracing::trace!("Run loop closed, notification dropped");
        }
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Subscriber registry owned by one connection or property cache.
///
/// Cloning shares the registry.
#[derive(Clone)]
pub struct Notifier {
    instrument: Arc<str>,
    registry: Registry,
    marshaler: Marshaler,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("instrument", &self.instrument)
            .field("subscribers", &self.registry.read().len())
            .finish()
    }
}

impl Notifier {
    /// Create an empty registry for `instrument`.
    pub fn new(instrument: impl Into<String>, marshaler: Marshaler) -> Self {
        Self {
            instrument: Arc::from(instrument.into()),
            registry: Arc::new(RwLock::new(Vec::new())),
            marshaler,
        }
    }

    /// Instrument name carried by this notifier.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Marshaler this notifier posts through.
    pub fn marshaler(&self) -> &Marshaler {
        &self.marshaler
    }

    /// Register a callback. It runs on the run loop, never on the emitter.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.registry.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write();
        let before = registry.len();
        registry.retain(|(sid, _)| *sid != id);
        registry.len() != before
    }

    /// Post `event` to the run loop.
    pub fn emit(&self, event: Event) {
        self.marshaler.post(self.registry.clone(), event);
    }
}

// =============================================================================
// RunLoop
// =============================================================================

/// Single consumer of marshaled work.
pub struct RunLoop {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl RunLoop {
    /// Process work until every [`Marshaler`] has been dropped.
    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            Self::handle(envelope).await;
        }
        tracing::debug!("Run loop finished");
    }

    /// Process everything queued right now and return how many items ran.
    ///
    /// Deferred calls may post further work; that work is picked up in the
    /// same pass.
    pub async fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            Self::handle(envelope).await;
            handled += 1;
        }
        handled
    }

    /// Wait for the next item and process it. Returns false once all
    /// marshalers are gone.
    pub async fn dispatch_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(envelope) => {
                Self::handle(envelope).await;
                true
            }
            None => false,
        }
    }

    async fn handle(envelope: Envelope) {
        match envelope {
            Envelope::Event { registry, event } => {
                // Snapshot so callbacks may (un)subscribe without deadlocking.
                let subscribers: Vec<Callback> =
                    registry.read().iter().map(|(_, cb)| cb.clone()).collect();
                for callback in subscribers {
                    callback(&event);
                }
            }
            Envelope::Call { label, job } => {
                tracing::trace!(job = label, "Running deferred call");
                job().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collect(notifier: &Notifier) -> (SubscriptionId, Arc<parking_lot::Mutex<Vec<Event>>>) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = notifier.subscribe(move |e| sink.lock().push(e.clone()));
        (id, seen)
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (marshaler, mut run_loop) = Marshaler::channel();
        let notifier = Notifier::new("detector", marshaler);
        let (_, seen) = collect(&notifier);

        notifier.emit(Event::Connected {
            instrument: "detector".into(),
        });
        notifier.emit(Event::Disconnected {
            instrument: "detector".into(),
            clean: true,
        });
        assert!(seen.lock().is_empty(), "delivery must wait for the run loop");

        assert_eq!(run_loop.dispatch_pending().await, 2);
        let seen = seen.lock();
        assert!(matches!(seen[0], Event::Connected { .. }));
        assert!(matches!(seen[1], Event::Disconnected { clean: true, .. }));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (marshaler, mut run_loop) = Marshaler::channel();
        let notifier = Notifier::new("gauge", marshaler);
        let (id, seen) = collect(&notifier);

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.emit(Event::Connected {
            instrument: "gauge".into(),
        });
        run_loop.dispatch_pending().await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_call_runs_on_loop() {
        let (marshaler, run_loop) = Marshaler::channel();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        assert!(marshaler.defer("bump", move || async move {
            flag.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        drop(marshaler);
        run_loop.run().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_loop_drops_work() {
        let (marshaler, run_loop) = Marshaler::channel();
        drop(run_loop);
        assert!(!marshaler.defer("noop", || async {}));
    }
}
