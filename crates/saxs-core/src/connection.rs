//! Connection lifecycle and command execution for stream-based instruments.
//!
//! A [`Connection`] owns one transport, one inbound collector and one
//! [`PropertyCache`]. Its lifecycle:
//!
//! ```text
//! Disconnected ──connect()──► Busy (post-connect hook) ──ok──► Idle ⇄ Busy/Device(..)
//!      ▲                              │ hook or open fails              │
//!      └──────────────────────────────┴────────── disconnect(clean) ◄───┘
//! ```
//!
//! # Locking
//!
//! The write half of the transport sits behind a single async mutex per
//! connection. A [`Session`] holds it; `execute` holds it from the write until
//! the reply has been matched, and composite exchanges (set-then-confirm) run
//! inside one session. Nothing is posted to the run loop while a registry or
//! cache lock is held.
//!
//! # Faults
//!
//! A transport error seen while writing, or by the collector while reading,
//! never disconnects in place. A `disconnect(false)` job is posted through the
//! [`Marshaler`](crate::notify::Marshaler) instead, and the caller receives
//! [`CoreError::CommunicationBroken`]. The job only acts on the connection
//! generation that failed, so a fast reconnect is never torn down by a stale
//! fault.

use crate::collector::{self, CollectorContext, Inbox};
use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, CoreError, CoreResult, ProtocolError};
use crate::notify::{Event, Marshaler, Notifier};
use crate::property::PropertyCache;
use crate::transport::{Connector, DynTransport, Framing};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;

pub use crate::collector::{PendingCommand, Ticket};

// =============================================================================
// Status, matching and hooks
// =============================================================================

/// Lifecycle status of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No transport.
    #[default]
    Disconnected,
    /// Connected, nothing in flight.
    Idle,
    /// Connected, a session holds the transport (or the post-connect hook runs).
    Busy,
    /// Connected, in a device-specific busy state (e.g. exposing, moving).
    Device(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("Disconnected"),
            ConnectionStatus::Idle => f.write_str("Idle"),
            ConnectionStatus::Busy => f.write_str("Busy"),
            ConnectionStatus::Device(state) => f.write_str(state),
        }
    }
}

/// Verdict of a matcher on one inbound message.
#[derive(Debug)]
pub enum Match<R> {
    /// This is the reply; stop waiting.
    Accept(R),
    /// Not for this waiter; leave it for others.
    Reject,
    /// This is the reply but it cannot be interpreted.
    Fail(ProtocolError),
}

/// Device-specific behaviour plugged into a connection's lifecycle.
///
/// `C` is the connection type the hooks run against ([`Connection`] or
/// [`RegisterBus`](crate::protocol::register::RegisterBus)).
#[async_trait]
pub trait LifecycleHooks<C: Sync>: Send + Sync {
    /// Runs after the transport opened, before the connection is announced.
    /// An error tears the connection down again.
    async fn post_connect(&self, _conn: &C) -> CoreResult<()> {
        Ok(())
    }

    /// Runs before every disconnect. Errors are logged and ignored.
    async fn pre_disconnect(&self, _conn: &C) -> CoreResult<()> {
        Ok(())
    }

    /// A message that no pending command claimed. Runs on the collector task.
    fn unsolicited(&self, message: &[u8]) {
        tracing::debug!(
            message = %String::from_utf8_lossy(message),
            "Dropping unsolicited message"
        );
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<C: Sync> LifecycleHooks<C> for NoHooks {}

// =============================================================================
// Connection
// =============================================================================

struct Link {
    stop: Arc<AtomicBool>,
    collector: JoinHandle<()>,
    poller: Option<JoinHandle<()>>,
}

struct Inner {
    name: String,
    config: ConnectionConfig,
    framing: Framing,
    connector: Arc<dyn Connector>,
    hooks: RwLock<Arc<dyn LifecycleHooks<Connection>>>,
    notifier: Notifier,
    cache: PropertyCache,
    status: RwLock<ConnectionStatus>,
    writer: tokio::sync::Mutex<Option<WriteHalf<DynTransport>>>,
    inbox: Arc<Inbox>,
    link: Mutex<Option<Link>>,
    lifecycle: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

/// Handle to one instrument connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("address", &self.inner.config.address)
            .field("status", &*self.inner.status.read())
            .finish()
    }
}

impl Connection {
    /// Create a disconnected connection.
    pub fn new(
        name: impl Into<String>,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        framing: Framing,
        marshaler: Marshaler,
    ) -> Self {
        let name = name.into();
        let notifier = Notifier::new(name.clone(), marshaler);
        let cache = PropertyCache::new(notifier.clone());
        Self {
            inner: Arc::new(Inner {
                name,
                config,
                framing,
                connector,
                hooks: RwLock::new(Arc::new(NoHooks)),
                notifier,
                cache,
                status: RwLock::new(ConnectionStatus::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                inbox: Arc::new(Inbox::new()),
                link: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Non-owning handle, for hooks and tasks that must not keep the
    /// connection alive.
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Install device hooks. Takes effect on the next lifecycle transition.
    pub fn set_hooks(&self, hooks: Arc<dyn LifecycleHooks<Connection>>) {
        *self.inner.hooks.write() = hooks;
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Connection settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Property cache owned by this connection.
    pub fn cache(&self) -> &PropertyCache {
        &self.inner.cache
    }

    /// Subscriber registry for lifecycle and property events.
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.read().clone()
    }

    /// Whether a transport is open.
    pub fn is_connected(&self) -> bool {
        *self.inner.status.read() != ConnectionStatus::Disconnected
    }

    /// Enter a device-specific busy state. Ignored while disconnected.
    pub fn set_device_state(&self, state: impl Into<String>) {
        let mut status = self.inner.status.write();
        if *status != ConnectionStatus::Disconnected {
            *status = ConnectionStatus::Device(state.into());
        }
    }

    /// Leave a device-specific busy state.
    pub fn clear_device_state(&self) {
        let mut status = self.inner.status.write();
        if matches!(*status, ConnectionStatus::Device(_)) {
            *status = ConnectionStatus::Idle;
        }
    }

    /// Messages queued for waiters.
    pub fn queued(&self) -> usize {
        self.inner.inbox.queued()
    }

    /// Exchanges awaiting replies.
    pub fn pending(&self) -> Vec<PendingCommand> {
        self.inner.inbox.pending()
    }

    fn hooks(&self) -> Arc<dyn LifecycleHooks<Connection>> {
        self.inner.hooks.read().clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.inner.status.write() = status;
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the transport, start the collector, run the post-connect hook.
    ///
    /// On any failure the transport is torn down again and no `Connected`
    /// event fires.
    #[tracing::instrument(skip(self), fields(instrument = %self.inner.name, address = %self.inner.config.address))]
    pub async fn connect(&self) -> CoreResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.status() != ConnectionStatus::Disconnected {
            return Err(ConnectionError::AlreadyConnected {
                instrument: self.inner.name.clone(),
            }
            .into());
        }

        let config = &self.inner.config;
        tracing::info!("Connecting");
        let stream = self
            .inner
            .connector
            .open(&config.address, config.connect_timeout)
            .await
            .map_err(|e| self.open_error(e.to_string()))?;
        let (reader, writer) = tokio::io::split(stream);

        self.inner.inbox.reset();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = Arc::new(AtomicBool::new(false));
        let hooks = self.hooks();

        let unsolicited_hooks = hooks.clone();
        let collector = collector::spawn(
            reader,
            CollectorContext {
                instrument: self.inner.name.clone(),
                framing: self.inner.framing.clone(),
                inbox: self.inner.inbox.clone(),
                stop: stop.clone(),
                poll_interval: config.poll_interval,
                expiry: config.read_timeout,
                unsolicited: Arc::new(move |m: &[u8]| unsolicited_hooks.unsolicited(m)),
                on_fault: Self::fault_reporter(Arc::downgrade(&self.inner), generation),
            },
        );
        {
            let mut slot = self.inner.writer.lock().await;
            *slot = Some(writer);
            self.set_status(ConnectionStatus::Busy);
        }
        *self.inner.link.lock() = Some(Link {
            stop: stop.clone(),
            collector,
            poller: None,
        });

        if let Err(e) = hooks.post_connect(self).await {
            tracing::warn!(error = %e, "Post-connect hook failed, tearing down");
            self.teardown().await;
            return Err(self.open_error(e.to_string()));
        }

        let poller = self.inner.cache.spawn_poller(stop, config.poller_tick);
        if let Some(link) = self.inner.link.lock().as_mut() {
            link.poller = Some(poller);
        }
        self.set_status(ConnectionStatus::Idle);
        tracing::info!("Connected");
        self.inner.notifier.emit(Event::Connected {
            instrument: self.inner.name.clone(),
        });
        Ok(())
    }

    /// Run the pre-disconnect hook, stop and join the collector, close the
    /// transport.
    ///
    /// `clean` is false when a detected fault forced the disconnect.
    #[tracing::instrument(skip(self), fields(instrument = %self.inner.name))]
    pub async fn disconnect(&self, clean: bool) -> CoreResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.status() == ConnectionStatus::Disconnected {
            return Err(ConnectionError::NotConnected {
                instrument: self.inner.name.clone(),
            }
            .into());
        }

        if let Err(e) = self.hooks().pre_disconnect(self).await {
            tracing::debug!(error = %e, "Pre-disconnect hook failed (ignored)");
        }
        self.teardown().await;

        if clean {
            tracing::info!("Disconnected");
        } else {
            tracing::warn!("Disconnected after communication failure");
        }
        self.inner.notifier.emit(Event::Disconnected {
            instrument: self.inner.name.clone(),
            clean,
        });
        Ok(())
    }

    async fn teardown(&self) {
        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            link.stop.store(true, Ordering::SeqCst);
            if let Some(poller) = link.poller {
                poller.abort();
                let _ = poller.await;
            }
            self.inner.inbox.close("connection closed");
            if let Err(e) = link.collector.await {
                if e.is_panic() {
                    tracing::error!(instrument = %self.inner.name, "Collector task panicked");
                }
            }
        }
        self.inner.inbox.close("connection closed");

        let writer = {
            let mut slot = self.inner.writer.lock().await;
            let writer = slot.take();
            self.set_status(ConnectionStatus::Disconnected);
            writer
        };
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(instrument = %self.inner.name, error = %e, "Transport shutdown failed");
            }
        }
    }

    fn open_error(&self, reason: String) -> CoreError {
        ConnectionError::Open {
            instrument: self.inner.name.clone(),
            address: self.inner.config.address.clone(),
            reason,
        }
        .into()
    }

    fn fault_reporter(inner: Weak<Inner>, generation: u64) -> collector::FaultReporter {
        Box::new(move |reason: String| {
            if let Some(inner) = inner.upgrade() {
                Connection { inner }.schedule_disconnect(generation, &reason);
            }
        })
    }

    /// Post `disconnect(false)` for `generation` to the run loop.
    fn schedule_disconnect(&self, generation: u64, reason: &str) {
        let weak = Arc::downgrade(&self.inner);
        let posted = self
            .inner
            .notifier
            .marshaler()
            .defer("disconnect", move || async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let conn = Connection { inner };
                if conn.inner.generation.load(Ordering::SeqCst) != generation
                    || !conn.is_connected()
                {
                    return;
                }
                if let Err(e) = conn.disconnect(false).await {
                    tracing::debug!(instrument = %conn.inner.name, error = %e, "Deferred disconnect skipped");
                }
            });
        if posted {
            tracing::debug!(instrument = %self.inner.name, reason, "Disconnect scheduled");
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Take the transport lock for a (possibly composite) exchange.
    pub async fn session(&self) -> CoreResult<Session<'_>> {
        let writer = self.inner.writer.lock().await;
        if writer.is_none() {
            return Err(ConnectionError::NotConnected {
                instrument: self.inner.name.clone(),
            }
            .into());
        }
        let marked_busy = {
            let mut status = self.inner.status.write();
            if *status == ConnectionStatus::Idle {
                *status = ConnectionStatus::Busy;
                true
            } else {
                false
            }
        };
        Ok(Session {
            conn: self,
            writer,
            marked_busy,
        })
    }

    /// Write `command` and wait for the message `matcher` accepts, holding
    /// the transport lock throughout.
    pub async fn execute<R, M>(&self, command: &[u8], label: &str, matcher: M) -> CoreResult<R>
    where
        M: FnMut(&[u8]) -> Match<R> + Send,
        R: Send,
    {
        let mut session = self.session().await?;
        session.execute(command, label, matcher).await
    }

    /// Write `command` without waiting for a reply. The returned ticket can
    /// be passed to [`Connection::wait`] within the read timeout.
    pub async fn send(&self, command: &[u8], label: &str) -> CoreResult<Ticket> {
        let mut session = self.session().await?;
        session.send(command, label).await
    }

    /// Wait for the reply to an earlier `send`. Does not take the transport
    /// lock.
    pub async fn wait<R, M>(&self, ticket: &Ticket, matcher: M) -> CoreResult<R>
    where
        M: FnMut(&[u8]) -> Match<R> + Send,
        R: Send,
    {
        self.inner
            .inbox
            .wait(
                ticket,
                matcher,
                self.inner.config.read_timeout,
                self.inner.config.put_back,
                &self.inner.name,
            )
            .await
    }

    fn report_broken(&self, error: &std::io::Error) -> CoreError {
        tracing::error!(instrument = %self.inner.name, %error, "Write failed");
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.schedule_disconnect(generation, &error.to_string());
        CoreError::broken(&self.inner.name, error)
    }
}

/// Non-owning [`Connection`] handle.
#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    /// The connection, if it still exists.
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

// =============================================================================
// Session
// =============================================================================

/// Exclusive use of a connection's transport.
pub struct Session<'a> {
    conn: &'a Connection,
    writer: tokio::sync::MutexGuard<'a, Option<WriteHalf<DynTransport>>>,
    marked_busy: bool,
}

impl Session<'_> {
    /// Write `command` and register it as pending.
    pub async fn send(&mut self, command: &[u8], label: &str) -> CoreResult<Ticket> {
        let conn = self.conn;
        let writer = self.writer.as_mut().ok_or_else(|| ConnectionError::NotConnected {
            instrument: conn.inner.name.clone(),
        })?;
        let ticket = conn.inner.inbox.register(label);
        tracing::trace!(
            instrument = %conn.inner.name,
            command = label,
            bytes = command.len(),
            "Sending"
        );

        let write = async {
            writer.write_all(command).await?;
            writer.flush().await
        };
        let write_timeout = conn.inner.config.write_timeout;
        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => Ok(ticket),
            Ok(Err(e)) => {
                conn.inner.inbox.cancel(&ticket);
                Err(conn.report_broken(&e))
            }
            Err(_) => {
                conn.inner.inbox.cancel(&ticket);
                Err(CoreError::timeout(&conn.inner.name, label, write_timeout))
            }
        }
    }

    /// Wait for the reply to a ticket issued in this or an earlier session.
    pub async fn wait<R, M>(&mut self, ticket: &Ticket, matcher: M) -> CoreResult<R>
    where
        M: FnMut(&[u8]) -> Match<R> + Send,
        R: Send,
    {
        self.conn.wait(ticket, matcher).await
    }

    /// Send and wait, keeping the lock.
    pub async fn execute<R, M>(&mut self, command: &[u8], label: &str, matcher: M) -> CoreResult<R>
    where
        M: FnMut(&[u8]) -> Match<R> + Send,
        R: Send,
    {
        let ticket = self.send(command, label).await?;
        self.wait(&ticket, matcher).await
    }

    /// Connection this session belongs to.
    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.marked_busy {
            let mut status = self.conn.inner.status.write();
            if *status == ConnectionStatus::Busy {
                *status = ConnectionStatus::Idle;
            }
        }
    }
}
