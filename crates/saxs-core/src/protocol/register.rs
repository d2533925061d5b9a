//! Register/coil bus client (Modbus TCP).
//!
//! Unlike the stream connections, the bus is strictly request/response: every
//! transaction runs to completion under the bus lock and no inbound
//! collector is started. The lifecycle (hooks, status, property cache,
//! notifications) mirrors [`Connection`](crate::connection::Connection).
//!
//! On a transport failure the caller receives
//! [`CoreError::CommunicationBroken`], a `ControllerError` notification is
//! posted, and `disconnect(false)` is scheduled on the run loop.

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionStatus, LifecycleHooks, NoHooks};
use crate::error::{ConnectionError, CoreError, CoreResult, ProtocolError};
use crate::notify::{Event, Marshaler, Notifier};
use crate::property::PropertyCache;
use crate::transport::Connector;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_modbus::client::{tcp, Client, Context, Reader, Writer};
use tokio_modbus::Slave;

// =============================================================================
// Addressing
// =============================================================================

/// Register table a [`RegisterAddress`] points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// Single-bit read/write coil.
    Coil,
    /// 16-bit read-only input register.
    InputRegister,
}

/// A run of `count` entries starting at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterAddress {
    /// Table.
    pub kind: RegisterKind,
    /// First entry.
    pub index: u16,
    /// Number of entries.
    pub count: u16,
}

impl RegisterAddress {
    /// One coil.
    pub const fn coil(index: u16) -> Self {
        Self::coils(index, 1)
    }

    /// A run of coils.
    pub const fn coils(index: u16, count: u16) -> Self {
        Self {
            kind: RegisterKind::Coil,
            index,
            count,
        }
    }

    /// One input register.
    pub const fn input_register(index: u16) -> Self {
        Self {
            kind: RegisterKind::InputRegister,
            index,
            count: 1,
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = match self.kind {
            RegisterKind::Coil => "coil",
            RegisterKind::InputRegister => "input register",
        };
        if self.count == 1 {
            write!(f, "{table} {}", self.index)
        } else {
            write!(f, "{table}s {}..{}", self.index, self.index as u32 + self.count as u32)
        }
    }
}

/// Pair each bit with its name, in order. Names without a bit read as false;
/// surplus bits are ignored.
pub fn decode_flags<'a>(bits: &[bool], names: &[&'a str]) -> Vec<(&'a str, bool)> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, bits.get(i).copied().unwrap_or(false)))
        .collect()
}

// =============================================================================
// Bus client
// =============================================================================

enum Transaction {
    ReadInputRegisters(u16, u16),
    ReadCoils(u16, u16),
    WriteCoil(u16, bool),
}

enum Outcome {
    Words(Vec<u16>),
    Bits(Vec<bool>),
    Written,
}

struct BusInner {
    name: String,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    hooks: RwLock<Arc<dyn LifecycleHooks<RegisterBus>>>,
    notifier: Notifier,
    cache: PropertyCache,
    status: RwLock<ConnectionStatus>,
    context: tokio::sync::Mutex<Option<Context>>,
    poller: Mutex<Option<(Arc<AtomicBool>, JoinHandle<()>)>>,
    lifecycle: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

/// Handle to one register-bus controller. Cloning shares the connection.
#[derive(Clone)]
pub struct RegisterBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for RegisterBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterBus")
            .field("name", &self.inner.name)
            .field("address", &self.inner.config.address)
            .field("unit_id", &self.inner.config.unit_id)
            .field("status", &*self.inner.status.read())
            .finish()
    }
}

impl RegisterBus {
    /// Create a disconnected bus client.
    pub fn new(
        name: impl Into<String>,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        marshaler: Marshaler,
    ) -> Self {
        let name = name.into();
        let notifier = Notifier::new(name.clone(), marshaler);
        let cache = PropertyCache::new(notifier.clone());
        Self {
            inner: Arc::new(BusInner {
                name,
                config,
                connector,
                hooks: RwLock::new(Arc::new(NoHooks)),
                notifier,
                cache,
                status: RwLock::new(ConnectionStatus::Disconnected),
                context: tokio::sync::Mutex::new(None),
                poller: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Install device hooks.
    pub fn set_hooks(&self, hooks: Arc<dyn LifecycleHooks<RegisterBus>>) {
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

    /// Property cache owned by this controller.
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

    /// Whether the bus is open.
    pub fn is_connected(&self) -> bool {
        *self.inner.status.read() != ConnectionStatus::Disconnected
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.inner.status.write() = status;
    }

    fn open_error(&self, reason: String) -> CoreError {
        ConnectionError::Open {
            instrument: self.inner.name.clone(),
            address: self.inner.config.address.clone(),
            reason,
        }
        .into()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the bus and run the post-connect hook.
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
        tracing::info!(unit_id = config.unit_id, "Connecting");
        let stream = self
            .inner
            .connector
            .open(&config.address, config.connect_timeout)
            .await
            .map_err(|e| self.open_error(e.to_string()))?;
        let ctx = tcp::attach_slave(stream, Slave(config.unit_id));
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = self.inner.context.lock().await;
            *slot = Some(ctx);
            self.set_status(ConnectionStatus::Busy);
        }

        let hooks = self.inner.hooks.read().clone();
        if let Err(e) = hooks.post_connect(self).await {
            tracing::warn!(error = %e, "Post-connect hook failed, tearing down");
            self.teardown().await;
            return Err(self.open_error(e.to_string()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let poller = self.inner.cache.spawn_poller(stop.clone(), config.poller_tick);
        *self.inner.poller.lock() = Some((stop, poller));
        self.set_status(ConnectionStatus::Idle);
        tracing::info!("Connected");
        self.inner.notifier.emit(Event::Connected {
            instrument: self.inner.name.clone(),
        });
        Ok(())
    }

    /// Run the pre-disconnect hook and close the bus.
    #[tracing::instrument(skip(self), fields(instrument = %self.inner.name))]
    pub async fn disconnect(&self, clean: bool) -> CoreResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.status() == ConnectionStatus::Disconnected {
            return Err(ConnectionError::NotConnected {
                instrument: self.inner.name.clone(),
            }
            .into());
        }

        let hooks = self.inner.hooks.read().clone();
        if let Err(e) = hooks.pre_disconnect(self).await {
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
        let poller = self.inner.poller.lock().take();
        if let Some((stop, poller)) = poller {
            stop.store(true, Ordering::SeqCst);
            poller.abort();
            let _ = poller.await;
        }

        let ctx = {
            let mut slot = self.inner.context.lock().await;
            let ctx = slot.take();
            self.set_status(ConnectionStatus::Disconnected);
            ctx
        };
        if let Some(mut ctx) = ctx {
            if let Err(e) = ctx.disconnect().await {
                tracing::debug!(instrument = %self.inner.name, error = %e, "Bus shutdown failed");
            }
        }
    }

    fn schedule_disconnect(&self, reason: &str) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let posted = self
            .inner
            .notifier
            .marshaler()
            .defer("disconnect", move || async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let bus = RegisterBus { inner };
                if bus.inner.generation.load(Ordering::SeqCst) != generation || !bus.is_connected()
                {
                    return;
                }
                if let Err(e) = bus.disconnect(false).await {
                    tracing::debug!(instrument = %bus.inner.name, error = %e, "Deferred disconnect skipped");
                }
            });
        if posted {
            tracing::debug!(instrument = %self.inner.name, reason, "Disconnect scheduled");
        }
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Read one input register.
    pub async fn read_input_register(&self, index: u16) -> CoreResult<u16> {
        let words = self.read_registers(RegisterAddress::input_register(index)).await?;
        words.first().copied().ok_or_else(|| {
            CoreError::protocol(
                &self.inner.name,
                ProtocolError::Malformed(format!("empty reply reading input register {index}")),
            )
        })
    }

    /// Read a run of input registers.
    pub async fn read_registers(&self, address: RegisterAddress) -> CoreResult<Vec<u16>> {
        if address.kind != RegisterKind::InputRegister {
            return Err(CoreError::InvalidArgument(format!("{address} is not an input register")));
        }
        match self
            .transact(Transaction::ReadInputRegisters(address.index, address.count))
            .await?
        {
            Outcome::Words(words) => Ok(words),
            _ => Err(self.unexpected(&address)),
        }
    }

    /// Read `count` coils starting at `start`.
    pub async fn read_coils(&self, start: u16, count: u16) -> CoreResult<Vec<bool>> {
        match self.transact(Transaction::ReadCoils(start, count)).await? {
            Outcome::Bits(bits) => Ok(bits),
            _ => Err(self.unexpected(&RegisterAddress::coils(start, count))),
        }
    }

    /// Set or clear one coil.
    pub async fn write_coil(&self, index: u16, value: bool) -> CoreResult<()> {
        match self.transact(Transaction::WriteCoil(index, value)).await? {
            Outcome::Written => Ok(()),
            _ => Err(self.unexpected(&RegisterAddress::coil(index))),
        }
    }

    fn unexpected(&self, address: &RegisterAddress) -> CoreError {
        CoreError::protocol(
            &self.inner.name,
            ProtocolError::Malformed(format!("unexpected reply shape for {address}")),
        )
    }

    async fn transact(&self, transaction: Transaction) -> CoreResult<Outcome> {
        let name = &self.inner.name;
        let mut slot = self.inner.context.lock().await;
        let ctx = slot.as_mut().ok_or_else(|| ConnectionError::NotConnected {
            instrument: name.clone(),
        })?;
        let marked_busy = {
            let mut status = self.inner.status.write();
            if *status == ConnectionStatus::Idle {
                *status = ConnectionStatus::Busy;
                true
            } else {
                false
            }
        };

        let timeout = self.inner.config.read_timeout;
        let (label, outcome) = match transaction {
            Transaction::ReadInputRegisters(start, count) => (
                "read_input_registers",
                tokio::time::timeout(timeout, ctx.read_input_registers(start, count))
                    .await
                    .map(|r| r.map(|r| r.map(Outcome::Words))),
            ),
            Transaction::ReadCoils(start, count) => (
                "read_coils",
                tokio::time::timeout(timeout, ctx.read_coils(start, count))
                    .await
                    .map(|r| r.map(|r| r.map(Outcome::Bits))),
            ),
            Transaction::WriteCoil(index, value) => (
                "write_single_coil",
                tokio::time::timeout(timeout, ctx.write_single_coil(index, value))
                    .await
                    .map(|r| r.map(|r| r.map(|()| Outcome::Written))),
            ),
        };
        drop(slot);

        if marked_busy {
            let mut status = self.inner.status.write();
            if *status == ConnectionStatus::Busy {
                *status = ConnectionStatus::Idle;
            }
        }

        match outcome {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(code))) => {
                tracing::warn!(instrument = %name, operation = label, ?code, "Bus exception");
                Err(CoreError::rejected(name, format!("{label}: exception {code:?}")))
            }
            Ok(Err(tokio_modbus::Error::Transport(e))) => {
                tracing::error!(instrument = %name, operation = label, error = %e, "Bus transport failed");
                self.inner.notifier.emit(Event::ControllerError {
                    instrument: name.clone(),
                    reason: e.to_string(),
                });
                self.schedule_disconnect(&e.to_string());
                Err(CoreError::broken(name, e))
            }
            Ok(Err(e)) => Err(CoreError::protocol(
                name,
                ProtocolError::Malformed(format!("{label}: {e}")),
            )),
            Err(_) => Err(CoreError::timeout(name, label, timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_modbus, MockConnector, ModbusImage};
    use std::time::Duration;

    fn bus() -> (RegisterBus, Arc<MockConnector>, crate::notify::RunLoop) {
        let (marshaler, run_loop) = Marshaler::channel();
        let connector = Arc::new(MockConnector::new());
        let mut config = ConnectionConfig::new("genix:502");
        config.read_timeout = Duration::from_millis(200);
        let bus = RegisterBus::new("genix", config, connector.clone(), marshaler);
        (bus, connector, run_loop)
    }

    #[test]
    fn test_decode_flags_pairs_in_order() {
        let flags = decode_flags(&[true, false, true], &["shutter_open", "interlock", "xrays_on"]);
        assert_eq!(
            flags,
            vec![("shutter_open", true), ("interlock", false), ("xrays_on", true)]
        );
        // Short bit vector reads as false
        assert_eq!(decode_flags(&[], &["fault"]), vec![("fault", false)]);
    }

    #[test]
    fn test_address_display() {
        assert_eq!(RegisterAddress::coil(250).to_string(), "coil 250");
        assert_eq!(RegisterAddress::coils(210, 16).to_string(), "coils 210..226");
    }

    #[tokio::test]
    async fn test_register_and_coil_transactions() {
        let (bus, connector, _run_loop) = bus();
        let image = Arc::new(Mutex::new(ModbusImage {
            input_registers: vec![0, 500, 600],
            coils: vec![false; 16],
        }));
        serve_modbus(connector.add_device(), image.clone());

        bus.connect().await.unwrap();
        assert_eq!(bus.read_input_register(1).await.unwrap(), 500);

        bus.write_coil(3, true).await.unwrap();
        assert!(image.lock().coils[3]);
        let bits = bus.read_coils(0, 5).await.unwrap();
        assert_eq!(bits, vec![false, false, false, true, false]);
        assert_eq!(bus.status(), ConnectionStatus::Idle);
        bus.disconnect(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_exception_is_device_rejected() {
        let (bus, connector, _run_loop) = bus();
        let image = ModbusImage {
            input_registers: vec![0],
            coils: vec![false; 2],
        };
        serve_modbus(connector.add_device(), Arc::new(Mutex::new(image)));
        bus.connect().await.unwrap();
        let err = bus.read_input_register(9).await.unwrap_err();
        assert!(matches!(err, CoreError::DeviceRejected { .. }));
        assert!(!err.is_retryable());
        assert!(bus.is_connected());
    }

    #[tokio::test]
    async fn test_wrong_table_is_invalid_argument() {
        let (bus, _connector, _run_loop) = bus();
        let err = bus.read_registers(RegisterAddress::coil(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_reports_and_disconnects() {
        let (bus, connector, mut run_loop) = bus();
        let device = connector.add_device();
        bus.connect().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.notifier().subscribe(move |e| sink.lock().push(e.clone()));

        device.break_link();
        let err = bus.read_coils(0, 8).await.unwrap_err();
        assert!(err.breaks_link());

        run_loop.dispatch_pending().await;
        assert_eq!(bus.status(), ConnectionStatus::Disconnected);
        let events = seen.lock().clone();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ControllerError { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Disconnected { clean: false, .. })));
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (bus, _connector, _run_loop) = bus();
        let err = bus.write_coil(0, true).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Connection(ConnectionError::NotConnected { .. })
        ));
        assert!(bus.disconnect(true).await.is_err());
    }
}
