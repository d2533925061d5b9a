//! # SAXS instrument communication core
//!
//! Everything the instrument drivers share: connection lifecycle, the inbound
//! collector, the property cache, the wire protocols and the bridge that
//! carries notifications into the consumer's run loop.
//!
//! ## Crate Structure
//!
//! - **`connection`**: [`Connection`] owns one stream transport, its collector
//!   and its property cache. Lifecycle hooks let drivers run identity checks
//!   after connecting and park hardware before disconnecting.
//! - **`collector`** (private): the background reader and the queue that
//!   routes replies to waiting callers.
//! - **`driver`**: the [`Instrument`] surface every driver exposes and the
//!   [`DriverFactory`] that builds one from configuration.
//! - **`property`**: [`PropertyCache`], staleness-bounded reads with health
//!   categories and change notifications.
//! - **`notify`**: [`Event`], the per-instrument [`Notifier`] registry, the
//!   [`Marshaler`] and the single-consumer [`RunLoop`].
//! - **`protocol`**: ASCII reply dispatch, binary frames and the register bus.
//! - **`transport`**: connectors and message framing.
//! - **`retry`**: retry policy applied by device operations.
//! - **`testing`**: mock transport and connector for driver tests.
//!
//! ## Threading
//!
//! Commands run on the calling task, serialized per connection. Notifications
//! are only ever delivered on the task driving the [`RunLoop`].

mod collector;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod notify;
pub mod property;
pub mod protocol;
pub mod retry;
pub mod testing;
pub mod transport;
pub mod value;

pub use config::ConnectionConfig;
pub use connection::{
    Connection, ConnectionStatus, LifecycleHooks, Match, NoHooks, PendingCommand, Session, Ticket,
    WeakConnection,
};
pub use driver::{DriverFactory, DriverRegistry, Instrument, InstrumentContext};
pub use error::{ConnectionError, CoreError, CoreResult, ProtocolError};
pub use notify::{Event, Marshaler, Notifier, RunLoop, SubscriptionId};
pub use property::{PropertyCache, PropertySpec, Reading, Refresh, ValueKind};
pub use retry::{with_retry, RetryPolicy};
pub use transport::{Connector, Framing, TcpConnector};
pub use value::{Category, Fields, Value};
