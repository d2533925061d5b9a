//! Instrument surface and driver factories.
//!
//! The consumer talks to every instrument through [`Instrument`]:
//! connect/disconnect, property reads and writes, and the notifier it
//! subscribes to. Drivers are built from configuration by a
//! [`DriverFactory`] registered under the `kind` string used in the
//! configuration file:
//!
//! ```toml
//! [[instruments]]
//! id = "detector"
//! kind = "pilatus"          # matches DriverFactory::driver_type()
//! connection = { address = "192.168.1.20:41234" }
//! ```

use crate::config::ConnectionConfig;
use crate::connection::ConnectionStatus;
use crate::error::{CoreError, CoreResult};
use crate::notify::{Marshaler, Notifier};
use crate::property::{PropertyCache, Reading};
use crate::transport::{Connector, TcpConnector};
use crate::value::Value;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// What the consumer can do with a connected instrument.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Instrument id from the configuration.
    fn name(&self) -> &str;

    /// Driver type that built this instrument.
    fn kind(&self) -> &'static str;

    /// Lifecycle status of the underlying connection.
    fn status(&self) -> ConnectionStatus;

    /// Where change, error, warning and lifecycle events are published.
    fn notifier(&self) -> &Notifier;

    /// Cached properties.
    fn cache(&self) -> &PropertyCache;

    /// Open the connection and run the driver's startup checks.
    async fn connect(&self) -> CoreResult<()>;

    /// Park the hardware and close the connection.
    async fn disconnect(&self, clean: bool) -> CoreResult<()>;

    /// Current `(value, category)` of `name`, refreshed if stale.
    async fn get(&self, name: &str) -> Reading {
        self.cache().get(name).await
    }

    /// Write a property to the instrument.
    async fn set(&self, name: &str, _value: Value) -> CoreResult<()> {
        Err(CoreError::InvalidArgument(format!(
            "'{}' has no writable property '{name}'",
            self.name()
        )))
    }
}

/// Everything a factory needs besides the driver's own settings.
#[derive(Debug, Clone)]
pub struct InstrumentContext {
    /// Instrument id.
    pub name: String,
    /// Transport settings.
    pub connection: ConnectionConfig,
    /// How to open the transport.
    pub connector: Arc<dyn Connector>,
    /// Where notifications go.
    pub marshaler: Marshaler,
}

impl InstrumentContext {
    /// Context using real TCP sockets.
    pub fn tcp(name: impl Into<String>, connection: ConnectionConfig, marshaler: Marshaler) -> Self {
        Self {
            name: name.into(),
            connection,
            connector: Arc::new(TcpConnector),
            marshaler,
        }
    }
}

/// Builds instruments of one driver type.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in the configuration `kind` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for logs and error messages.
    fn name(&self) -> &'static str;

    /// Check the driver's `settings` table without building anything.
    fn validate(&self, settings: &toml::Value) -> Result<()>;

    /// Build a disconnected instrument.
    fn build(&self, ctx: InstrumentContext, settings: toml::Value) -> Result<Arc<dyn Instrument>>;
}

/// Factories keyed by driver type.
#[derive(Default)]
pub struct DriverRegistry {
    factories: RwLock<HashMap<&'static str, Arc<dyn DriverFactory>>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("factories", &self.list_factories())
            .finish()
    }
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Returns the one it replaced, if any.
    pub fn register_factory(&self, factory: Arc<dyn DriverFactory>) -> Option<Arc<dyn DriverFactory>> {
        let driver_type = factory.driver_type();
        tracing::debug!(driver_type, name = factory.name(), "Registering driver factory");
        self.factories.write().insert(driver_type, factory)
    }

    /// Whether `driver_type` is known.
    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.read().contains_key(driver_type)
    }

    /// Registered driver types, sorted.
    pub fn list_factories(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.read().keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    fn factory(&self, driver_type: &str) -> Result<Arc<dyn DriverFactory>> {
        self.factories
            .read()
            .get(driver_type)
            .cloned()
            .ok_or_else(|| anyhow!("no driver registered for kind '{driver_type}'"))
    }

    /// Validate `settings` with the factory for `driver_type`.
    pub fn validate(&self, driver_type: &str, settings: &toml::Value) -> Result<()> {
        self.factory(driver_type)?.validate(settings)
    }

    /// Validate and build an instrument.
    pub fn build(
        &self,
        driver_type: &str,
        ctx: InstrumentContext,
        settings: toml::Value,
    ) -> Result<Arc<dyn Instrument>> {
        let factory = self.factory(driver_type)?;
        factory.validate(&settings)?;
        let name = ctx.name.clone();
        let instrument = factory.build(ctx, settings)?;
        tracing::info!(instrument = %name, driver = factory.name(), "Instrument built");
        Ok(instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::testing::MockConnector;
    use crate::transport::Framing;

    struct Echo {
        conn: Connection,
    }

    #[async_trait]
    impl Instrument for Echo {
        fn name(&self) -> &str {
            self.conn.name()
        }
        fn kind(&self) -> &'static str {
            "echo"
        }
        fn status(&self) -> ConnectionStatus {
            self.conn.status()
        }
        fn notifier(&self) -> &Notifier {
            self.conn.notifier()
        }
        fn cache(&self) -> &PropertyCache {
            self.conn.cache()
        }
        async fn connect(&self) -> CoreResult<()> {
            self.conn.connect().await
        }
        async fn disconnect(&self, clean: bool) -> CoreResult<()> {
            self.conn.disconnect(clean).await
        }
    }

    struct EchoFactory;

    impl DriverFactory for EchoFactory {
        fn driver_type(&self) -> &'static str {
            "echo"
        }
        fn name(&self) -> &'static str {
            "Echo test instrument"
        }
        fn validate(&self, settings: &toml::Value) -> Result<()> {
            match settings.get("fail") {
                Some(_) => Err(anyhow!("told to fail")),
                None => Ok(()),
            }
        }
        fn build(&self, ctx: InstrumentContext, _settings: toml::Value) -> Result<Arc<dyn Instrument>> {
            let conn = Connection::new(
                ctx.name,
                ctx.connection,
                ctx.connector,
                Framing::lines(),
                ctx.marshaler,
            );
            Ok(Arc::new(Echo { conn }))
        }
    }

    fn context() -> InstrumentContext {
        let (marshaler, _run_loop) = Marshaler::channel();
        InstrumentContext {
            name: "echo-1".into(),
            connection: ConnectionConfig::new("mock:1"),
            connector: Arc::new(MockConnector::new()),
            marshaler,
        }
    }

    #[test]
    fn test_registry_builds_known_kinds() {
        let registry = DriverRegistry::new();
        assert!(registry.register_factory(Arc::new(EchoFactory)).is_none());
        assert!(registry.has_factory("echo"));
        assert_eq!(registry.list_factories(), vec!["echo"]);

        let settings = toml::Value::Table(toml::map::Map::new());
        let instrument = registry.build("echo", context(), settings).unwrap();
        assert_eq!(instrument.name(), "echo-1");
        assert_eq!(instrument.status(), ConnectionStatus::Disconnected);

        assert!(registry.build("nope", context(), toml::Value::Boolean(true)).is_err());
    }

    #[test]
    fn test_registry_validates_before_building() {
        let registry = DriverRegistry::new();
        registry.register_factory(Arc::new(EchoFactory));
        let settings: toml::Value = toml::from_str("fail = true").unwrap();
        let err = registry.build("echo", context(), settings).err().unwrap();
        assert!(err.to_string().contains("told to fail"));
    }

    #[tokio::test]
    async fn test_default_set_is_read_only() {
        let registry = DriverRegistry::new();
        registry.register_factory(Arc::new(EchoFactory));
        let instrument = registry
            .build("echo", context(), toml::Value::Table(Default::default()))
            .unwrap();
        let err = instrument.set("anything", Value::Int(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }
}
