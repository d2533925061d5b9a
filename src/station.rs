//! The set of instruments built from the configuration.

use crate::config::SaxsConfig;
use anyhow::{Context as _, Result};
use saxs_core::{
    ConnectionStatus, Connector, CoreError, DriverRegistry, Event, Instrument, InstrumentContext,
    Marshaler, TcpConnector,
};
use saxs_driver_ascii::{CirculatorFactory, GaugeFactory};
use saxs_driver_genix::GenixFactory;
use saxs_driver_pilatus::PilatusFactory;
use saxs_driver_trinamic::TrinamicFactory;
use std::sync::Arc;

/// Registry with every built-in driver.
pub fn registry() -> DriverRegistry {
    let registry = DriverRegistry::new();
    registry.register_factory(Arc::new(PilatusFactory));
    registry.register_factory(Arc::new(TrinamicFactory));
    registry.register_factory(Arc::new(GenixFactory));
    registry.register_factory(Arc::new(GaugeFactory));
    registry.register_factory(Arc::new(CirculatorFactory));
    registry
}

/// Enabled instruments, in configuration order.
pub struct Station {
    instruments: Vec<Arc<dyn Instrument>>,
}

impl Station {
    /// Build every enabled instrument over TCP.
    pub fn build(config: &SaxsConfig, registry: &DriverRegistry, marshaler: &Marshaler) -> Result<Self> {
        Self::build_with(config, registry, marshaler, Arc::new(TcpConnector))
    }

    /// Build every enabled instrument, opening transports through `connector`.
    pub fn build_with(
        config: &SaxsConfig,
        registry: &DriverRegistry,
        marshaler: &Marshaler,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let mut instruments = Vec::new();
        for definition in config.enabled_instruments() {
            let ctx = InstrumentContext {
                name: definition.id.clone(),
                connection: definition.connection.clone(),
                connector: connector.clone(),
                marshaler: marshaler.clone(),
            };
            let instrument = registry
                .build(&definition.kind, ctx, definition.settings.clone())
                .with_context(|| format!("Failed to build instrument '{}'", definition.id))?;
            instruments.push(instrument);
        }
        Ok(Self { instruments })
    }

    /// All instruments.
    pub fn instruments(&self) -> &[Arc<dyn Instrument>] {
        &self.instruments
    }

    /// Instrument by id.
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Instrument>> {
        self.instruments.iter().find(|i| i.name() == id)
    }

    /// Subscribe `callback` to every instrument's notifier.
    pub fn subscribe_all<F>(&self, callback: F)
    where
        F: Fn(&Event) + Clone + Send + Sync + 'static,
    {
        for instrument in &self.instruments {
            instrument.notifier().subscribe(callback.clone());
        }
    }

    /// Connect every instrument in order. A failing instrument is logged and
    /// skipped; the failures are returned.
    pub async fn connect_all(&self) -> Vec<(String, CoreError)> {
        let mut failures = Vec::new();
        for instrument in &self.instruments {
            match instrument.connect().await {
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(instrument = %instrument.name(), error = %e, "Connect failed");
                    failures.push((instrument.name().to_string(), e));
                }
            }
        }
        failures
    }

    /// Cleanly disconnect every connected instrument, in reverse order.
    pub async fn disconnect_all(&self) {
        for instrument in self.instruments.iter().rev() {
            if instrument.status() == ConnectionStatus::Disconnected {
                continue;
            }
            if let Err(e) = instrument.disconnect(true).await {
                tracing::warn!(instrument = %instrument.name(), error = %e, "Disconnect failed");
            }
        }
    }
}

/// Log a notification at a level matching its severity.
pub fn log_event(event: &Event) {
    match event {
        Event::Connected { instrument } => tracing::info!(%instrument, "Instrument connected"),
        Event::Disconnected { instrument, clean } => {
            if *clean {
                tracing::info!(%instrument, "Instrument disconnected");
            } else {
                tracing::error!(%instrument, "Instrument connection lost");
            }
        }
        Event::PropertyChanged {
            instrument,
            name,
            value,
            category,
        } => match value {
            Some(value) => {
                tracing::debug!(%instrument, property = %name, %value, %category, "Property changed")
            }
            None => tracing::debug!(%instrument, property = %name, %category, "Property invalid"),
        },
        Event::PropertyWarning { instrument, name } => {
            tracing::warn!(%instrument, property = %name, "Property out of range")
        }
        Event::PropertyError { instrument, name } => {
            tracing::error!(%instrument, property = %name, "Property reports a fault")
        }
        Event::ControllerError { instrument, reason } => {
            tracing::error!(%instrument, %reason, "Controller unreachable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_every_driver() {
        assert_eq!(
            registry().list_factories(),
            vec!["genix", "haake", "pilatus", "tpg201", "trinamic"]
        );
    }
}
