//! Generator instrument over the register bus.

use crate::registers::{
    command, flag_category, scaled, GeneratorState, StatusFlags, CURRENT, HT, STATUS_FLAGS,
    STATUS_START, TUBE_TEMPERATURE, TUBE_TIME,
};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use saxs_core::protocol::register::{RegisterAddress, RegisterBus};
use saxs_core::{
    with_retry, Category, ConnectionStatus, CoreError, CoreResult, DriverFactory, Instrument,
    InstrumentContext, LifecycleHooks, Notifier, PropertyCache, PropertySpec, Refresh,
    RetryPolicy, Value, ValueKind,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Driver settings from the instrument's `settings` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenixSettings {
    /// Status flag and derived state polling interval.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
    /// High tension, current and tube temperature polling interval.
    #[serde(with = "humantime_serde")]
    pub analog_interval: Duration,
    /// Refuse to connect while the controller is in local mode.
    pub require_remote: bool,
    /// Close the shutter before disconnecting.
    pub close_shutter_on_disconnect: bool,
}

impl Default for GenixSettings {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            analog_interval: Duration::from_secs(2),
            require_remote: true,
            close_shutter_on_disconnect: true,
        }
    }
}

/// Factory for X-ray generators.
pub struct GenixFactory;

impl DriverFactory for GenixFactory {
    fn driver_type(&self) -> &'static str {
        "genix"
    }

    fn name(&self) -> &'static str {
        "X-ray generator"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: GenixSettings = settings.clone().try_into()?;
        if cfg.status_interval.is_zero() || cfg.analog_interval.is_zero() {
            return Err(anyhow!("polling intervals must be greater than zero"));
        }
        Ok(())
    }

    fn build(&self, ctx: InstrumentContext, settings: toml::Value) -> Result<Arc<dyn Instrument>> {
        let cfg: GenixSettings = settings
            .try_into()
            .context("Invalid generator settings")?;
        Ok(GenixDriver::new(ctx, cfg))
    }
}

fn properties(settings: &GenixSettings) -> Vec<PropertySpec> {
    let mut specs = vec![
        PropertySpec::new("state", ValueKind::Text).refresh_every(settings.status_interval),
        PropertySpec::new("ht", ValueKind::Float).refresh_every(settings.analog_interval),
        PropertySpec::new("current", ValueKind::Float).refresh_every(settings.analog_interval),
        PropertySpec::new("tube_temperature", ValueKind::Float)
            .refresh_every(settings.analog_interval)
            .categorize_with(|v| match v.as_f64() {
                Some(t) if t >= 55.0 => Category::Error,
                Some(t) if t >= 45.0 => Category::Warning,
                Some(_) => Category::Ok,
                None => Category::Unknown,
            }),
        PropertySpec::new("tube_time", ValueKind::Int),
    ];
    // Flags are refreshed together with `state`
    for name in STATUS_FLAGS {
        specs.push(
            PropertySpec::new(*name, ValueKind::Bool)
                .categorize_with(move |v| flag_category(name, v.as_bool().unwrap_or(false))),
        );
    }
    specs
}

/// Read the status coils and publish every flag.
async fn read_status(bus: &RegisterBus, retry: &RetryPolicy) -> CoreResult<StatusFlags> {
    let bits = with_retry(retry, "read status", |_| {
        bus.read_coils(STATUS_START, STATUS_FLAGS.len() as u16)
    })
    .await?;
    let flags = StatusFlags::decode(&bits);
    for (name, set) in flags.iter() {
        bus.cache().store(name, Value::Bool(set));
    }
    Ok(flags)
}

struct GenixHooks {
    retry: RetryPolicy,
    require_remote: bool,
    close_shutter: bool,
}

#[async_trait]
impl LifecycleHooks<RegisterBus> for GenixHooks {
    async fn post_connect(&self, bus: &RegisterBus) -> CoreResult<()> {
        let flags = read_status(bus, &self.retry).await?;
        if self.require_remote && !flags.get("remote_mode") {
            return Err(CoreError::rejected(
                bus.name(),
                "controller is in local mode, switch it to remote",
            ));
        }
        if flags.get("fault") {
            tracing::warn!(instrument = %bus.name(), "Generator reports a fault");
        }
        Ok(())
    }

    async fn pre_disconnect(&self, bus: &RegisterBus) -> CoreResult<()> {
        if !self.close_shutter {
            return Ok(());
        }
        let flags = read_status(bus, &RetryPolicy::none()).await?;
        if flags.get("shutter_open") {
            tracing::info!(instrument = %bus.name(), "Closing shutter before disconnect");
            bus.write_coil(command::SHUTTER_CLOSE, true).await?;
        }
        Ok(())
    }
}

/// X-ray generator instrument.
pub struct GenixDriver {
    bus: RegisterBus,
    retry: RetryPolicy,
}

impl GenixDriver {
    /// Build a disconnected driver.
    pub fn new(ctx: InstrumentContext, settings: GenixSettings) -> Arc<Self> {
        let retry = ctx.connection.retry.clone();
        let bus = RegisterBus::new(ctx.name, ctx.connection, ctx.connector, ctx.marshaler);
        bus.cache().register_all(properties(&settings));
        bus.set_hooks(Arc::new(GenixHooks {
            retry: retry.clone(),
            require_remote: settings.require_remote,
            close_shutter: settings.close_shutter_on_disconnect,
        }));
        let driver = Arc::new(Self { bus, retry });
        driver.bus.cache().bind(&driver);
        driver
    }

    /// Underlying bus client.
    pub fn bus(&self) -> &RegisterBus {
        &self.bus
    }

    /// Read and publish the status flags.
    pub async fn read_status(&self) -> CoreResult<StatusFlags> {
        read_status(&self.bus, &self.retry).await
    }

    async fn register(&self, address: RegisterAddress) -> CoreResult<u16> {
        with_retry(&self.retry, "read register", |_| {
            self.bus.read_input_register(address.index)
        })
        .await
    }

    /// Read a scaled analog register and publish it under `property`.
    async fn analog(&self, property: &str, address: RegisterAddress) -> CoreResult<f64> {
        let value = scaled(self.register(address).await?);
        self.bus.cache().store(property, Value::Float(value));
        Ok(value)
    }

    /// Read flags and analog readings, derive and publish the state.
    pub async fn state(&self) -> CoreResult<GeneratorState> {
        let flags = self.read_status().await?;
        let ht = self.analog("ht", HT).await?;
        let current = self.analog("current", CURRENT).await?;
        let state = GeneratorState::derive(&flags, ht, current);
        self.bus.cache().store("state", Value::Text(state.to_string()));
        Ok(state)
    }

    async fn pulse(&self, coil: u16, action: &str) -> CoreResult<()> {
        tracing::info!(instrument = %self.bus.name(), action, coil, "Generator command");
        with_retry(&self.retry, action, |_| self.bus.write_coil(coil, true)).await?;
        self.read_status().await.map(drop)
    }

    async fn require(&self, flag: &str, action: &str) -> CoreResult<()> {
        if self.read_status().await?.get(flag) {
            Ok(())
        } else {
            Err(CoreError::rejected(
                self.bus.name(),
                format!("cannot {action}: {flag} is not set"),
            ))
        }
    }

    /// Open the shutter. Refused while the interlock is broken.
    #[instrument(skip(self), fields(instrument = %self.bus.name()))]
    pub async fn open_shutter(&self) -> CoreResult<()> {
        self.require("interlock_ok", "open shutter").await?;
        self.pulse(command::SHUTTER_OPEN, "open shutter").await
    }

    /// Close the shutter.
    #[instrument(skip(self), fields(instrument = %self.bus.name()))]
    pub async fn close_shutter(&self) -> CoreResult<()> {
        self.pulse(command::SHUTTER_CLOSE, "close shutter").await
    }

    /// Switch X-rays on or off.
    #[instrument(skip(self), fields(instrument = %self.bus.name()))]
    pub async fn set_xrays(&self, on: bool) -> CoreResult<()> {
        if on {
            self.require("interlock_ok", "switch X-rays on").await?;
            self.pulse(command::XRAYS_ON, "X-rays on").await
        } else {
            self.pulse(command::XRAYS_OFF, "X-rays off").await
        }
    }

    /// Ramp to full power.
    pub async fn full_power(&self) -> CoreResult<()> {
        self.require("xrays_on", "ramp to full power").await?;
        self.pulse(command::FULL_POWER, "full power").await
    }

    /// Ramp to standby power.
    pub async fn standby(&self) -> CoreResult<()> {
        self.require("xrays_on", "go to standby").await?;
        self.pulse(command::STANDBY, "standby").await
    }

    /// Ramp down to zero power.
    pub async fn power_down(&self) -> CoreResult<()> {
        self.pulse(command::POWER_DOWN, "power down").await
    }

    /// Start the warm-up cycle.
    pub async fn warm_up(&self) -> CoreResult<()> {
        self.require("xrays_on", "start warm-up").await?;
        self.pulse(command::WARM_UP, "warm up").await
    }

    /// Acknowledge faults.
    pub async fn reset_faults(&self) -> CoreResult<()> {
        self.pulse(command::RESET_FAULTS, "reset faults").await
    }
}

#[async_trait]
impl Refresh for GenixDriver {
    async fn refresh(&self, name: &str) -> CoreResult<Value> {
        match name {
            "state" => Ok(Value::Text(self.state().await?.to_string())),
            "ht" => self.analog(name, HT).await.map(Value::Float),
            "current" => self.analog(name, CURRENT).await.map(Value::Float),
            "tube_temperature" => self.analog(name, TUBE_TEMPERATURE).await.map(Value::Float),
            "tube_time" => Ok(Value::Int(i64::from(self.register(TUBE_TIME).await?))),
            flag if STATUS_FLAGS.contains(&flag) => {
                Ok(Value::Bool(self.read_status().await?.get(flag)))
            }
            _ => Err(CoreError::InvalidArgument(format!("unknown property '{name}'"))),
        }
    }
}

#[async_trait]
impl Instrument for GenixDriver {
    fn name(&self) -> &str {
        self.bus.name()
    }

    fn kind(&self) -> &'static str {
        "genix"
    }

    fn status(&self) -> ConnectionStatus {
        self.bus.status()
    }

    fn notifier(&self) -> &Notifier {
        self.bus.notifier()
    }

    fn cache(&self) -> &PropertyCache {
        self.bus.cache()
    }

    async fn connect(&self) -> CoreResult<()> {
        self.bus.connect().await
    }

    async fn disconnect(&self, clean: bool) -> CoreResult<()> {
        self.bus.disconnect(clean).await
    }

    async fn set(&self, name: &str, value: Value) -> CoreResult<()> {
        let flag = |v: &Value| {
            v.as_bool().ok_or_else(|| {
                CoreError::InvalidArgument(format!("'{name}' expects a boolean, got {v}"))
            })
        };
        match name {
            "shutter_open" if flag(&value)? => self.open_shutter().await,
            "shutter_open" => self.close_shutter().await,
            "xrays_on" => self.set_xrays(flag(&value)?).await,
            _ => Err(CoreError::InvalidArgument(format!(
                "'{}' has no writable property '{name}'",
                self.bus.name()
            ))),
        }
    }
}
