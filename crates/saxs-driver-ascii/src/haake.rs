//! Bath circulator.
//!
//! Replies end with `$`; a refused command answers `F<code>` instead.
//!
//! | Command          | Reply     | Meaning                              |
//! |------------------|-----------|--------------------------------------|
//! | `VER`            | `1P/H 2.05$` | firmware version                  |
//! | `IN PV 1`        | `25.12$`  | bath temperature, °C                 |
//! | `IN SP 1`        | `25.00$`  | temperature setpoint, °C             |
//! | `OUT SP 1 <t>`   | `$`       | change the setpoint                  |
//! | `IN MODE 5`      | `1$`      | circulator running                   |
//! | `OUT MODE 5 <b>` | `$`       | start (1) or stop (0)                |
//! | `IN STATUS`      | `000000$` | alarm digits, any non-zero is a fault |

use crate::plain::{publish, query, REFUSAL};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use saxs_core::protocol::line::{
    CommandSpec, CommandTable, Envelope, FieldType, Reply, ReplyPattern,
};
use saxs_core::{
    Category, Connection, ConnectionStatus, CoreError, CoreResult, DriverFactory, Framing,
    Instrument, InstrumentContext, LifecycleHooks, Notifier, PropertyCache, PropertySpec, Refresh,
    RetryPolicy, Value, ValueKind,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Driver settings from the instrument's `settings` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CirculatorSettings {
    /// Temperature polling interval.
    #[serde(with = "humantime_serde")]
    pub temperature_interval: Duration,
    /// Alarm status polling interval.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
    /// Allowed deviation from the setpoint before a warning, °C.
    pub tolerance: f64,
    /// Lowest accepted setpoint, °C.
    pub min_setpoint: f64,
    /// Highest accepted setpoint, °C.
    pub max_setpoint: f64,
}

impl Default for CirculatorSettings {
    fn default() -> Self {
        Self {
            temperature_interval: Duration::from_secs(2),
            status_interval: Duration::from_secs(5),
            tolerance: 0.5,
            min_setpoint: -10.0,
            max_setpoint: 90.0,
        }
    }
}

/// Factory for bath circulators.
pub struct CirculatorFactory;

impl DriverFactory for CirculatorFactory {
    fn driver_type(&self) -> &'static str {
        "haake"
    }

    fn name(&self) -> &'static str {
        "Bath circulator"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: CirculatorSettings = settings.clone().try_into()?;
        if cfg.temperature_interval.is_zero() || cfg.status_interval.is_zero() {
            return Err(anyhow!("polling intervals must be greater than zero"));
        }
        if cfg.min_setpoint >= cfg.max_setpoint {
            return Err(anyhow!(
                "min_setpoint ({}) must be below max_setpoint ({})",
                cfg.min_setpoint,
                cfg.max_setpoint
            ));
        }
        if cfg.tolerance <= 0.0 {
            return Err(anyhow!("tolerance must be positive"));
        }
        Ok(())
    }

    fn build(&self, ctx: InstrumentContext, settings: toml::Value) -> Result<Arc<dyn Instrument>> {
        let cfg: CirculatorSettings = settings
            .try_into()
            .context("Invalid circulator settings")?;
        Ok(CirculatorDriver::new(ctx, cfg)?)
    }
}

/// Circulator command table.
pub fn command_table() -> Result<CommandTable, regex::Error> {
    let refusal = || ReplyPattern::plain(&format!(r"^(?P<{REFUSAL}>F\d{{3}})$"));
    let reading = |field: &str| ReplyPattern::plain(&format!(r"^(?P<{field}>-?\d+(?:\.\d+)?)\$$"));
    let ack = || ReplyPattern::plain(r"^\$$");
    Ok(CommandTable::new(Envelope::Plain)
        .with(
            CommandSpec::new("version")
                .reply(refusal()?)
                .reply(ReplyPattern::plain(r"^(?P<version>\S.*?)\s*\$$")?),
        )
        .with(
            CommandSpec::new("temperature")
                .reply(reading("temperature")?)
                .reply(refusal()?)
                .field("temperature", FieldType::Float),
        )
        .with(
            CommandSpec::new("setpoint")
                .reply(reading("setpoint")?)
                .reply(refusal()?)
                .field("setpoint", FieldType::Float),
        )
        .with(CommandSpec::new("set_setpoint").reply(ack()?).reply(refusal()?))
        .with(
            CommandSpec::new("running")
                .reply(ReplyPattern::plain(r"^(?P<mode>[01])\$$")?)
                .reply(refusal()?)
                .field("mode", FieldType::Int),
        )
        .with(CommandSpec::new("set_running").reply(ack()?).reply(refusal()?))
        .with(
            CommandSpec::new("status")
                .reply(ReplyPattern::plain(r"^(?P<status>\d+)\$$")?)
                .reply(refusal()?),
        ))
}

fn properties(settings: &CirculatorSettings) -> Vec<PropertySpec> {
    let tolerance = settings.tolerance;
    vec![
        PropertySpec::new("temperature", ValueKind::Float)
            .refresh_every(settings.temperature_interval),
        PropertySpec::new("setpoint", ValueKind::Float),
        PropertySpec::new("deviation", ValueKind::Float).categorize_with(move |v| {
            match v.as_f64() {
                Some(d) if d.abs() > tolerance => Category::Warning,
                Some(_) => Category::Ok,
                None => Category::Unknown,
            }
        }),
        PropertySpec::new("running", ValueKind::Bool),
        PropertySpec::new("alarm", ValueKind::Bool)
            .refresh_every(settings.status_interval)
            .categorize_with(|v| Category::fault(v.as_bool().unwrap_or(false))),
        PropertySpec::new("status", ValueKind::Text),
        PropertySpec::new("version", ValueKind::Text),
    ]
}

struct CirculatorHooks {
    table: Arc<CommandTable>,
    cache: PropertyCache,
    retry: RetryPolicy,
}

#[async_trait]
impl LifecycleHooks<Connection> for CirculatorHooks {
    async fn post_connect(&self, conn: &Connection) -> CoreResult<()> {
        let reply = query(conn, &self.table, &self.retry, "version", "VER").await?;
        tracing::info!(
            instrument = %conn.name(),
            version = reply.text("version").unwrap_or_default(),
            "Circulator identified"
        );
        publish(&self.cache, &reply);
        let reply = query(conn, &self.table, &self.retry, "setpoint", "IN SP 1").await?;
        publish(&self.cache, &reply);
        Ok(())
    }
}

/// Bath circulator instrument.
pub struct CirculatorDriver {
    conn: Connection,
    table: Arc<CommandTable>,
    retry: RetryPolicy,
    settings: CirculatorSettings,
}

impl CirculatorDriver {
    /// Build a disconnected driver.
    pub fn new(ctx: InstrumentContext, settings: CirculatorSettings) -> Result<Arc<Self>> {
        let table = Arc::new(command_table().context("circulator command table")?);
        let retry = ctx.connection.retry.clone();
        let conn = Connection::new(
            ctx.name,
            ctx.connection,
            ctx.connector,
            Framing::lines(),
            ctx.marshaler,
        );
        conn.cache().register_all(properties(&settings));
        conn.set_hooks(Arc::new(CirculatorHooks {
            table: table.clone(),
            cache: conn.cache().clone(),
            retry: retry.clone(),
        }));
        let driver = Arc::new(Self {
            conn,
            table,
            retry,
            settings,
        });
        driver.conn.cache().bind(&driver);
        Ok(driver)
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    async fn command(&self, command: &str, line: &str) -> CoreResult<Reply> {
        let reply = query(&self.conn, &self.table, &self.retry, command, line).await?;
        publish(self.conn.cache(), &reply);
        Ok(reply)
    }

    /// Read the bath temperature and update the deviation from the setpoint.
    pub async fn temperature(&self) -> CoreResult<f64> {
        let reply = self.command("temperature", "IN PV 1").await?;
        let temperature = reply
            .float("temperature")
            .ok_or_else(|| CoreError::rejected(self.conn.name(), "no temperature reported"))?;
        let setpoint = self
            .conn
            .cache()
            .peek("setpoint")
            .and_then(|r| r.value)
            .and_then(|v| v.as_f64());
        if let Some(setpoint) = setpoint {
            self.conn
                .cache()
                .store("deviation", Value::Float(temperature - setpoint));
        }
        Ok(temperature)
    }

    /// Read the setpoint.
    pub async fn setpoint(&self) -> CoreResult<f64> {
        let reply = self.command("setpoint", "IN SP 1").await?;
        reply
            .float("setpoint")
            .ok_or_else(|| CoreError::rejected(self.conn.name(), "no setpoint reported"))
    }

    /// Change the setpoint, within the configured limits.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn set_setpoint(&self, celsius: f64) -> CoreResult<()> {
        let (min, max) = (self.settings.min_setpoint, self.settings.max_setpoint);
        if !(min..=max).contains(&celsius) {
            return Err(CoreError::InvalidArgument(format!(
                "setpoint {celsius} °C outside {min}..={max} °C"
            )));
        }
        self.command("set_setpoint", &format!("OUT SP 1 {celsius:.2}"))
            .await?;
        self.setpoint().await.map(drop)
    }

    /// Whether the pump and temperature control are running.
    pub async fn is_running(&self) -> CoreResult<bool> {
        let reply = self.command("running", "IN MODE 5").await?;
        let running = reply.int("mode") == Some(1);
        self.conn.cache().store("running", Value::Bool(running));
        Ok(running)
    }

    /// Start or stop the circulator.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn set_running(&self, on: bool) -> CoreResult<()> {
        self.command("set_running", &format!("OUT MODE 5 {}", u8::from(on)))
            .await?;
        self.is_running().await.map(drop)
    }

    /// Read the alarm digits. Returns true when any alarm is raised.
    pub async fn alarm(&self) -> CoreResult<bool> {
        let reply = self.command("status", "IN STATUS").await?;
        let digits = reply.text("status").unwrap_or_default();
        let alarm = digits.chars().any(|c| c != '0');
        if alarm {
            tracing::warn!(instrument = %self.conn.name(), status = digits, "Circulator alarm");
        }
        self.conn.cache().store("alarm", Value::Bool(alarm));
        Ok(alarm)
    }
}

#[async_trait]
impl Refresh for CirculatorDriver {
    async fn refresh(&self, name: &str) -> CoreResult<Value> {
        match name {
            "temperature" => self.temperature().await.map(Value::Float),
            "setpoint" => self.setpoint().await.map(Value::Float),
            "running" => self.is_running().await.map(Value::Bool),
            "alarm" => self.alarm().await.map(Value::Bool),
            "status" => {
                self.alarm().await?;
                self.conn
                    .cache()
                    .peek("status")
                    .and_then(|r| r.value)
                    .ok_or_else(|| CoreError::rejected(self.conn.name(), "no status reported"))
            }
            "deviation" => {
                self.temperature().await?;
                self.conn
                    .cache()
                    .peek("deviation")
                    .and_then(|r| r.value)
                    .ok_or_else(|| CoreError::rejected(self.conn.name(), "setpoint unknown"))
            }
            "version" => {
                let reply = self.command("version", "VER").await?;
                reply
                    .fields
                    .get("version")
                    .cloned()
                    .ok_or_else(|| CoreError::rejected(self.conn.name(), "no version reported"))
            }
            _ => Err(CoreError::InvalidArgument(format!("unknown property '{name}'"))),
        }
    }
}

#[async_trait]
impl Instrument for CirculatorDriver {
    fn name(&self) -> &str {
        self.conn.name()
    }

    fn kind(&self) -> &'static str {
        "haake"
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

    async fn set(&self, name: &str, value: Value) -> CoreResult<()> {
        let invalid = || CoreError::InvalidArgument(format!("bad value {value} for '{name}'"));
        match name {
            "setpoint" => self.set_setpoint(value.as_f64().ok_or_else(invalid)?).await,
            "running" => self.set_running(value.as_bool().ok_or_else(invalid)?).await,
            _ => Err(CoreError::InvalidArgument(format!(
                "'{}' has no writable property '{name}'",
                self.conn.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replies_are_told_apart_by_pending_command() {
        let table = command_table().unwrap();
        let t = table.dispatch("25.12$", Some("temperature")).unwrap().unwrap();
        assert_eq!(t.float("temperature"), Some(25.12));
        let s = table.dispatch("25.12$", Some("setpoint")).unwrap().unwrap();
        assert_eq!(s.float("setpoint"), Some(25.12));
        let v = table.dispatch("1P/H 2.05$", Some("version")).unwrap().unwrap();
        assert_eq!(v.text("version"), Some("1P/H 2.05"));
        assert!(table.dispatch("$", Some("temperature")).unwrap().is_none());
    }

    #[test]
    fn test_refusal_is_recognised() {
        let table = command_table().unwrap();
        let refused = table.dispatch("F001", Some("set_setpoint")).unwrap().unwrap();
        assert_eq!(refused.text(REFUSAL), Some("F001"));
        let refused = table.dispatch("F123", Some("version")).unwrap().unwrap();
        assert_eq!(refused.text(REFUSAL), Some("F123"));
    }

    #[test]
    fn test_deviation_category() {
        let specs = properties(&CirculatorSettings::default());
        let deviation = specs.iter().find(|s| s.name() == "deviation").unwrap();
        assert_eq!(deviation.categorize(&Value::Float(0.2)), Category::Ok);
        assert_eq!(deviation.categorize(&Value::Float(-1.0)), Category::Warning);
    }

    #[test]
    fn test_factory_validation() {
        let bad: toml::Value = toml::from_str("min_setpoint = 50.0\nmax_setpoint = 10.0").unwrap();
        assert!(CirculatorFactory.validate(&bad).is_err());
        let ok: toml::Value = toml::from_str("tolerance = 0.2").unwrap();
        CirculatorFactory.validate(&ok).unwrap();
    }
}
