//! Single-channel vacuum gauge controller.
//!
//! Commands are addressed to unit `001` and the reply echoes the command
//! code:
//!
//! | Command | Reply           | Meaning                                   |
//! |---------|-----------------|-------------------------------------------|
//! | `001T`  | `001T TPG201`   | controller model                          |
//! | `001U`  | `001U mbar`     | pressure unit                             |
//! | `001M`  | `001M100023`    | pressure, 4-digit mantissa and exponent   |
//! | `001M`  | `001MOR`        | sensor status instead of a reading        |
//! | any     | `NAK<code>`     | command refused                           |
//!
//! The pressure is `mantissa / 1000 * 10^(exponent - 23)`, so `100023` reads
//! as 1.0 mbar and `250017` as 2.5e-6 mbar.

use crate::plain::{publish, query, REFUSAL};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use saxs_core::protocol::line::{CommandSpec, CommandTable, Envelope, FieldType, ReplyPattern};
use saxs_core::{
    Category, Connection, ConnectionStatus, CoreError, CoreResult, DriverFactory, Framing,
    Instrument, InstrumentContext, LifecycleHooks, Notifier, PropertyCache, PropertySpec, Refresh,
    RetryPolicy, Value, ValueKind,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const EXPONENT_OFFSET: i32 = 23;

/// Driver settings from the instrument's `settings` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GaugeSettings {
    /// Pressure polling interval.
    #[serde(with = "humantime_serde")]
    pub pressure_interval: Duration,
    /// Pressures above this (mbar) are a warning.
    pub warning_above: f64,
    /// Pressures above this (mbar) are an error.
    pub error_above: f64,
}

impl Default for GaugeSettings {
    fn default() -> Self {
        Self {
            pressure_interval: Duration::from_secs(1),
            warning_above: 1.0,
            error_above: 100.0,
        }
    }
}

/// Factory for vacuum gauges.
pub struct GaugeFactory;

impl DriverFactory for GaugeFactory {
    fn driver_type(&self) -> &'static str {
        "tpg201"
    }

    fn name(&self) -> &'static str {
        "Vacuum gauge"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: GaugeSettings = settings.clone().try_into()?;
        if cfg.pressure_interval.is_zero() {
            return Err(anyhow!("pressure_interval must be greater than zero"));
        }
        if !(cfg.warning_above > 0.0 && cfg.warning_above < cfg.error_above) {
            return Err(anyhow!(
                "thresholds must satisfy 0 < warning_above ({}) < error_above ({})",
                cfg.warning_above,
                cfg.error_above
            ));
        }
        Ok(())
    }

    fn build(&self, ctx: InstrumentContext, settings: toml::Value) -> Result<Arc<dyn Instrument>> {
        let cfg: GaugeSettings = settings.try_into().context("Invalid gauge settings")?;
        Ok(GaugeDriver::new(ctx, cfg)?)
    }
}

/// Gauge command table.
pub fn command_table() -> Result<CommandTable, regex::Error> {
    let refusal = || ReplyPattern::plain(&format!(r"^(?P<{REFUSAL}>NAK\d*)$"));
    Ok(CommandTable::new(Envelope::Plain)
        .with(
            CommandSpec::new("model")
                .reply(ReplyPattern::plain(r"^001T\s*(?P<model>\S.*)$")?)
                .reply(refusal()?),
        )
        .with(
            CommandSpec::new("unit")
                .reply(ReplyPattern::plain(r"^001U\s*(?P<unit>\w+)$")?)
                .reply(refusal()?),
        )
        .with(
            CommandSpec::new("pressure")
                .reply(
                    ReplyPattern::plain(r"^001M(?P<mantissa>\d{4})(?P<exponent>\d{2})$")?
                        .default_value("sensor", "ok"),
                )
                .reply(ReplyPattern::plain(r"^001M(?P<sensor>OR|UR|SE)$")?)
                .reply(refusal()?)
                .field("mantissa", FieldType::Int)
                .field("exponent", FieldType::Int),
        ))
}

/// Pressure in mbar from the reply digits.
pub fn pressure_from(mantissa: i64, exponent: i64) -> f64 {
    let exponent = i32::try_from(exponent).unwrap_or(EXPONENT_OFFSET) - EXPONENT_OFFSET;
    mantissa as f64 / 1000.0 * 10f64.powi(exponent)
}

/// Readable text for the sensor status code.
fn sensor_text(code: &str) -> &'static str {
    match code {
        "OR" => "over range",
        "UR" => "under range",
        "SE" => "sensor error",
        _ => "ok",
    }
}

fn properties(settings: &GaugeSettings) -> Vec<PropertySpec> {
    let (warning, error) = (settings.warning_above, settings.error_above);
    vec![
        PropertySpec::new("pressure", ValueKind::Float)
            .refresh_every(settings.pressure_interval)
            .categorize_with(move |v| match v.as_f64() {
                Some(p) if p > error => Category::Error,
                Some(p) if p > warning => Category::Warning,
                Some(_) => Category::Ok,
                None => Category::Unknown,
            }),
        PropertySpec::new("sensor", ValueKind::Text).categorize_with(|v| match v.as_str() {
            Some("ok") => Category::Ok,
            Some("sensor error") => Category::Error,
            Some(_) => Category::Warning,
            None => Category::Unknown,
        }),
        PropertySpec::new("model", ValueKind::Text),
        PropertySpec::new("unit", ValueKind::Text),
    ]
}

struct GaugeHooks {
    table: Arc<CommandTable>,
    cache: PropertyCache,
    retry: RetryPolicy,
}

#[async_trait]
impl LifecycleHooks<Connection> for GaugeHooks {
    async fn post_connect(&self, conn: &Connection) -> CoreResult<()> {
        let reply = query(conn, &self.table, &self.retry, "model", "001T").await?;
        let model = reply.text("model").unwrap_or_default();
        if !model.starts_with("TPG") {
            return Err(CoreError::rejected(
                conn.name(),
                format!("unexpected gauge model '{model}'"),
            ));
        }
        publish(&self.cache, &reply);

        let reply = query(conn, &self.table, &self.retry, "unit", "001U").await?;
        let unit = reply.text("unit").unwrap_or_default();
        if unit != "mbar" {
            return Err(CoreError::rejected(
                conn.name(),
                format!("gauge reports pressure in '{unit}', switch it to mbar"),
            ));
        }
        publish(&self.cache, &reply);
        tracing::info!(instrument = %conn.name(), %model, "Vacuum gauge identified");
        Ok(())
    }
}

/// Vacuum gauge instrument.
pub struct GaugeDriver {
    conn: Connection,
    table: Arc<CommandTable>,
    retry: RetryPolicy,
}

impl GaugeDriver {
    /// Build a disconnected driver.
    pub fn new(ctx: InstrumentContext, settings: GaugeSettings) -> Result<Arc<Self>> {
        let table = Arc::new(command_table().context("gauge command table")?);
        let retry = ctx.connection.retry.clone();
        let conn = Connection::new(
            ctx.name,
            ctx.connection,
            ctx.connector,
            Framing::lines(),
            ctx.marshaler,
        );
        conn.cache().register_all(properties(&settings));
        conn.set_hooks(Arc::new(GaugeHooks {
            table: table.clone(),
            cache: conn.cache().clone(),
            retry: retry.clone(),
        }));
        let driver = Arc::new(Self { conn, table, retry });
        driver.conn.cache().bind(&driver);
        Ok(driver)
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Read the pressure in mbar. Publishes the sensor status either way;
    /// fails when the sensor reports a status instead of a reading.
    pub async fn pressure(&self) -> CoreResult<f64> {
        let reply = query(&self.conn, &self.table, &self.retry, "pressure", "001M").await?;
        let sensor = sensor_text(reply.text("sensor").unwrap_or_default());
        self.conn.cache().store("sensor", Value::Text(sensor.to_string()));
        match (reply.int("mantissa"), reply.int("exponent")) {
            (Some(mantissa), Some(exponent)) => {
                let pressure = pressure_from(mantissa, exponent);
                self.conn.cache().store("pressure", Value::Float(pressure));
                Ok(pressure)
            }
            _ => Err(CoreError::rejected(
                self.conn.name(),
                format!("no pressure reading: {sensor}"),
            )),
        }
    }
}

#[async_trait]
impl Refresh for GaugeDriver {
    async fn refresh(&self, name: &str) -> CoreResult<Value> {
        match name {
            "pressure" => self.pressure().await.map(Value::Float),
            // A status reply is still a valid sensor reading
            "sensor" => match self.pressure().await {
                Ok(_) | Err(CoreError::DeviceRejected { .. }) => self
                    .conn
                    .cache()
                    .peek("sensor")
                    .and_then(|r| r.value)
                    .ok_or_else(|| CoreError::rejected(self.conn.name(), "no sensor status")),
                Err(e) => Err(e),
            },
            "model" | "unit" => {
                let line = if name == "model" { "001T" } else { "001U" };
                let reply = query(&self.conn, &self.table, &self.retry, name, line).await?;
                reply
                    .fields
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CoreError::rejected(self.conn.name(), format!("no '{name}' reported")))
            }
            _ => Err(CoreError::InvalidArgument(format!("unknown property '{name}'"))),
        }
    }
}

#[async_trait]
impl Instrument for GaugeDriver {
    fn name(&self) -> &str {
        self.conn.name()
    }

    fn kind(&self) -> &'static str {
        "tpg201"
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
