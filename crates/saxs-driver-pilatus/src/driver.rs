//! Detector driver: connection hooks, property refresh and exposure control.

use crate::camserver::{self, CONTEXT_EXPOSURE_DONE, GAINS};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use saxs_core::protocol::line::{CommandTable, Reply, Status};
use saxs_core::{
    with_retry, Connection, ConnectionStatus, CoreError, CoreResult, DriverFactory, Framing,
    Instrument, InstrumentContext, LifecycleHooks, Notifier, PropertyCache, Refresh, RetryPolicy,
    Value, WeakConnection,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Device state shown while an exposure runs.
pub const EXPOSING: &str = "Exposing";

// =============================================================================
// Settings & factory
// =============================================================================

/// Driver settings from the instrument's `settings` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PilatusSettings {
    /// Image directory selected after connecting.
    pub image_path: Option<String>,
    /// Number of telemetry channels reported by `THread`.
    pub telemetry_channels: u32,
    /// Telemetry polling interval.
    #[serde(with = "humantime_serde")]
    pub telemetry_interval: Duration,
    /// Free disk space polling interval.
    #[serde(with = "humantime_serde")]
    pub diskfree_interval: Duration,
}

impl Default for PilatusSettings {
    fn default() -> Self {
        Self {
            image_path: None,
            telemetry_channels: 3,
            telemetry_interval: Duration::from_secs(5),
            diskfree_interval: Duration::from_secs(30),
        }
    }
}

/// Factory for detector-server instruments.
pub struct PilatusFactory;

impl DriverFactory for PilatusFactory {
    fn driver_type(&self) -> &'static str {
        "pilatus"
    }

    fn name(&self) -> &'static str {
        "Pilatus detector server"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: PilatusSettings = settings.clone().try_into()?;
        if let Some(path) = &cfg.image_path {
            if !path.starts_with('/') {
                return Err(anyhow!("image_path '{path}' must be absolute"));
            }
        }
        if cfg.telemetry_interval.is_zero() || cfg.diskfree_interval.is_zero() {
            return Err(anyhow!("polling intervals must be greater than zero"));
        }
        Ok(())
    }

    fn build(&self, ctx: InstrumentContext, settings: toml::Value) -> Result<Arc<dyn Instrument>> {
        let cfg: PilatusSettings = settings
            .try_into()
            .context("Invalid Pilatus settings")?;
        Ok(PilatusDriver::new(ctx, cfg)?)
    }
}

// =============================================================================
// Exchanges shared by the driver and its hooks
// =============================================================================

/// Send `line`, wait for the reply to `command`, retrying communication
/// failures. `ERR` replies become [`CoreError::DeviceRejected`].
async fn query(
    conn: &Connection,
    table: &Arc<CommandTable>,
    retry: &RetryPolicy,
    command: &str,
    line: &str,
) -> CoreResult<Reply> {
    let bytes = format!("{line}\n");
    let reply = with_retry(retry, command, |_| {
        conn.execute(bytes.as_bytes(), command, CommandTable::matcher(table, command))
    })
    .await?;
    match reply.status {
        Status::Ok => Ok(reply),
        Status::Err => Err(CoreError::rejected(
            conn.name(),
            format!("{command}: {}", reply.text("error").unwrap_or(&reply.body)),
        )),
    }
}

/// Store every field of `reply` in the cache.
fn publish(cache: &PropertyCache, reply: &Reply) {
    for (field, value) in &reply.fields {
        match (field.as_str(), value) {
            ("channels", Value::List(channels)) => {
                for item in channels {
                    let Some(channel) = item.get("channel").and_then(Value::as_int) else {
                        continue;
                    };
                    for reading in ["temperature", "humidity"] {
                        if let Some(v) = item.get(reading) {
                            cache.store(&format!("{reading}{channel}"), v.clone());
                        }
                    }
                }
            }
            ("error", _) => {}
            // Placeholders for "not reported in this wording"
            ("gain", Value::Text(g)) if g == "unchanged" => {}
            ("threshold", Value::Int(-1)) => {}
            _ => {
                cache.store(field, value.clone());
            }
        }
    }
}

struct CamserverHooks {
    table: Arc<CommandTable>,
    cache: PropertyCache,
    conn: WeakConnection,
    retry: RetryPolicy,
    image_path: Option<String>,
}

#[async_trait]
impl LifecycleHooks<Connection> for CamserverHooks {
    async fn post_connect(&self, conn: &Connection) -> CoreResult<()> {
        let reply = query(conn, &self.table, &self.retry, "version", "version").await?;
        let version = reply.text("version").unwrap_or_default();
        if !version.starts_with("tvx") {
            return Err(CoreError::rejected(
                conn.name(),
                format!("unexpected server identity '{version}'"),
            ));
        }
        tracing::info!(instrument = %conn.name(), %version, "Detector server identified");
        publish(&self.cache, &reply);

        if let Some(path) = &self.image_path {
            let reply = query(conn, &self.table, &self.retry, "imgpath", &format!("imgpath {path}")).await?;
            publish(&self.cache, &reply);
        }
        Ok(())
    }

    async fn pre_disconnect(&self, conn: &Connection) -> CoreResult<()> {
        if conn.status() == ConnectionStatus::Device(EXPOSING.to_string()) {
            tracing::warn!(instrument = %conn.name(), "Disconnecting during an exposure, killing it");
            query(conn, &self.table, &RetryPolicy::none(), "K", "K").await?;
        }
        Ok(())
    }

    fn unsolicited(&self, message: &[u8]) {
        let text = String::from_utf8_lossy(message);
        match self.table.dispatch(&text, None) {
            Ok(Some(reply)) if reply.context == Some(CONTEXT_EXPOSURE_DONE) => {
                match reply.status {
                    Status::Ok => {
                        tracing::info!(image = ?reply.text("lastimage"), "Exposure finished");
                        publish(&self.cache, &reply);
                    }
                    Status::Err => {
                        tracing::warn!(reason = %reply.body, "Exposure ended with an error");
                    }
                }
                if let Some(conn) = self.conn.upgrade() {
                    conn.clear_device_state();
                }
            }
            Ok(Some(reply)) => {
                tracing::debug!(command = %reply.command, "Late reply stored");
                publish(&self.cache, &reply);
            }
            Ok(None) => tracing::debug!(message = %text, "Unrecognised message dropped"),
            Err(e) => tracing::warn!(message = %text, error = %e, "Unparseable message dropped"),
        }
    }
}

// =============================================================================
// PilatusDriver
// =============================================================================

/// Detector-server instrument.
pub struct PilatusDriver {
    conn: Connection,
    table: Arc<CommandTable>,
    retry: RetryPolicy,
}

impl PilatusDriver {
    /// Build a disconnected driver and wire it into its connection.
    pub fn new(ctx: InstrumentContext, settings: PilatusSettings) -> Result<Arc<Self>> {
        let table = Arc::new(camserver::command_table().context("camserver command table")?);
        let retry = ctx.connection.retry.clone();
        let conn = Connection::new(
            ctx.name,
            ctx.connection,
            ctx.connector,
            Framing::detector_server(),
            ctx.marshaler,
        );
        conn.cache().register_all(camserver::properties(
            settings.telemetry_channels,
            settings.telemetry_interval,
            settings.diskfree_interval,
        ));
        conn.set_hooks(Arc::new(CamserverHooks {
            table: table.clone(),
            cache: conn.cache().clone(),
            conn: conn.downgrade(),
            retry: retry.clone(),
            image_path: settings.image_path,
        }));

        let driver = Arc::new(Self { conn, table, retry });
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

    /// Set the exposure time in seconds.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn set_exposure_time(&self, seconds: f64) -> CoreResult<f64> {
        if seconds <= 0.0 {
            return Err(CoreError::InvalidArgument(format!(
                "exposure time must be positive, got {seconds}"
            )));
        }
        let reply = self.command("ExpTime", &format!("ExpTime {seconds}")).await?;
        Ok(reply.float("exptime").unwrap_or(seconds))
    }

    /// Set the exposure period in seconds.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn set_exposure_period(&self, seconds: f64) -> CoreResult<f64> {
        let reply = self.command("ExpPeriod", &format!("ExpPeriod {seconds}")).await?;
        Ok(reply.float("expperiod").unwrap_or(seconds))
    }

    /// Set the number of images per exposure sequence.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn set_image_count(&self, count: u32) -> CoreResult<()> {
        self.command("NImages", &format!("NImages {count}")).await?;
        Ok(())
    }

    /// Set the energy threshold (eV), optionally with a gain setting.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn set_threshold(&self, threshold_ev: u32, gain: Option<&str>) -> CoreResult<()> {
        let line = match gain {
            Some(g) if !GAINS.contains(&g) => {
                return Err(CoreError::InvalidArgument(format!(
                    "unknown gain '{g}', expected one of {GAINS:?}"
                )))
            }
            Some(g) => format!("SetThreshold {g} {threshold_ev}"),
            None => format!("SetThreshold {threshold_ev}"),
        };
        self.command("SetThreshold", &line).await?;
        // The acknowledgement does not always echo the new settings
        self.conn.cache().invalidate("threshold");
        self.conn.cache().invalidate("gain");
        Ok(())
    }

    /// Select the image directory.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn set_image_path(&self, path: &str) -> CoreResult<()> {
        self.command("imgpath", &format!("imgpath {path}")).await?;
        Ok(())
    }

    /// Start an exposure writing `filename`. Returns once the server has
    /// accepted it; completion is reported through the `lastimage` property.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn expose(&self, filename: &str) -> CoreResult<()> {
        if matches!(self.conn.status(), ConnectionStatus::Device(_)) {
            return Err(CoreError::rejected(self.conn.name(), "an exposure is already running"));
        }
        let line = format!("Exposure {filename}\n");
        let mut session = self.conn.session().await?;
        // Completion may arrive right behind the acknowledgement
        self.conn.set_device_state(EXPOSING);
        let reply = session
            .execute(
                line.as_bytes(),
                "Exposure",
                CommandTable::matcher(&self.table, "Exposure"),
            )
            .await
            .and_then(|reply| match reply.status {
                Status::Ok => Ok(reply),
                Status::Err => Err(CoreError::rejected(
                    self.conn.name(),
                    format!("Exposure: {}", reply.text("error").unwrap_or(&reply.body)),
                )),
            });
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.conn.clear_device_state();
                return Err(e);
            }
        };
        drop(session);
        publish(self.conn.cache(), &reply);
        tracing::info!(filename, "Exposure started");
        Ok(())
    }

    /// Abort the running exposure.
    #[instrument(skip(self), fields(instrument = %self.conn.name()))]
    pub async fn kill(&self) -> CoreResult<()> {
        query(&self.conn, &self.table, &RetryPolicy::none(), "K", "K").await?;
        Ok(())
    }

    /// Whether an exposure is running.
    pub fn is_exposing(&self) -> bool {
        self.conn.status() == ConnectionStatus::Device(EXPOSING.to_string())
    }
}

#[async_trait]
impl Refresh for PilatusDriver {
    async fn refresh(&self, name: &str) -> CoreResult<Value> {
        let command = camserver::refresh_command(name).ok_or_else(|| {
            CoreError::InvalidArgument(format!("'{name}' is not queried from the detector"))
        })?;
        self.command(command, command).await?;
        self.conn
            .cache()
            .peek(name)
            .and_then(|r| r.value)
            .ok_or_else(|| {
                CoreError::rejected(self.conn.name(), format!("{command} did not report '{name}'"))
            })
    }
}

#[async_trait]
impl Instrument for PilatusDriver {
    fn name(&self) -> &str {
        self.conn.name()
    }

    fn kind(&self) -> &'static str {
        "pilatus"
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
            "exptime" => self
                .set_exposure_time(value.as_f64().ok_or_else(invalid)?)
                .await
                .map(|_| ()),
            "expperiod" => self
                .set_exposure_period(value.as_f64().ok_or_else(invalid)?)
                .await
                .map(|_| ()),
            "nimages" => {
                let count = value.as_int().and_then(|v| u32::try_from(v).ok()).ok_or_else(invalid)?;
                self.set_image_count(count).await
            }
            "threshold" => {
                let ev = value.as_int().and_then(|v| u32::try_from(v).ok()).ok_or_else(invalid)?;
                self.set_threshold(ev, None).await
            }
            "imgpath" => self.set_image_path(value.as_str().ok_or_else(invalid)?).await,
            _ => Err(CoreError::InvalidArgument(format!(
                "'{}' has no writable property '{name}'",
                self.conn.name()
            ))),
        }
    }
}
