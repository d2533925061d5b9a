//! Motor controller instrument: axes, soft limits and queued motion.
//!
//! Axes are declared in the instrument's `settings` table. Their index in
//! the list is the controller's motor number:
//!
//! ```toml
//! [instruments.settings]
//! module_address = 1
//! poll_interval = "50ms"
//!
//! [[instruments.settings.axes]]
//! name = "beamstop_x"
//! min_position = -20000
//! max_position = 20000
//!
//! [[instruments.settings.axes]]
//! name = "beamstop_y"
//! ```

use crate::motion::{Motion, MotionQueue, MotionTicket};
use crate::tmcl::{param, Tmcl};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use saxs_core::protocol::frame::FRAME_LEN;
use saxs_core::{
    Category, Connection, ConnectionStatus, CoreError, CoreResult, DriverFactory, Framing,
    Instrument, InstrumentContext, LifecycleHooks, Notifier, PropertyCache, PropertySpec, Refresh,
    RetryPolicy, Value, ValueKind,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::instrument;

/// Per-axis settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisSettings {
    /// Property prefix, e.g. `beamstop_x`.
    pub name: String,
    /// Lowest allowed target position (microsteps).
    #[serde(default)]
    pub min_position: Option<i32>,
    /// Highest allowed target position (microsteps).
    #[serde(default)]
    pub max_position: Option<i32>,
    /// Maximum positioning speed written after connecting.
    #[serde(default)]
    pub max_speed: Option<i32>,
}

impl AxisSettings {
    /// Check `target` against the soft limits.
    pub fn check(&self, target: i64) -> CoreResult<i32> {
        let below = self.min_position.is_some_and(|min| target < i64::from(min));
        let above = self.max_position.is_some_and(|max| target > i64::from(max));
        if below || above {
            return Err(CoreError::InvalidArgument(format!(
                "{} target {target} outside soft limits [{}, {}]",
                self.name,
                self.min_position.map_or("-inf".to_string(), |v| v.to_string()),
                self.max_position.map_or("+inf".to_string(), |v| v.to_string()),
            )));
        }
        i32::try_from(target).map_err(|_| {
            CoreError::InvalidArgument(format!("{} target {target} out of range", self.name))
        })
    }
}

/// Driver settings from the instrument's `settings` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrinamicSettings {
    /// Controller module address.
    pub module_address: u8,
    /// Axes in motor-number order.
    pub axes: Vec<AxisSettings>,
    /// How often a running motion is polled for completion.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Longest a single motion may take before the axis is stopped.
    #[serde(with = "humantime_serde")]
    pub motion_timeout: Duration,
    /// Position and limit-switch polling interval.
    #[serde(with = "humantime_serde")]
    pub position_interval: Duration,
}

impl Default for TrinamicSettings {
    fn default() -> Self {
        Self {
            module_address: 1,
            axes: Vec::new(),
            poll_interval: Duration::from_millis(100),
            motion_timeout: Duration::from_secs(120),
            position_interval: Duration::from_secs(1),
        }
    }
}

impl TrinamicSettings {
    fn check(&self) -> Result<()> {
        if self.axes.is_empty() {
            return Err(anyhow!("at least one axis must be configured"));
        }
        let mut seen = HashSet::new();
        for axis in &self.axes {
            if !seen.insert(axis.name.as_str()) {
                return Err(anyhow!("duplicate axis name '{}'", axis.name));
            }
            if let (Some(min), Some(max)) = (axis.min_position, axis.max_position) {
                if min > max {
                    return Err(anyhow!(
                        "axis '{}': min_position {min} > max_position {max}",
                        axis.name
                    ));
                }
            }
        }
        if self.motion_timeout <= self.poll_interval {
            return Err(anyhow!("motion_timeout must exceed poll_interval"));
        }
        Ok(())
    }
}

/// Factory for motor controllers.
pub struct TrinamicFactory;

impl DriverFactory for TrinamicFactory {
    fn driver_type(&self) -> &'static str {
        "trinamic"
    }

    fn name(&self) -> &'static str {
        "TMCL stepper motor controller"
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: TrinamicSettings = settings.clone().try_into()?;
        cfg.check()
    }

    fn build(&self, ctx: InstrumentContext, settings: toml::Value) -> Result<Arc<dyn Instrument>> {
        let cfg: TrinamicSettings = settings
            .try_into()
            .context("Invalid TMCL controller settings")?;
        cfg.check()?;
        Ok(TrinamicDriver::new(ctx, cfg))
    }
}

// =============================================================================
// Properties
// =============================================================================

/// Suffixes of the per-axis properties and the parameter each one reads.
const AXIS_PROPERTIES: &[(&str, u8, ValueKind)] = &[
    ("position", param::ACTUAL_POSITION, ValueKind::Int),
    ("target", param::TARGET_POSITION, ValueKind::Int),
    ("speed", param::ACTUAL_SPEED, ValueKind::Int),
    ("left_limit", param::LEFT_LIMIT, ValueKind::Bool),
    ("right_limit", param::RIGHT_LIMIT, ValueKind::Bool),
];

fn properties(axes: &[AxisSettings], interval: Duration) -> Vec<PropertySpec> {
    let mut specs = vec![PropertySpec::new("firmware", ValueKind::Text)];
    for axis in axes {
        for (suffix, _, kind) in AXIS_PROPERTIES {
            let spec = PropertySpec::new(format!("{}.{suffix}", axis.name), *kind);
            specs.push(match *suffix {
                "position" => spec.refresh_every(interval),
                "left_limit" | "right_limit" => spec.refresh_every(interval).categorize_with(|v| {
                    if v.as_bool().unwrap_or(false) {
                        Category::Warning
                    } else {
                        Category::Ok
                    }
                }),
                _ => spec,
            });
        }
    }
    specs
}

// =============================================================================
// Hooks
// =============================================================================

struct ControllerHooks {
    module: u8,
    retry: RetryPolicy,
    axes: Vec<AxisSettings>,
    cache: PropertyCache,
    queue: Weak<MotionQueue>,
}

#[async_trait]
impl LifecycleHooks<Connection> for ControllerHooks {
    async fn post_connect(&self, conn: &Connection) -> CoreResult<()> {
        let tmcl = Tmcl::new(conn.clone(), self.module, self.retry.clone());
        let firmware = tmcl.firmware().await?;
        tracing::info!(instrument = %conn.name(), %firmware, "Controller identified");
        self.cache.store("firmware", Value::Text(firmware));
        for (motor, axis) in (0u8..).zip(&self.axes) {
            if let Some(speed) = axis.max_speed {
                tmcl.set_axis_parameter(motor, param::MAX_SPEED, speed).await?;
            }
        }
        Ok(())
    }

    async fn pre_disconnect(&self, conn: &Connection) -> CoreResult<()> {
        let Some(queue) = self.queue.upgrade() else {
            return Ok(());
        };
        let cancelled = queue.cancel_all();
        if cancelled > 0 {
            tracing::warn!(instrument = %conn.name(), cancelled, "Queued motions cancelled");
        }
        if let Some((motor, motion)) = queue.moving() {
            tracing::warn!(instrument = %conn.name(), motor, %motion, "Stopping axis before disconnect");
            Tmcl::new(conn.clone(), self.module, RetryPolicy::none())
                .stop(motor)
                .await?;
        }
        Ok(())
    }
}

// =============================================================================
// TrinamicDriver
// =============================================================================

/// Motor controller instrument.
pub struct TrinamicDriver {
    tmcl: Tmcl,
    axes: Vec<AxisSettings>,
    queue: Arc<MotionQueue>,
}

impl TrinamicDriver {
    /// Build a disconnected driver. Spawns the motion supervisor, so it must
    /// be called inside a Tokio runtime.
    pub fn new(ctx: InstrumentContext, settings: TrinamicSettings) -> Arc<Self> {
        let retry = ctx.connection.retry.clone();
        let conn = Connection::new(
            ctx.name,
            ctx.connection,
            ctx.connector,
            Framing::fixed(FRAME_LEN),
            ctx.marshaler,
        );
        let tmcl = Tmcl::new(conn.clone(), settings.module_address, retry.clone());
        let queue = Arc::new(MotionQueue::spawn(
            Arc::new(tmcl.clone()),
            settings.poll_interval,
            settings.motion_timeout,
        ));

        conn.cache()
            .register_all(properties(&settings.axes, settings.position_interval));
        conn.set_hooks(Arc::new(ControllerHooks {
            module: settings.module_address,
            retry,
            axes: settings.axes.clone(),
            cache: conn.cache().clone(),
            queue: Arc::downgrade(&queue),
        }));

        let driver = Arc::new(Self {
            tmcl,
            axes: settings.axes,
            queue,
        });
        driver.tmcl.connection().cache().bind(&driver);
        driver
    }

    fn conn(&self) -> &Connection {
        self.tmcl.connection()
    }

    fn axis(&self, name: &str) -> CoreResult<(u8, &AxisSettings)> {
        (0u8..)
            .zip(&self.axes)
            .find(|(_, axis)| axis.name == name)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown axis '{name}'")))
    }

    /// Instruction-level client.
    pub fn tmcl(&self) -> &Tmcl {
        &self.tmcl
    }

    /// The motion queue.
    pub fn queue(&self) -> &MotionQueue {
        &self.queue
    }

    /// Name of the axis currently moving.
    pub fn moving(&self) -> Option<&str> {
        let (motor, _) = self.queue.moving()?;
        self.axes.get(usize::from(motor)).map(|a| a.name.as_str())
    }

    /// Queue a move of `axis` to `position`.
    #[instrument(skip(self), fields(instrument = %self.conn().name()))]
    pub fn move_to(&self, axis: &str, position: i64) -> CoreResult<MotionTicket> {
        let (motor, settings) = self.axis(axis)?;
        let target = settings.check(position)?;
        self.require_connected()?;
        Ok(self.queue.submit(motor, Motion::Absolute(target)))
    }

    /// Queue a move of `axis` by `distance`.
    ///
    /// A move that would leave the soft limits from the current position is
    /// refused here. The move is resolved again when it starts, from the
    /// position the axis reached after the moves queued ahead of it, and
    /// fails with `InvalidArgument` without moving if that target is out of
    /// limits.
    #[instrument(skip(self), fields(instrument = %self.conn().name()))]
    pub async fn move_by(&self, axis: &str, distance: i32) -> CoreResult<MotionTicket> {
        let (motor, settings) = self.axis(axis)?;
        let current = self.position(axis).await?;
        settings.check(i64::from(current) + i64::from(distance))?;
        let limits = settings.clone();
        Ok(self.queue.submit_checked(
            motor,
            Motion::Relative(distance),
            Box::new(move |target| limits.check(target)),
        ))
    }

    /// Queue a continuous rotation; the sign of `velocity` selects the
    /// direction. Runs until [`TrinamicDriver::stop`].
    pub fn rotate(&self, axis: &str, velocity: i32) -> CoreResult<MotionTicket> {
        let (motor, _) = self.axis(axis)?;
        self.require_connected()?;
        let motion = if velocity >= 0 {
            Motion::RotateRight(velocity)
        } else {
            Motion::RotateLeft(velocity.saturating_neg())
        };
        Ok(self.queue.submit(motor, motion))
    }

    /// Stop `axis` now and drop its queued motions.
    #[instrument(skip(self), fields(instrument = %self.conn().name()))]
    pub async fn stop(&self, axis: &str) -> CoreResult<()> {
        let (motor, _) = self.axis(axis)?;
        let cancelled = self.queue.cancel_axis(motor);
        if cancelled > 0 {
            tracing::info!(axis, cancelled, "Queued motions dropped");
        }
        self.tmcl.stop(motor).await
    }

    /// Read the actual position of `axis` and update the cache.
    pub async fn position(&self, axis: &str) -> CoreResult<i32> {
        let (motor, _) = self.axis(axis)?;
        let position = self
            .tmcl
            .axis_parameter(motor, param::ACTUAL_POSITION)
            .await?;
        self.conn()
            .cache()
            .store(&format!("{axis}.position"), Value::Int(i64::from(position)));
        Ok(position)
    }

    /// Write an axis parameter.
    pub async fn set_parameter(&self, axis: &str, parameter: u8, value: i32) -> CoreResult<()> {
        let (motor, _) = self.axis(axis)?;
        self.tmcl.set_axis_parameter(motor, parameter, value).await
    }

    fn require_connected(&self) -> CoreResult<()> {
        if self.conn().is_connected() {
            Ok(())
        } else {
            Err(saxs_core::ConnectionError::NotConnected {
                instrument: self.conn().name().to_string(),
            }
            .into())
        }
    }
}

#[async_trait]
impl Refresh for TrinamicDriver {
    async fn refresh(&self, name: &str) -> CoreResult<Value> {
        if name == "firmware" {
            return self.tmcl.firmware().await.map(Value::Text);
        }
        let (axis, suffix) = name
            .rsplit_once('.')
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown property '{name}'")))?;
        let (motor, _) = self.axis(axis)?;
        let (_, parameter, kind) = AXIS_PROPERTIES
            .iter()
            .find(|(s, _, _)| *s == suffix)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown property '{name}'")))?;
        let raw = self.tmcl.axis_parameter(motor, *parameter).await?;
        Ok(match kind {
            ValueKind::Bool => Value::Bool(raw != 0),
            _ => Value::Int(i64::from(raw)),
        })
    }
}

#[async_trait]
impl Instrument for TrinamicDriver {
    fn name(&self) -> &str {
        self.conn().name()
    }

    fn kind(&self) -> &'static str {
        "trinamic"
    }

    fn status(&self) -> ConnectionStatus {
        self.conn().status()
    }

    fn notifier(&self) -> &Notifier {
        self.conn().notifier()
    }

    fn cache(&self) -> &PropertyCache {
        self.conn().cache()
    }

    async fn connect(&self) -> CoreResult<()> {
        self.conn().connect().await
    }

    async fn disconnect(&self, clean: bool) -> CoreResult<()> {
        self.conn().disconnect(clean).await
    }

    /// Writing `<axis>.target` queues a move without waiting for it.
    async fn set(&self, name: &str, value: Value) -> CoreResult<()> {
        match name.rsplit_once('.') {
            Some((axis, "target")) => {
                let position = value.as_int().ok_or_else(|| {
                    CoreError::InvalidArgument(format!("bad value {value} for '{name}'"))
                })?;
                self.move_to(axis, position).map(drop)
            }
            _ => Err(CoreError::InvalidArgument(format!(
                "'{}' has no writable property '{name}'",
                self.conn().name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(min: Option<i32>, max: Option<i32>) -> AxisSettings {
        AxisSettings {
            name: "x".into(),
            min_position: min,
            max_position: max,
            max_speed: None,
        }
    }

    #[test]
    fn test_soft_limits() {
        let limited = axis(Some(-100), Some(100));
        assert_eq!(limited.check(100).unwrap(), 100);
        assert!(limited.check(101).is_err());
        assert!(limited.check(-101).is_err());
        assert!(axis(None, None).check(i64::from(i32::MAX) + 1).is_err());
        assert_eq!(axis(None, Some(0)).check(-5000).unwrap(), -5000);
    }

    #[test]
    fn test_settings_validation() {
        let factory = TrinamicFactory;
        let ok: toml::Value = toml::from_str(
            r#"
            poll_interval = "20ms"
            [[axes]]
            name = "x"
            min_position = -10
            max_position = 10
            [[axes]]
            name = "y"
            "#,
        )
        .unwrap();
        factory.validate(&ok).unwrap();

        let none: toml::Value = toml::from_str("module_address = 2").unwrap();
        assert!(factory.validate(&none).is_err());

        let duplicate: toml::Value =
            toml::from_str("[[axes]]\nname = \"x\"\n[[axes]]\nname = \"x\"").unwrap();
        assert!(factory.validate(&duplicate).is_err());

        let inverted: toml::Value =
            toml::from_str("[[axes]]\nname = \"x\"\nmin_position = 5\nmax_position = 1").unwrap();
        assert!(factory.validate(&inverted).is_err());
    }

    #[test]
    fn test_axis_properties() {
        let specs = properties(&[axis(None, None)], Duration::from_secs(1));
        let names: Vec<&str> = specs.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec!["firmware", "x.position", "x.target", "x.speed", "x.left_limit", "x.right_limit"]
        );
        let limit = specs.iter().find(|s| s.name() == "x.left_limit").unwrap();
        assert_eq!(limit.categorize(&Value::Bool(true)), Category::Warning);
    }
}
