//! Simple line-oriented ASCII instruments.
//!
//! Both devices answer every command with a single CR-terminated line that
//! carries neither a context tag nor a status token, so their command tables
//! use the plain envelope and recognise refusals by pattern.
//!
//! - **`tpg201`**: single-channel vacuum gauge controller.
//! - **`haake`**: bath circulator with temperature setpoint control.

mod plain;
pub mod haake;
pub mod tpg201;

pub use haake::{CirculatorDriver, CirculatorFactory, CirculatorSettings};
pub use tpg201::{GaugeDriver, GaugeFactory, GaugeSettings};
