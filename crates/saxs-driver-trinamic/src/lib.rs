//! Stepper-motor controller driver speaking TMCL over TCP.
//!
//! - [`tmcl`]: instruction exchange with retries, axis parameter numbers.
//! - [`motion`]: FIFO queue that lets one axis move at a time.
//! - [`driver`]: the instrument, its per-axis properties and soft limits.

pub mod driver;
pub mod motion;
pub mod tmcl;

pub use driver::{AxisSettings, TrinamicDriver, TrinamicFactory, TrinamicSettings};
pub use motion::{Motion, MotionControl, MotionQueue, MotionTicket, TargetCheck};
pub use tmcl::Tmcl;
