//! Wire protocols spoken by the instrument families.
//!
//! - [`line`]: context-tagged ASCII command/reply dispatch (detector server,
//!   plain ASCII instruments)
//! - [`frame`]: 9-byte checksummed binary frames (stepper-motor controllers)
//! - [`register`]: register/coil bus client (X-ray generator)

pub mod frame;
pub mod line;
pub mod register;
