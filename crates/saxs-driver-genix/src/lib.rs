//! X-ray generator driver on the register bus.
//!
//! - [`registers`]: register map, status flag table and derived state.
//! - [`driver`]: the instrument, coil commands and polled properties.

pub mod driver;
pub mod registers;

pub use driver::{GenixDriver, GenixFactory, GenixSettings};
pub use registers::GeneratorState;
