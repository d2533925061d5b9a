//! Area-detector server driver.
//!
//! The detector's acquisition server speaks a line protocol over TCP:
//! commands are newline-terminated ASCII, replies are `0x18`-delimited and
//! carry a `<context> <OK|ERR>` envelope. Exposure completion arrives
//! asynchronously on context 7 and is handled as an unsolicited message.
//!
//! # Usage
//!
//! ```rust,ignore
//! use saxs_core::DriverRegistry;
//! use saxs_driver_pilatus::PilatusFactory;
//!
//! registry.register_factory(Arc::new(PilatusFactory));
//! ```

pub mod camserver;
pub mod driver;

pub use driver::{PilatusDriver, PilatusFactory, PilatusSettings};
