//! Generator register map and state decoding.
//!
//! Analog readings are input registers scaled by 1/100. Status is a block of
//! 16 coils read in one transaction; commands are pulsed coils.
//!
//! | Address         | Content                                  |
//! |-----------------|------------------------------------------|
//! | IR 50           | high tension, 0.01 kV                    |
//! | IR 51           | tube current, 0.01 mA                    |
//! | IR 54           | tube temperature, 0.01 °C                |
//! | IR 55           | accumulated tube time, hours             |
//! | coils 210..226  | status flags, see [`STATUS_FLAGS`]       |
//! | coils 250..259  | commands, see [`command`]                |

use saxs_core::protocol::register::{decode_flags, RegisterAddress};
use saxs_core::Category;
use serde::Serialize;
use std::fmt;

/// High tension register.
pub const HT: RegisterAddress = RegisterAddress::input_register(50);
/// Tube current register.
pub const CURRENT: RegisterAddress = RegisterAddress::input_register(51);
/// Tube temperature register.
pub const TUBE_TEMPERATURE: RegisterAddress = RegisterAddress::input_register(54);
/// Tube time register.
pub const TUBE_TIME: RegisterAddress = RegisterAddress::input_register(55);

/// First status coil.
pub const STATUS_START: u16 = 210;

/// Status coil names, in bit order from [`STATUS_START`].
pub const STATUS_FLAGS: &[&str] = &[
    "remote_mode",
    "xrays_on",
    "shutter_open",
    "shutter_closed",
    "interlock_ok",
    "interlock_overridden",
    "vacuum_ok",
    "water_flow_ok",
    "tube_temperature_ok",
    "distributor_ok",
    "tube_power_ok",
    "warming_up",
    "ramping_up",
    "powering_down",
    "going_standby",
    "fault",
];

/// Command coils. Writing `true` triggers the action.
pub mod command {
    /// Open the shutter.
    pub const SHUTTER_OPEN: u16 = 250;
    /// Close the shutter.
    pub const SHUTTER_CLOSE: u16 = 251;
    /// Switch X-rays on.
    pub const XRAYS_ON: u16 = 252;
    /// Switch X-rays off.
    pub const XRAYS_OFF: u16 = 253;
    /// Ramp to full power.
    pub const FULL_POWER: u16 = 254;
    /// Ramp to standby power.
    pub const STANDBY: u16 = 255;
    /// Ramp down to zero power.
    pub const POWER_DOWN: u16 = 256;
    /// Start the tube warm-up cycle.
    pub const WARM_UP: u16 = 257;
    /// Acknowledge and reset faults.
    pub const RESET_FAULTS: u16 = 258;
}

/// Convert a raw register to engineering units.
pub fn scaled(raw: u16) -> f64 {
    f64::from(raw) / 100.0
}

/// Decoded status coils.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFlags {
    flags: Vec<(&'static str, bool)>,
}

impl StatusFlags {
    /// Pair `bits` with [`STATUS_FLAGS`].
    pub fn decode(bits: &[bool]) -> Self {
        Self {
            flags: decode_flags(bits, STATUS_FLAGS),
        }
    }

    /// State of `name`; unknown names read as false.
    pub fn get(&self, name: &str) -> bool {
        self.flags.iter().any(|(n, v)| *n == name && *v)
    }

    /// All flags in bit order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        self.flags.iter().copied()
    }
}

/// Readings below these count as zero.
const HT_ZERO_KV: f64 = 0.5;
const CURRENT_ZERO_MA: f64 = 0.01;

/// What the generator is doing, derived from status flags and analog readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GeneratorState {
    /// X-rays on, power stable.
    Idle,
    /// Ramping towards a higher power level.
    RampingUp,
    /// Ramping down towards zero power.
    PoweringDown,
    /// Ramping towards standby power.
    GoingStandby,
    /// Tube warm-up cycle running.
    WarmingUp,
    /// High tension off.
    XRaysOff,
}

impl GeneratorState {
    /// Derive the state. A power-down that has reached zero on both analog
    /// readings counts as X-rays off even while the controller still
    /// reports the ramp bit.
    pub fn derive(flags: &StatusFlags, ht_kv: f64, current_ma: f64) -> Self {
        let at_zero = ht_kv < HT_ZERO_KV && current_ma < CURRENT_ZERO_MA;
        if !flags.get("xrays_on") {
            GeneratorState::XRaysOff
        } else if flags.get("warming_up") {
            GeneratorState::WarmingUp
        } else if flags.get("powering_down") {
            if at_zero {
                GeneratorState::XRaysOff
            } else {
                GeneratorState::PoweringDown
            }
        } else if flags.get("going_standby") {
            GeneratorState::GoingStandby
        } else if flags.get("ramping_up") {
            GeneratorState::RampingUp
        } else {
            GeneratorState::Idle
        }
    }
}

impl fmt::Display for GeneratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GeneratorState::Idle => "Idle",
            GeneratorState::RampingUp => "Ramping up",
            GeneratorState::PoweringDown => "Powering down",
            GeneratorState::GoingStandby => "Going to standby",
            GeneratorState::WarmingUp => "Warming up",
            GeneratorState::XRaysOff => "X-rays off",
        };
        f.write_str(text)
    }
}

/// Health category of a status flag.
pub fn flag_category(name: &str, set: bool) -> Category {
    match name {
        "interlock_ok" | "water_flow_ok" | "tube_temperature_ok" | "distributor_ok"
        | "tube_power_ok" => Category::fault(!set),
        "vacuum_ok" if !set => Category::Warning,
        "interlock_overridden" if set => Category::Warning,
        "fault" => Category::fault(set),
        _ => Category::default_for(&saxs_core::Value::Bool(set)),
    }
}
