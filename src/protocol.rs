//! SunSpec inverter register map and pure decode helpers.
//!
//! The monitor only interprets a fixed contiguous window of the inverter's
//! holding registers, starting at [`INVERTER_WINDOW_START`] and spanning
//! [`INVERTER_WINDOW_QUANTITY`] registers. All register addresses below are
//! absolute device addresses; [`RegisterWindow`] translates them to indexes
//! into the raw block returned by one Modbus read.
//!
//! Everything in this module is pure and free of I/O; the `tokio` client
//! builds on top of it.

use std::fmt;

/// Errors for window construction and register decoding.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A register address was requested that the fixed window does not cover.
    ///
    /// The window is sized to cover every address the monitor uses, so this
    /// indicates a broken register map, not a runtime fault.
    #[error("register address {address} outside window starting at {start} spanning {quantity} registers")]
    AddressOutOfWindow {
        address: u16,
        start: u16,
        quantity: u16,
    },

    /// The device returned a different number of registers than requested.
    #[error("short register window: expected {expected} registers, got {actual}")]
    WindowSizeMismatch { expected: u16, actual: usize },
}

/// First register of the inverter window.
pub const INVERTER_WINDOW_START: u16 = 40071;
/// Number of registers in the inverter window.
pub const INVERTER_WINDOW_QUANTITY: u16 = 38;

pub const AC_CURRENT_REG_ADDR: u16 = 40071;
pub const AC_CURRENT_SF_REG_ADDR: u16 = 40075;
pub const AC_VOLTAGE_REG_ADDR: u16 = 40076;
pub const AC_VOLTAGE_SF_REG_ADDR: u16 = 40082;
pub const AC_POWER_REG_ADDR: u16 = 40083;
pub const AC_POWER_SF_REG_ADDR: u16 = 40084;

pub const DC_CURRENT_REG_ADDR: u16 = 40096;
pub const DC_CURRENT_SF_REG_ADDR: u16 = 40097;
pub const DC_VOLTAGE_REG_ADDR: u16 = 40098;
pub const DC_VOLTAGE_SF_REG_ADDR: u16 = 40099;
pub const DC_POWER_REG_ADDR: u16 = 40100;
pub const DC_POWER_SF_REG_ADDR: u16 = 40101;

/// Heat sink temperature, in hundredths of a degree Celsius.
pub const HEAT_SINK_TEMPERATURE_REG_ADDR: u16 = 40103;
/// Inverter operating state, see [`OperatingState`].
pub const OPERATING_STATE_REG_ADDR: u16 = 40107;

/// Bias applied to scale factor registers.
///
/// The device stores signed decimal exponents in unsigned 16-bit registers,
/// offset by 65536; e.g. an exponent of -1 is stored as 65535.
pub const SCALE_FACTOR_BIAS: f64 = 65536.0;

/// Decodes a (value, scale factor) register pair into a physical quantity.
///
/// Returns `value * 10^(scale_factor - 65536)`. The scale factor register
/// must come from the same window snapshot as the value register.
pub fn scale_factor_decode(value: u16, scale_factor: u16) -> f64 {
    f64::from(value) * 10f64.powf(f64::from(scale_factor) - SCALE_FACTOR_BIAS)
}

/// Fixed divisor for the heat sink temperature register.
pub const HEAT_SINK_TEMPERATURE_DIVISOR: f64 = 100.0;

pub fn heat_sink_temperature_decode(value: u16) -> f64 {
    f64::from(value) / HEAT_SINK_TEMPERATURE_DIVISOR
}

/// Inverter operating state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingState {
    Off,
    Sleeping,
    Starting,
    /// Tracking the maximum power point, normal production.
    Mppt,
    /// Producing, but output is clipped by the device.
    Throttled,
    ShuttingDown,
    Fault,
    Standby,
    /// Any code outside the documented 1..=8 range.
    Unknown(u16),
}

impl OperatingState {
    pub fn decode(value: u16) -> Self {
        match value {
            1 => OperatingState::Off,
            2 => OperatingState::Sleeping,
            3 => OperatingState::Starting,
            4 => OperatingState::Mppt,
            5 => OperatingState::Throttled,
            6 => OperatingState::ShuttingDown,
            7 => OperatingState::Fault,
            8 => OperatingState::Standby,
            other => OperatingState::Unknown(other),
        }
    }

    /// True while the inverter actually produces power (MPPT or throttled).
    pub fn is_producing(&self) -> bool {
        matches!(self, OperatingState::Mppt | OperatingState::Throttled)
    }
}

impl fmt::Display for OperatingState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OperatingState::Off => write!(f, "off"),
            OperatingState::Sleeping => write!(f, "sleeping"),
            OperatingState::Starting => write!(f, "starting"),
            OperatingState::Mppt => write!(f, "producing (MPPT)"),
            OperatingState::Throttled => write!(f, "producing (throttled)"),
            OperatingState::ShuttingDown => write!(f, "shutting down"),
            OperatingState::Fault => write!(f, "fault"),
            OperatingState::Standby => write!(f, "standby"),
            OperatingState::Unknown(code) => write!(f, "unknown ({code})"),
        }
    }
}

/// Immutable snapshot of one successful register block read.
///
/// Registers are addressed by their absolute device address; the window
/// translates to `address - start` internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWindow {
    start: u16,
    registers: Vec<u16>,
}

impl RegisterWindow {
    /// Wraps a raw register block starting at `start`.
    pub fn new(start: u16, registers: Vec<u16>) -> Self {
        Self { start, registers }
    }

    /// Wraps the inverter window, validating the block length.
    pub fn inverter(registers: Vec<u16>) -> Result<Self, Error> {
        if registers.len() != usize::from(INVERTER_WINDOW_QUANTITY) {
            return Err(Error::WindowSizeMismatch {
                expected: INVERTER_WINDOW_QUANTITY,
                actual: registers.len(),
            });
        }
        Ok(Self::new(INVERTER_WINDOW_START, registers))
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Returns the raw register at the given absolute address.
    pub fn register(&self, address: u16) -> Result<u16, Error> {
        let index = address.checked_sub(self.start).map(usize::from);
        match index.and_then(|index| self.registers.get(index)) {
            Some(value) => Ok(*value),
            None => Err(Error::AddressOutOfWindow {
                address,
                start: self.start,
                quantity: self.registers.len() as u16,
            }),
        }
    }

    /// Decodes a (value, scale factor) register pair from this window.
    pub fn scaled(&self, value_address: u16, scale_factor_address: u16) -> Result<f64, Error> {
        let value = self.register(value_address)?;
        let scale_factor = self.register(scale_factor_address)?;
        Ok(scale_factor_decode(value, scale_factor))
    }
}
