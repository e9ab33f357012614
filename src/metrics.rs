//! Derived metrics: per-channel energy accounting on top of decoded registers.
//!
//! One [`MetricsEngine`] is fed the register window of every successful poll
//! and turns it into [`MetricsEvent`]s for the sink fan-out. Energy-bearing
//! channels (AC and DC) keep an [`EnergyAccumulator`] that integrates power
//! over poll ticks and is zeroed on day rollover or an explicit reset; the
//! state channel only reports the heat sink temperature.
//!
//! The engine is owned by the poll task; ticks and marshaled reset commands
//! are serialized on that task, so nothing here needs a lock.

use crate::protocol::{self as proto, OperatingState, RegisterWindow};
use chrono::{DateTime, TimeZone, Timelike, Utc};
use std::fmt;
use std::time::Duration;

/// 2001-01-01T00:00:00Z as Unix seconds. Reset timestamps are exposed as
/// seconds since this epoch, a convention of the downstream consumers.
pub const ENERGY_RESET_EPOCH_UNIX: i64 = 978_307_200;

/// The kind of a registered channel, fixed at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub enum ChannelKind {
    /// Temperature-only channel, no energy accounting.
    #[cfg_attr(feature = "serde", serde(rename = "state"))]
    State,
    #[cfg_attr(feature = "serde", serde(rename = "AC"))]
    Ac,
    #[cfg_attr(feature = "serde", serde(rename = "DC"))]
    Dc,
}

impl ChannelKind {
    /// Label used in sink topics, e.g. `ACPower`.
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::State => "state",
            ChannelKind::Ac => "AC",
            ChannelKind::Dc => "DC",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One channel declaration from the configuration surface.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKind,
}

/// The (value, scale factor) register pairs of an energy-bearing channel.
struct ProductionRegisters {
    power: u16,
    power_sf: u16,
    voltage: u16,
    voltage_sf: u16,
    current: u16,
    current_sf: u16,
}

const AC_REGISTERS: ProductionRegisters = ProductionRegisters {
    power: proto::AC_POWER_REG_ADDR,
    power_sf: proto::AC_POWER_SF_REG_ADDR,
    voltage: proto::AC_VOLTAGE_REG_ADDR,
    voltage_sf: proto::AC_VOLTAGE_SF_REG_ADDR,
    current: proto::AC_CURRENT_REG_ADDR,
    current_sf: proto::AC_CURRENT_SF_REG_ADDR,
};

const DC_REGISTERS: ProductionRegisters = ProductionRegisters {
    power: proto::DC_POWER_REG_ADDR,
    power_sf: proto::DC_POWER_SF_REG_ADDR,
    voltage: proto::DC_VOLTAGE_REG_ADDR,
    voltage_sf: proto::DC_VOLTAGE_SF_REG_ADDR,
    current: proto::DC_CURRENT_REG_ADDR,
    current_sf: proto::DC_CURRENT_SF_REG_ADDR,
};

/// Running kWh total of one energy-bearing channel.
///
/// Not persisted: a process restart starts from zero.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyAccumulator {
    kwh: f64,
    reset_at: DateTime<Utc>,
}

impl EnergyAccumulator {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { kwh: 0.0, reset_at: now }
    }

    /// Adds the energy produced at `power_w` over one poll interval,
    /// i.e. power times the interval expressed as a fraction of an hour.
    pub fn add(&mut self, power_w: f64, interval: Duration) {
        self.kwh += power_w * interval.as_millis() as f64 / 3_600_000_000.0;
    }

    /// Zeroes the accumulator and returns the pre-reset total.
    pub fn reset(&mut self, now: DateTime<Utc>) -> f64 {
        let total = self.kwh;
        self.kwh = 0.0;
        self.reset_at = now;
        total
    }

    pub fn kwh(&self) -> f64 {
        self.kwh
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Seconds between the last reset and [`ENERGY_RESET_EPOCH_UNIX`].
    pub fn reset_reference(&self) -> i64 {
        self.reset_at.timestamp() - ENERGY_RESET_EPOCH_UNIX
    }
}

/// Decoded values of one channel for one poll tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Production {
        /// True iff the operating state register holds a producing code.
        on: bool,
        power_w: f64,
        voltage_v: f64,
        current_a: f64,
        /// Running total since the last reset.
        energy_kwh: f64,
        /// Seconds between the last reset and the 2001-01-01 epoch.
        reset_reference_secs: i64,
    },
    Temperature { celsius: f64 },
}

/// Point-in-time output of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub channel: String,
    pub kind: ChannelKind,
    pub time: DateTime<Utc>,
    pub reading: Reading,
}

/// Everything the engine hands to the sink fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsEvent {
    Snapshot(MetricsSnapshot),
    /// Pre-reset total emitted once on day rollover.
    DailyTotal {
        channel: String,
        kind: ChannelKind,
        time: DateTime<Utc>,
        kwh: f64,
    },
    /// Current total emitted once per hour, without resetting.
    HourlyTotal {
        channel: String,
        kind: ChannelKind,
        time: DateTime<Utc>,
        kwh: f64,
    },
}

enum ChannelState {
    Temperature {
        name: String,
    },
    Production {
        name: String,
        kind: ChannelKind,
        registers: &'static ProductionRegisters,
        accumulator: EnergyAccumulator,
    },
}

/// Turns register windows into metrics events, once per poll tick.
pub struct MetricsEngine {
    channels: Vec<ChannelState>,
    poll_interval: Duration,
}

impl MetricsEngine {
    pub fn new(channels: &[ChannelConfig], poll_interval: Duration, now: DateTime<Utc>) -> Self {
        let channels = channels
            .iter()
            .map(|config| match config.kind {
                ChannelKind::State => ChannelState::Temperature {
                    name: config.name.clone(),
                },
                ChannelKind::Ac => ChannelState::Production {
                    name: config.name.clone(),
                    kind: ChannelKind::Ac,
                    registers: &AC_REGISTERS,
                    accumulator: EnergyAccumulator::new(now),
                },
                ChannelKind::Dc => ChannelState::Production {
                    name: config.name.clone(),
                    kind: ChannelKind::Dc,
                    registers: &DC_REGISTERS,
                    accumulator: EnergyAccumulator::new(now),
                },
            })
            .collect();
        Self {
            channels,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Proves at startup that every register this engine will decode lies
    /// inside the fixed window. An out-of-window address is a configuration
    /// defect and must not surface mid-poll.
    pub fn validate(&self) -> Result<(), proto::Error> {
        let window =
            RegisterWindow::inverter(vec![0; usize::from(proto::INVERTER_WINDOW_QUANTITY)])?;
        for channel in &self.channels {
            match channel {
                ChannelState::Temperature { .. } => {
                    window.register(proto::HEAT_SINK_TEMPERATURE_REG_ADDR)?;
                }
                ChannelState::Production { registers, .. } => {
                    window.scaled(registers.power, registers.power_sf)?;
                    window.scaled(registers.voltage, registers.voltage_sf)?;
                    window.scaled(registers.current, registers.current_sf)?;
                    window.register(proto::OPERATING_STATE_REG_ADDR)?;
                }
            }
        }
        Ok(())
    }

    /// Consumes one register window and emits the events of this tick.
    ///
    /// `now` carries the wall clock of the caller's time zone; day and hour
    /// rollovers are detected on its local hour/minute/second fields, while
    /// emitted timestamps are normalized to UTC.
    pub fn tick<Tz: TimeZone>(
        &mut self,
        window: &RegisterWindow,
        now: DateTime<Tz>,
    ) -> Result<Vec<MetricsEvent>, proto::Error> {
        let time = now.with_timezone(&Utc);
        let day_rollover = day_rollover(&now, self.poll_interval);
        let hour_rollover = hour_rollover(&now, self.poll_interval);

        let mut events = Vec::with_capacity(self.channels.len());
        for channel in &mut self.channels {
            match channel {
                ChannelState::Temperature { name } => {
                    let raw = window.register(proto::HEAT_SINK_TEMPERATURE_REG_ADDR)?;
                    events.push(MetricsEvent::Snapshot(MetricsSnapshot {
                        channel: name.clone(),
                        kind: ChannelKind::State,
                        time,
                        reading: Reading::Temperature {
                            celsius: proto::heat_sink_temperature_decode(raw),
                        },
                    }));
                }
                ChannelState::Production {
                    name,
                    kind,
                    registers,
                    accumulator,
                } => {
                    let power_w = window.scaled(registers.power, registers.power_sf)?;
                    let voltage_v = window.scaled(registers.voltage, registers.voltage_sf)?;
                    let current_a = window.scaled(registers.current, registers.current_sf)?;
                    let state = OperatingState::decode(
                        window.register(proto::OPERATING_STATE_REG_ADDR)?,
                    );

                    // Boundary events precede accumulation. The daily check
                    // runs first, so at midnight the daily total carries the
                    // pre-reset value and the hourly event reports the fresh
                    // accumulator.
                    if day_rollover {
                        let total = accumulator.reset(time);
                        events.push(MetricsEvent::DailyTotal {
                            channel: name.clone(),
                            kind: *kind,
                            time,
                            kwh: total,
                        });
                    }
                    if hour_rollover {
                        events.push(MetricsEvent::HourlyTotal {
                            channel: name.clone(),
                            kind: *kind,
                            time,
                            kwh: accumulator.kwh(),
                        });
                    }

                    accumulator.add(power_w, self.poll_interval);
                    events.push(MetricsEvent::Snapshot(MetricsSnapshot {
                        channel: name.clone(),
                        kind: *kind,
                        time,
                        reading: Reading::Production {
                            on: state.is_producing(),
                            power_w,
                            voltage_v,
                            current_a,
                            energy_kwh: accumulator.kwh(),
                            reset_reference_secs: accumulator.reset_reference(),
                        },
                    }));
                }
            }
        }
        Ok(events)
    }

    /// Zeroes the accumulator of the named channel and stamps the reset time.
    /// Returns false if the channel is unknown or carries no accumulator.
    pub fn reset_energy(&mut self, channel: &str, now: DateTime<Utc>) -> bool {
        for state in &mut self.channels {
            if let ChannelState::Production {
                name, accumulator, ..
            } = state
            {
                if name == channel {
                    accumulator.reset(now);
                    return true;
                }
            }
        }
        false
    }

    /// Seconds between the named channel's last reset and the 2001-01-01
    /// epoch, if the channel has an accumulator.
    pub fn reset_reference(&self, channel: &str) -> Option<i64> {
        self.production(channel)
            .map(EnergyAccumulator::reset_reference)
    }

    /// Current kWh total of the named channel, if it has an accumulator.
    pub fn energy_kwh(&self, channel: &str) -> Option<f64> {
        self.production(channel).map(EnergyAccumulator::kwh)
    }

    fn production(&self, channel: &str) -> Option<&EnergyAccumulator> {
        self.channels.iter().find_map(|state| match state {
            ChannelState::Production {
                name, accumulator, ..
            } if name == channel => Some(accumulator),
            _ => None,
        })
    }
}

/// True in the first poll interval after midnight, local wall clock.
fn day_rollover<Tz: TimeZone>(now: &DateTime<Tz>, poll_interval: Duration) -> bool {
    now.hour() == 0 && hour_rollover(now, poll_interval)
}

/// True in the first poll interval after a full hour, local wall clock.
fn hour_rollover<Tz: TimeZone>(now: &DateTime<Tz>, poll_interval: Duration) -> bool {
    now.minute() == 0 && u64::from(now.second()) <= poll_interval.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use assert_matches::assert_matches;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn window(values: &[(u16, u16)]) -> RegisterWindow {
        let mut registers = vec![0u16; usize::from(proto::INVERTER_WINDOW_QUANTITY)];
        for (address, value) in values {
            registers[usize::from(address - proto::INVERTER_WINDOW_START)] = *value;
        }
        RegisterWindow::inverter(registers).unwrap()
    }

    fn producing_window() -> RegisterWindow {
        window(&[
            (proto::AC_POWER_REG_ADDR, 2300),
            (proto::AC_POWER_SF_REG_ADDR, 65535),
            (proto::AC_VOLTAGE_REG_ADDR, 2400),
            (proto::AC_VOLTAGE_SF_REG_ADDR, 65535),
            (proto::AC_CURRENT_REG_ADDR, 958),
            (proto::AC_CURRENT_SF_REG_ADDR, 65534),
            (proto::OPERATING_STATE_REG_ADDR, 4),
            (proto::HEAT_SINK_TEMPERATURE_REG_ADDR, 4875),
        ])
    }

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, hour, minute, second)
            .unwrap()
    }

    fn ac_engine() -> MetricsEngine {
        MetricsEngine::new(
            &[ChannelConfig {
                name: "Inverter AC".into(),
                kind: ChannelKind::Ac,
            }],
            INTERVAL,
            at(12, 0, 0),
        )
    }

    // Energy of one 10s tick at 230 W.
    const TICK_KWH: f64 = 230.0 * 10_000.0 / 3_600_000_000.0;

    #[test]
    fn production_snapshot_decodes_scaled_values() {
        let mut engine = ac_engine();
        let events = engine.tick(&producing_window(), at(12, 30, 5)).unwrap();
        assert_eq!(events.len(), 1);
        assert_matches!(
            &events[0],
            MetricsEvent::Snapshot(MetricsSnapshot {
                kind: ChannelKind::Ac,
                reading: Reading::Production {
                    on: true,
                    power_w,
                    voltage_v,
                    current_a,
                    energy_kwh,
                    ..
                },
                ..
            }) => {
                assert_relative_eq!(*power_w, 230.0, max_relative = 1e-12);
                assert_relative_eq!(*voltage_v, 240.0, max_relative = 1e-12);
                assert_relative_eq!(*current_a, 9.58, max_relative = 1e-12);
                assert_relative_eq!(*energy_kwh, TICK_KWH, max_relative = 1e-12);
            }
        );
    }

    #[test]
    fn non_producing_state_maps_to_off() {
        let mut engine = ac_engine();
        for code in [1u16, 2, 3, 6, 7, 8, 0, 99] {
            let registers = window(&[
                (proto::AC_POWER_REG_ADDR, 2300),
                (proto::AC_POWER_SF_REG_ADDR, 65535),
                (proto::OPERATING_STATE_REG_ADDR, code),
            ]);
            let events = engine.tick(&registers, at(12, 30, 5)).unwrap();
            assert_matches!(
                &events[0],
                MetricsEvent::Snapshot(MetricsSnapshot {
                    reading: Reading::Production { on: false, .. },
                    ..
                })
            );
        }
    }

    #[test]
    fn energy_accumulates_across_ticks() {
        let mut engine = ac_engine();
        engine.tick(&producing_window(), at(12, 30, 5)).unwrap();
        engine.tick(&producing_window(), at(12, 30, 15)).unwrap();
        assert_relative_eq!(
            engine.energy_kwh("Inverter AC").unwrap(),
            2.0 * TICK_KWH,
            max_relative = 1e-12
        );
    }

    #[test]
    fn accumulation_is_associative_under_tick_splitting() {
        let now = at(12, 0, 0);
        let mut whole = EnergyAccumulator::new(now);
        whole.add(230.0, Duration::from_secs(10));

        let mut halves = EnergyAccumulator::new(now);
        halves.add(230.0, Duration::from_secs(5));
        halves.add(230.0, Duration::from_secs(5));

        assert_relative_eq!(whole.kwh(), halves.kwh(), max_relative = 1e-12);
    }

    #[test]
    fn day_rollover_resets_and_reports_daily_total() {
        let mut engine = ac_engine();
        engine.tick(&producing_window(), at(23, 59, 50)).unwrap();

        let midnight = Utc.with_ymd_and_hms(2024, 6, 16, 0, 0, 2).unwrap();
        let events = engine.tick(&producing_window(), midnight).unwrap();

        // daily total carries the pre-reset value, the hourly event fires
        // after the reset, and the snapshot restarts from one tick
        assert_eq!(events.len(), 3);
        assert_matches!(
            &events[0],
            MetricsEvent::DailyTotal { kind: ChannelKind::Ac, kwh, time, .. } => {
                assert_relative_eq!(*kwh, TICK_KWH, max_relative = 1e-12);
                assert_eq!(*time, midnight);
            }
        );
        assert_matches!(
            &events[1],
            MetricsEvent::HourlyTotal { kwh, .. } => assert_relative_eq!(*kwh, 0.0)
        );
        assert_matches!(
            &events[2],
            MetricsEvent::Snapshot(MetricsSnapshot {
                reading: Reading::Production { energy_kwh, reset_reference_secs, .. },
                ..
            }) => {
                assert_relative_eq!(*energy_kwh, TICK_KWH, max_relative = 1e-12);
                assert_eq!(
                    *reset_reference_secs,
                    midnight.timestamp() - ENERGY_RESET_EPOCH_UNIX
                );
            }
        );
    }

    #[test]
    fn hour_rollover_reports_without_reset() {
        let mut engine = ac_engine();
        engine.tick(&producing_window(), at(12, 59, 50)).unwrap();

        let events = engine.tick(&producing_window(), at(13, 0, 3)).unwrap();
        assert_eq!(events.len(), 2);
        assert_matches!(
            &events[0],
            MetricsEvent::HourlyTotal { kwh, .. } => {
                assert_relative_eq!(*kwh, TICK_KWH, max_relative = 1e-12)
            }
        );
        // the accumulator kept its value and grew by one more tick
        assert_relative_eq!(
            engine.energy_kwh("Inverter AC").unwrap(),
            2.0 * TICK_KWH,
            max_relative = 1e-12
        );
    }

    #[test]
    fn rollover_requires_second_within_poll_interval() {
        let mut engine = ac_engine();
        let events = engine.tick(&producing_window(), at(0, 0, 11)).unwrap();
        assert_eq!(events.len(), 1);
        assert_matches!(&events[0], MetricsEvent::Snapshot(_));
    }

    #[test]
    fn manual_reset_zeroes_and_stamps_reference() {
        let mut engine = ac_engine();
        engine.tick(&producing_window(), at(12, 30, 5)).unwrap();

        let reset_time = at(14, 15, 9);
        assert!(engine.reset_energy("Inverter AC", reset_time));
        assert_relative_eq!(engine.energy_kwh("Inverter AC").unwrap(), 0.0);
        assert_eq!(
            engine.reset_reference("Inverter AC").unwrap(),
            reset_time.timestamp() - ENERGY_RESET_EPOCH_UNIX
        );
    }

    #[test]
    fn reset_of_unknown_channel_is_rejected() {
        let mut engine = ac_engine();
        assert!(!engine.reset_energy("nope", at(12, 0, 0)));
        assert_eq!(engine.reset_reference("nope"), None);
    }

    #[test]
    fn temperature_channel_reports_only_temperature() {
        let mut engine = MetricsEngine::new(
            &[ChannelConfig {
                name: "Inverter".into(),
                kind: ChannelKind::State,
            }],
            INTERVAL,
            at(12, 0, 0),
        );
        // even across a midnight tick, no energy events
        let midnight = Utc.with_ymd_and_hms(2024, 6, 16, 0, 0, 1).unwrap();
        let events = engine.tick(&producing_window(), midnight).unwrap();
        assert_eq!(events.len(), 1);
        assert_matches!(
            &events[0],
            MetricsEvent::Snapshot(MetricsSnapshot {
                kind: ChannelKind::State,
                reading: Reading::Temperature { celsius },
                ..
            }) => assert_relative_eq!(*celsius, 48.75)
        );
        assert_eq!(engine.energy_kwh("Inverter"), None);
    }

    #[test]
    fn dc_channel_uses_dc_registers() {
        let mut engine = MetricsEngine::new(
            &[ChannelConfig {
                name: "Inverter DC".into(),
                kind: ChannelKind::Dc,
            }],
            INTERVAL,
            at(12, 0, 0),
        );
        let window = window(&[
            (proto::DC_POWER_REG_ADDR, 2450),
            (proto::DC_POWER_SF_REG_ADDR, 65535),
            (proto::OPERATING_STATE_REG_ADDR, 5),
        ]);
        let events = engine.tick(&window, at(12, 30, 5)).unwrap();
        assert_matches!(
            &events[0],
            MetricsEvent::Snapshot(MetricsSnapshot {
                kind: ChannelKind::Dc,
                reading: Reading::Production { on: true, power_w, .. },
                ..
            }) => assert_relative_eq!(*power_w, 245.0, max_relative = 1e-12)
        );
    }

    #[test]
    fn engine_validates_register_map() {
        let engine = MetricsEngine::new(
            &[
                ChannelConfig {
                    name: "a".into(),
                    kind: ChannelKind::Ac,
                },
                ChannelConfig {
                    name: "d".into(),
                    kind: ChannelKind::Dc,
                },
                ChannelConfig {
                    name: "s".into(),
                    kind: ChannelKind::State,
                },
            ],
            INTERVAL,
            at(12, 0, 0),
        );
        assert_matches!(engine.validate(), Ok(()));
    }
}
