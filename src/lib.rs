//! A library for monitoring SunSpec-compatible power inverters over Modbus TCP.
//!
//! The monitor maintains a persistent session to the device, reads a fixed
//! window of holding registers on a fixed cadence, decodes the biased
//! scale-factor register pairs into physical quantities, accumulates energy
//! per channel, and fans the resulting metrics out to independent sinks.
//!
//! The crate is split along those lines:
//!
//! 1. **Pure protocol layer**: [`protocol`] holds the register map of the
//!    inverter window and the decode helpers. No I/O.
//! 2. **Client**: [`tokio_async`] reads the register window through a
//!    `tokio-modbus` context (requires the `tokio-tcp` feature).
//! 3. **Metrics**: [`metrics`] turns register windows into snapshots and
//!    daily/hourly energy events.
//! 4. **Delivery**: [`sink`] fans events out to sinks such as the live-value
//!    cache and the history log without blocking the poll loop.
//! 5. **Session**: [`poll`] ties it all together in a reconnecting poll loop
//!    (requires the `tokio-tcp` feature).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use sunspec_monitor_lib::{
//!     metrics::{ChannelConfig, ChannelKind, MetricsEngine},
//!     poll::PollSession,
//!     sink::{LiveCache, SinkFanout},
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = LiveCache::default();
//!     let mut fanout = SinkFanout::new();
//!     fanout.register(Box::new(cache.sink()));
//!
//!     let engine = MetricsEngine::new(
//!         &[ChannelConfig { name: "Inverter AC".into(), kind: ChannelKind::Ac }],
//!         Duration::from_secs(10),
//!         chrono::Utc::now(),
//!     );
//!
//!     let session = PollSession::spawn(
//!         "192.168.1.40:502".parse()?,
//!         Duration::from_secs(5),
//!         engine,
//!         fanout,
//!     )?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     session.stop().await;
//!     Ok(())
//! }
//! ```

pub mod metrics;
pub mod protocol;
pub mod sink;

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-tcp")))]
#[cfg(feature = "tokio-tcp")]
pub mod tokio_async;

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-tcp")))]
#[cfg(feature = "tokio-tcp")]
pub mod poll;
