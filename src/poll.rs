//! Connection and poll state machine.
//!
//! A [`PollSession`] owns the Modbus TCP connection exclusively. It connects,
//! reads the inverter window once immediately and then once per poll tick,
//! feeds every successful read through the metrics engine, and hands the
//! resulting events to the sink fan-out.
//!
//! Fault handling follows two rules: a failed or timed-out read is logged and
//! skipped without touching the connection, while a transport-level fault
//! tears the connection down and re-attempts after a fixed delay, forever.
//! External reset commands are marshaled onto the poll loop through a
//! [`SessionHandle`] so the accumulators are only ever touched from one task.

use crate::metrics::MetricsEngine;
use crate::protocol as proto;
use crate::sink::SinkFanout;
use crate::tokio_async::SunSpecInverter;
use chrono::{DateTime, Local, Utc};
use log::{debug, error, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_modbus::client::Client as _;

/// Fixed delay between reconnect attempts. No growth, no retry ceiling:
/// the device is assumed to eventually come back.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection state of the poll session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    BackingOff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::BackingOff => write!(f, "backing off"),
        }
    }
}

enum Command {
    ResetEnergy {
        channel: String,
        /// Wall clock at issue time. Commands queued while the session is
        /// reconnecting are applied later with this original timestamp.
        at: DateTime<Utc>,
    },
}

/// Cloneable handle for marshaling commands onto the poll loop.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Requests a manual energy reset for the named channel. Returns false
    /// once the session has stopped. The reset timestamp is taken now, not
    /// when the poll loop gets around to applying the command.
    pub fn reset_energy(&self, channel: &str) -> bool {
        self.commands
            .send(Command::ResetEnergy {
                channel: channel.to_string(),
                at: Utc::now(),
            })
            .is_ok()
    }
}

/// A running poll session; dropping it without [`PollSession::stop`] also
/// terminates the task, but without waiting for the sinks to drain.
pub struct PollSession {
    handle: SessionHandle,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: tokio::task::JoinHandle<()>,
}

impl PollSession {
    /// Validates the engine's register map and launches the session task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        addr: SocketAddr,
        read_timeout: Duration,
        engine: MetricsEngine,
        fanout: SinkFanout,
    ) -> Result<Self, proto::Error> {
        // An out-of-window register pair is a configuration defect; catch it
        // here instead of on some later poll tick.
        engine.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let task = tokio::spawn(
            SessionTask {
                addr,
                read_timeout,
                engine,
                fanout,
                commands: command_rx,
                shutdown: shutdown_rx,
                state: state_tx,
            }
            .run(),
        );

        Ok(Self {
            handle: SessionHandle {
                commands: command_tx,
            },
            shutdown: shutdown_tx,
            state: state_rx,
            task,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stops the session: cancels the timers, closes the transport and waits
    /// until the sink fan-out has drained. No snapshot is emitted afterwards.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if self.task.await.is_err() {
            error!("poll session task panicked");
        }
    }
}

enum PollOutcome {
    Stop,
    Reconnect,
}

struct SessionTask {
    addr: SocketAddr,
    read_timeout: Duration,
    engine: MetricsEngine,
    fanout: SinkFanout,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
}

impl SessionTask {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            info!("connecting to inverter at {}", self.addr);
            let connected = tokio::select! {
                _ = stopped(&mut self.shutdown) => break,
                result = tokio_modbus::client::tcp::connect(self.addr) => result,
            };

            match connected {
                Ok(mut ctx) => {
                    info!("connected to inverter at {}", self.addr);
                    self.set_state(ConnectionState::Connected);
                    let outcome = self.poll_connected(&mut ctx).await;
                    let _ = ctx.disconnect().await;
                    if matches!(outcome, PollOutcome::Stop) {
                        break;
                    }
                }
                Err(error) => warn!("cannot connect to {}: {error}", self.addr),
            }

            self.set_state(ConnectionState::BackingOff);
            debug!("re-attempting connection in {RECONNECT_DELAY:?}");
            tokio::select! {
                _ = stopped(&mut self.shutdown) => break,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.fanout.shutdown();
    }

    /// Polls until the transport faults or the session is stopped.
    async fn poll_connected(&mut self, ctx: &mut tokio_modbus::client::Context) -> PollOutcome {
        let mut ticker = interval(self.engine.poll_interval());
        // The first tick fires immediately, giving the initial read right
        // after connect. Ticks that land while a read is still pending are
        // skipped, never queued.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stopped(&mut self.shutdown) => return PollOutcome::Stop,
                command = self.commands.recv() => match command {
                    Some(Command::ResetEnergy { channel, at }) => {
                        if self.engine.reset_energy(&channel, at) {
                            info!("energy accumulator of '{channel}' reset");
                        } else {
                            warn!("energy reset for unknown channel '{channel}'");
                        }
                    }
                    // All handles are gone; nobody can stop us later.
                    None => return PollOutcome::Stop,
                },
                _ = ticker.tick() => {
                    let read = timeout(
                        self.read_timeout,
                        SunSpecInverter::read_inverter_window(ctx),
                    )
                    .await;
                    match read {
                        Err(_) => warn!(
                            "register read timed out after {:?}, skipping tick",
                            self.read_timeout
                        ),
                        Ok(Err(error)) if error.is_transport_fault() => {
                            warn!("transport fault, reconnecting: {error}");
                            return PollOutcome::Reconnect;
                        }
                        Ok(Err(error)) => warn!("register read failed: {error}"),
                        Ok(Ok(window)) => match self.engine.tick(&window, Local::now()) {
                            Ok(events) => {
                                for event in &events {
                                    self.fanout.publish(event);
                                }
                            }
                            // validated at spawn; only a register map
                            // regression can land here
                            Err(error) => error!("register decode failed: {error}"),
                        },
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("connection state: {state}");
        let _ = self.state.send(state);
    }
}

/// Resolves once the session is asked to stop. A dropped [`PollSession`]
/// counts as a stop request.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
