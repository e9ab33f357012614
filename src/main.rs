//! SunSpec inverter monitor daemon
//!
//! Polls a SunSpec-compatible inverter over Modbus TCP on a fixed cadence,
//! decodes the scaled telemetry registers, accumulates produced energy per
//! channel with automatic day rollover, and republishes everything to an
//! MQTT broker, or prints to the console when no broker is configured.
//!
//! The daemon runs until interrupted (Ctrl-C / SIGINT); on shutdown the
//! session disconnects from the inverter, the sinks drain, and the MQTT
//! availability topic flips to `offline`.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::net::ToSocketAddrs;
use std::panic;
use sunspec_monitor_lib::{
    metrics::{MetricsEngine, MetricsEvent, Reading},
    poll::PollSession,
    sink::{HistoryLog, LiveCache, MetricsSink, SinkError, SinkFanout},
};

mod commandline;
mod config;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Fallback output when no MQTT broker is configured.
struct ConsoleSink;

impl MetricsSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn receive(&mut self, event: &MetricsEvent) -> Result<(), SinkError> {
        match event {
            MetricsEvent::Snapshot(snapshot) => match &snapshot.reading {
                Reading::Production {
                    on,
                    power_w,
                    voltage_v,
                    current_a,
                    energy_kwh,
                    ..
                } => println!(
                    "{} {}: {power_w} W, {voltage_v} V, {current_a} A, {energy_kwh} kWh{}",
                    snapshot.time,
                    snapshot.channel,
                    if *on { "" } else { " (not producing)" }
                ),
                Reading::Temperature { celsius } => println!(
                    "{} {}: {celsius} °C",
                    snapshot.time, snapshot.channel
                ),
            },
            MetricsEvent::DailyTotal { channel, time, kwh, .. } => {
                println!("{time} {channel}: daily total {kwh} kWh")
            }
            MetricsEvent::HourlyTotal { channel, time, kwh, .. } => {
                println!("{time} {channel}: hourly total {kwh} kWh")
            }
        }
        Ok(())
    }
}

/// Wires up all sinks: the live cache and history log always, plus either
/// the MQTT publisher or the console fallback.
fn build_fanout(config: &config::Config) -> Result<(SinkFanout, LiveCache, HistoryLog)> {
    let cache = LiveCache::default();
    let history = HistoryLog::default();
    let mut fanout = SinkFanout::new();
    fanout.register(Box::new(cache.sink()));
    fanout.register(Box::new(history.sink()));
    match &config.mqtt {
        Some(mqtt_config) => {
            let sink = mqtt::MqttSink::connect(mqtt_config, &config.device)
                .with_context(|| "Cannot connect mqtt publisher")?;
            fanout.register(Box::new(sink));
        }
        None => fanout.register(Box::new(ConsoleSink)),
    }
    Ok((fanout, cache, history))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();
    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = config::get_config(&args.config)
        .with_context(|| format!("Cannot load config file {:?}", args.config))?;
    trace!("Configuration: {config:?}");

    let address = (config.modbus.host.as_str(), config.modbus.port)
        .to_socket_addrs()
        .with_context(|| {
            format!(
                "Cannot resolve {}:{}",
                config.modbus.host, config.modbus.port
            )
        })?
        .next()
        .with_context(|| {
            format!(
                "No address found for {}:{}",
                config.modbus.host, config.modbus.port
            )
        })?;

    let (fanout, cache, history) = build_fanout(&config)?;

    let engine = MetricsEngine::new(
        &config.channels,
        config.modbus.poll_interval,
        chrono::Utc::now(),
    );

    info!(
        "Starting poll session for {} ({address}), interval {:?}",
        config.device, config.modbus.poll_interval
    );
    let session = PollSession::spawn(address, config.modbus.timeout, engine, fanout)
        .with_context(|| "Invalid channel configuration")?;

    if let Some(mqtt_config) = &config.mqtt {
        mqtt::spawn_reset_listener(mqtt_config, &config.device, session.handle())
            .with_context(|| "Cannot subscribe to reset commands")?;
    }

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Cannot listen for shutdown signal")?;
    info!("Stopping...");
    session.stop().await;

    debug!("collected {} history entries", history.len());
    for channel in &config.channels {
        if let Some(snapshot) = cache.latest(&channel.name) {
            debug!("last snapshot of '{}': {:?}", channel.name, snapshot.reading);
        }
    }

    Ok(())
}
