use crate::config::MqttConfig;
use anyhow::{Context, Result};
use log::*;
use paho_mqtt as mqtt;
use std::time::Duration;
use sunspec_monitor_lib::metrics::{MetricsEvent, Reading};
use sunspec_monitor_lib::poll::SessionHandle;
use sunspec_monitor_lib::sink::{MetricsSink, SinkError};

const MQTT_TOPIC_AVAILABILITY: &str = "availability";
/// Command topic; the payload names the channel whose accumulator to reset.
const MQTT_TOPIC_RESET_ENERGY: &str = "ResetEnergy";

fn get_topic(device: &str, appendix: &str) -> String {
    format!("{device}/{appendix}")
}

fn connect(config: &MqttConfig) -> Result<mqtt::Client> {
    let mut client =
        mqtt::Client::new(config.url.clone()).with_context(|| "Error creating mqtt client")?;

    // Use 5sec timeouts for sync calls.
    client.set_timeout(Duration::from_secs(5));

    let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
    let mut conn_builder = conn_builder
        .keep_alive_interval(Duration::from_secs(20))
        .clean_session(true);

    if let Some(user_name) = &config.username {
        conn_builder = conn_builder.user_name(user_name)
    }
    if let Some(password) = &config.password {
        conn_builder = conn_builder.password(password.as_str())
    }
    let conn_ops = conn_builder.finalize();

    client
        .connect(conn_ops)
        .with_context(|| "Mqtt client unable to connect")?;

    Ok(client)
}

/// Publishes one message per metric per tick, topics `<device>/<Channel><Metric>`,
/// values as decimal strings. Marks the device available while running and
/// retains an offline marker when dropped.
pub struct MqttSink {
    client: mqtt::Client,
    device: String,
    qos: i32,
}

impl MqttSink {
    pub fn connect(config: &MqttConfig, device: &str) -> Result<Self> {
        let client = connect(config)?;
        let sink = Self {
            client,
            device: device.to_string(),
            qos: config.qos(),
        };
        sink.publish(MQTT_TOPIC_AVAILABILITY, "online")?;
        Ok(sink)
    }

    fn publish(&self, appendix: &str, payload: &str) -> Result<()> {
        let msg = mqtt::Message::new(get_topic(&self.device, appendix), payload, self.qos);
        self.client
            .publish(msg)
            .with_context(|| "Cannot publish mqtt message")
    }
}

impl MetricsSink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn receive(&mut self, event: &MetricsEvent) -> std::result::Result<(), SinkError> {
        match event {
            MetricsEvent::Snapshot(snapshot) => match &snapshot.reading {
                Reading::Production {
                    power_w,
                    voltage_v,
                    current_a,
                    energy_kwh,
                    ..
                } => {
                    let label = snapshot.kind.label();
                    self.publish(&format!("{label}Power"), &power_w.to_string())?;
                    self.publish(&format!("{label}Voltage"), &voltage_v.to_string())?;
                    self.publish(&format!("{label}Ampere"), &current_a.to_string())?;
                    self.publish(&format!("{label}Energy"), &energy_kwh.to_string())?;
                }
                Reading::Temperature { celsius } => {
                    self.publish("Temperature", &celsius.to_string())?;
                }
            },
            MetricsEvent::DailyTotal { kind, kwh, .. } => {
                self.publish(&format!("{}PowerDaily", kind.label()), &kwh.to_string())?;
            }
            MetricsEvent::HourlyTotal { kind, kwh, .. } => {
                self.publish(&format!("{}PowerHourly", kind.label()), &kwh.to_string())?;
            }
        }
        Ok(())
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        let msg = mqtt::Message::new_retained(
            get_topic(&self.device, MQTT_TOPIC_AVAILABILITY),
            "offline",
            self.qos,
        );
        if let Err(error) = self.client.publish(msg) {
            debug!("Cannot publish mqtt offline message: {error}");
        }
        if let Err(error) = self.client.disconnect(None) {
            debug!("Error disconnect mqtt client: {error}");
        }
    }
}

/// Subscribes to the reset-command topic on a dedicated connection and
/// forwards each payload (a channel name) to the poll session.
///
/// The consumer thread lives for the rest of the process; it exits once the
/// session is stopped.
pub fn spawn_reset_listener(
    config: &MqttConfig,
    device: &str,
    handle: SessionHandle,
) -> Result<()> {
    let client = connect(config)?;
    let stream = client.start_consuming();
    let topic = get_topic(device, MQTT_TOPIC_RESET_ENERGY);
    let qos = config.qos();
    client
        .subscribe(&topic, qos)
        .with_context(|| format!("Cannot subscribe to {topic}"))?;

    std::thread::spawn(move || {
        for message in stream.iter() {
            match message {
                Some(message) => {
                    let channel = message.payload_str();
                    debug!("Reset command for channel '{channel}'");
                    if !handle.reset_energy(&channel) {
                        break;
                    }
                }
                None => {
                    if client.is_connected() {
                        continue;
                    }
                    warn!("Lost mqtt connection, attempting reconnect");
                    loop {
                        std::thread::sleep(Duration::from_secs(1));
                        if let Err(error) = client.reconnect() {
                            warn!("Error reconnecting: {error}");
                            continue;
                        }
                        if let Err(error) = client.subscribe(&topic, qos) {
                            warn!("Error resubscribing to {topic}: {error}");
                            continue;
                        }
                        break;
                    }
                }
            }
        }
        debug!("Reset listener exiting");
    });

    Ok(())
}
