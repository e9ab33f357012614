use serde::{Deserialize, Deserializer};
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use sunspec_monitor_lib::metrics::ChannelConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cadence of register window reads.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound for a single read; a timed-out read is skipped.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_port() -> u16 {
    502
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Quality of service code to use
    #[serde(default = "default_qos", deserialize_with = "deserialize_qos")]
    qos: u8,
}

fn default_qos() -> u8 {
    0
}

fn deserialize_qos<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let qos = u8::deserialize(deserializer)?;
    if qos > 2 {
        return Err(serde::de::Error::custom(format!(
            "qos must be 0, 1 or 2, got {qos}"
        )));
    }
    Ok(qos)
}

impl MqttConfig {
    pub fn qos(&self) -> i32 {
        i32::from(self.qos)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Device name, used as the leading topic segment.
    #[serde(default = "default_device")]
    pub device: String,
    pub modbus: ModbusConfig,
    /// Channels to expose: state (temperature), AC and/or DC.
    pub channels: Vec<ChannelConfig>,
    /// Publishing is disabled when absent.
    pub mqtt: Option<MqttConfig>,
}

fn default_device() -> String {
    String::from("SolarEdge")
}

pub fn get_config(path: &Path) -> anyhow::Result<Config> {
    log::debug!("Loading config file from {path:?}");
    let config_file = File::open(path)?;
    let config: Config = serde_yaml::from_reader(&config_file)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunspec_monitor_lib::metrics::ChannelKind;

    #[test]
    fn parses_full_config() {
        let yaml = r#"
device: SolarEdge
modbus:
  host: 192.168.1.40
  port: 1502
  poll_interval: 10s
  timeout: 2s
channels:
  - name: Inverter AC
    kind: AC
  - name: Inverter DC
    kind: DC
  - name: Inverter
    kind: state
mqtt:
  url: tcp://broker.local:1883
  username: solar
  password: secret
  qos: 1
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.device, "SolarEdge");
        assert_eq!(config.modbus.port, 1502);
        assert_eq!(config.modbus.poll_interval, Duration::from_secs(10));
        assert_eq!(config.modbus.timeout, Duration::from_secs(2));
        assert_eq!(config.channels.len(), 3);
        assert_eq!(config.channels[0].kind, ChannelKind::Ac);
        assert_eq!(config.channels[1].kind, ChannelKind::Dc);
        assert_eq!(config.channels[2].kind, ChannelKind::State);
        assert_eq!(config.mqtt.unwrap().qos(), 1);
    }

    #[test]
    fn applies_defaults() {
        let yaml = r#"
modbus:
  host: inverter.local
channels:
  - name: Inverter AC
    kind: AC
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.device, "SolarEdge");
        assert_eq!(config.modbus.port, 502);
        assert_eq!(config.modbus.poll_interval, Duration::from_secs(10));
        assert_eq!(config.modbus.timeout, Duration::from_secs(5));
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn rejects_out_of_range_qos() {
        let yaml = r#"
modbus:
  host: inverter.local
channels:
  - name: Inverter AC
    kind: AC
mqtt:
  url: tcp://broker.local:1883
  qos: 7
"#;
        let error = serde_yaml::from_str::<Config>(yaml).unwrap_err();
        assert!(error.to_string().contains("qos"));
    }

    #[test]
    fn rejects_unknown_channel_kind() {
        let yaml = r#"
modbus:
  host: inverter.local
channels:
  - name: Inverter AC
    kind: XY
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
