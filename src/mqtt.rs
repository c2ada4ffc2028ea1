use anyhow::{Context, Result};
use rumqttc::{Client, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "bmsbridge".into()
    }

    fn default_client_id() -> String {
        format!("bmsbridge-{}", std::process::id())
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }
}

pub struct MqttPublisher {
    client: Client,
    topic: String,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive_interval);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.as_str(), password.as_str());
        }

        log::info!(
            "Attempting to connect to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut connection) = Client::new(options, 10);

        // reconnects happen inside the event loop, it just has to be driven
        std::thread::Builder::new()
            .name("mqtt-connection".into())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(event) => log::trace!("MQTT event: {event:?}"),
                        Err(e) => {
                            log::warn!("MQTT connection error: {e}");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            })
            .with_context(|| "Cannot spawn MQTT connection thread")?;

        Ok(Self {
            client,
            topic: config.topic,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!("Publishing to MQTT: Topic='{topic}', Payload='{payload}'");
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host: broker.local").unwrap();
        let config = MqttConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 1883);
        assert_eq!(config.topic, "bmsbridge");
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert!(config.username.is_none());
        assert!(config.client_id.starts_with("bmsbridge-"));
    }

    #[test]
    fn durations_accept_humantime_strings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "host: broker.local\nport: 8883\ntopic: battery\nkeep_alive_interval: 1m"
        )
        .unwrap();
        let config = MqttConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 8883);
        assert_eq!(config.topic, "battery");
        assert_eq!(config.keep_alive_interval, Duration::from_secs(60));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(MqttConfig::load("/nonexistent/mqtt.yaml").is_err());
    }
}
