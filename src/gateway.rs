use anyhow::{Context, Result};
use bmsbridge_lib::adapter::{MockDataAdapter, SnapshotAdapter};
use bmsbridge_lib::serialport::{InverterBus, JkBms};
use bmsbridge_lib::snapshot::{SharedSnapshot, Snapshot};
use log::{error, info};
use serde_json::json;
use std::time::{Duration, Instant};

use crate::commandline::{MqttFormat, RunOutput};
use crate::mqtt;

/// Pause between drains of the inverter receive buffer. At 9600 baud a
/// full request takes about 8 ms, so this never falls behind.
const INVERTER_IDLE_SLEEP: Duration = Duration::from_millis(20);

fn spawn_inverter_thread(mut bus: InverterBus, adapter: SnapshotAdapter) -> Result<()> {
    std::thread::Builder::new()
        .name("inverter-bus".into())
        .spawn(move || loop {
            if let Err(e) = bus.service(&adapter) {
                error!("Inverter bus error: {e:#}");
            }
            std::thread::sleep(INVERTER_IDLE_SLEEP);
        })
        .with_context(|| "Cannot spawn inverter bus thread")?;
    Ok(())
}

fn publish_simple_format(publisher: &mqtt::MqttPublisher, value: &serde_json::Value) {
    fn publish_recursive(publisher: &mqtt::MqttPublisher, topic: &str, val: &serde_json::Value) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    let sub_topic = format!("{topic}/{k}");
                    publish_recursive(publisher, &sub_topic, v);
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    let sub_topic = format!("{topic}/{i}");
                    publish_recursive(publisher, &sub_topic, v);
                }
            }
            serde_json::Value::String(s) => {
                if let Err(e) = publisher.publish(topic, s) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Number(n) => {
                if let Err(e) = publisher.publish(topic, &n.to_string()) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Bool(b) => {
                if let Err(e) = publisher.publish(topic, &b.to_string()) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
            serde_json::Value::Null => {
                // Do not publish null values
            }
        }
    }
    publish_recursive(publisher, publisher.topic(), value);
}

fn publish_snapshot(publisher: &mqtt::MqttPublisher, format: &MqttFormat, snapshot: &Snapshot) {
    let value = match serde_json::to_value(snapshot) {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to serialize snapshot: {e}");
            return;
        }
    };
    match format {
        MqttFormat::Json => {
            let payload = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "battery": value,
            });
            match serde_json::to_string(&payload) {
                Ok(json_payload) => {
                    if let Err(e) = publisher.publish(publisher.topic(), &json_payload) {
                        error!("Failed to publish data to MQTT: {e:?}");
                    }
                }
                Err(e) => error!("Failed to serialize data to JSON string: {e}"),
            }
        }
        MqttFormat::Simple => publish_simple_format(publisher, &value),
    }
}

/// Runs the gateway: the inverter bus is serviced on its own thread from
/// the shared snapshot while this thread keeps polling the battery.
pub fn run(
    battery_device: &str,
    timeout: Duration,
    delay: Duration,
    inverter_device: &str,
    slave_id: u8,
    poll_interval: Duration,
    output: Option<RunOutput>,
) -> Result<()> {
    info!(
        "Starting gateway: battery={battery_device}, inverter={inverter_device}, slave_id={slave_id}, poll_interval={poll_interval:?}"
    );

    let shared = SharedSnapshot::new();

    let mut bms = JkBms::new(battery_device)?;
    bms.set_timeout(timeout)?;
    bms.set_delay(delay);

    let bus = InverterBus::new(inverter_device, slave_id)?;
    spawn_inverter_thread(bus, SnapshotAdapter::new(shared.clone()))?;

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;
    let mut mqtt_format = MqttFormat::Json;
    let mut console_interval: Option<Duration> = None;
    match &output {
        Some(RunOutput::Console { interval }) => console_interval = Some(*interval),
        Some(RunOutput::Mqtt {
            config_file,
            format,
        }) => {
            let config = mqtt::MqttConfig::load(config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let publisher = mqtt::MqttPublisher::new(config)
                .with_context(|| "Failed to create MQTT publisher")?;
            mqtt_publisher = Some(publisher);
            mqtt_format = format.clone();
        }
        None => {}
    }

    let mut last_dump = Instant::now();
    loop {
        match bms.poll_status() {
            Ok(snapshot) => {
                log::debug!(
                    "Decoded battery status: {} cells, {:.2} V, {:.2} A, SoC {}%",
                    snapshot.cell_count,
                    snapshot.total_voltage,
                    snapshot.current,
                    snapshot.capacity_remaining_pct
                );
                if let Some(publisher) = &mqtt_publisher {
                    publish_snapshot(publisher, &mqtt_format, &snapshot);
                }
                shared.publish(snapshot);
            }
            Err(e) => {
                error!("Battery poll failed: {e:#}");
                shared.note_miss();
                if !shared.online() {
                    log::warn!("No valid battery data, inverter replies are zeroed");
                }
            }
        }

        if let Some(interval) = console_interval {
            if last_dump.elapsed() >= interval {
                shared.read(|s| {
                    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                    println!("{s:#?}");
                    println!("--------------------------");
                });
                last_dump = Instant::now();
            }
        }

        std::thread::sleep(poll_interval);
    }
}

/// Answers the inverter with fixed values so the inverter-side wiring and
/// register map can be commissioned without a battery.
pub fn run_mock(inverter_device: &str, slave_id: u8) -> Result<()> {
    info!("Starting mock gateway: inverter={inverter_device}, slave_id={slave_id}");
    let mut bus = InverterBus::new(inverter_device, slave_id)?;
    loop {
        if let Err(e) = bus.service(&MockDataAdapter) {
            error!("Inverter bus error: {e:#}");
        }
        std::thread::sleep(INVERTER_IDLE_SLEEP);
    }
}
