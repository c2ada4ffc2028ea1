use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_battery_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn default_inverter_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM2")
    } else {
        String::from("/dev/ttyUSB1")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Poll the battery once and print the decoded status
    Poll,
    /// Bridge the battery to the inverter: poll the battery periodically
    /// and answer register reads on the inverter bus
    Run {
        /// Serial port connected to the inverter RS-485 bus
        #[arg(long, default_value_t = default_inverter_device_name())]
        inverter_device: String,

        /// Slave id this gateway answers to on the inverter bus
        #[arg(long, default_value = "1")]
        slave_id: u8,

        /// Interval between battery status polls (e.g., "5s", "500ms")
        #[clap(long, value_parser = humantime::parse_duration, default_value = "5s")]
        poll_interval: Duration,

        /// Optional output for decoded snapshots
        #[command(subcommand)]
        output: Option<RunOutput>,
    },
    /// Answer the inverter with fixed values, no battery attached
    /// (useful for commissioning the inverter-side wiring)
    Mock {
        /// Serial port connected to the inverter RS-485 bus
        #[arg(long, default_value_t = default_inverter_device_name())]
        inverter_device: String,

        /// Slave id this gateway answers to on the inverter bus
        #[arg(long, default_value = "1")]
        slave_id: u8,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum RunOutput {
    /// Periodically print the latest snapshot to the standard output (console).
    Console {
        /// Interval between console dumps (e.g., "30s", "1m")
        #[clap(long, value_parser = humantime::parse_duration, default_value = "30s")]
        interval: Duration,
    },
    /// Publish every decoded snapshot to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Json)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "JK BMS to inverter gateway"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port connected to the battery (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_battery_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O on the battery bus (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between requests to the battery (e.g., "50ms", "100ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "50ms")]
    pub delay: Duration,
}
