mod commandline;
mod gateway;
mod mqtt;

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    match args.command {
        CliCommands::Poll => {
            let mut bms = bmsbridge_lib::serialport::JkBms::new(&args.device)
                .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
            bms.set_timeout(args.timeout)?;
            bms.set_delay(args.delay);
            let snapshot = bms
                .poll_status()
                .with_context(|| "Cannot poll battery status")?;
            println!("{snapshot:#?}");
        }
        CliCommands::Run {
            inverter_device,
            slave_id,
            poll_interval,
            output,
        } => {
            gateway::run(
                &args.device,
                args.timeout,
                args.delay,
                &inverter_device,
                slave_id,
                poll_interval,
                output,
            )?;
        }
        CliCommands::Mock {
            inverter_device,
            slave_id,
        } => {
            gateway::run_mock(&inverter_device, slave_id)?;
        }
    }

    Ok(())
}
