//! Servo Bus Probe
//!
//! Attaches to one controller on a shared servo line, detects its size,
//! reads every channel and prints the port statistics.
//!
//! Usage:
//!   cargo run --example bus_probe -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port (default: /dev/ttyACM0)
//!   --baud RATE       Baud rate (default: 9600)
//!   --device N        Device number of the controller (default: 12)
//!   --channels N      Skip detection and assume N channels
//!   --config FILE     Load bus settings from a JSON file
//!   --sim             Probe a simulated 18-channel controller instead

use anyhow::{bail, Context, Result};
use servobus_core::prelude::*;
use servobus_core::protocol::Connector;
use std::sync::mpsc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct Options {
    port_name: String,
    baud_rate: Option<u32>,
    device_number: u8,
    channels: Option<u8>,
    config_path: Option<String>,
    simulate: bool,
}

fn parse_args() -> Result<Option<Options>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        port_name: "/dev/ttyACM0".to_string(),
        baud_rate: None,
        device_number: 12,
        channels: None,
        config_path: None,
        simulate: false,
    };

    let mut i = 1;
    while i < args.len() {
        let value = |i: usize| {
            args.get(i + 1)
                .cloned()
                .with_context(|| format!("{} needs a value", args[i]))
        };
        match args[i].as_str() {
            "--port" | "-p" => {
                options.port_name = value(i)?;
                i += 1;
            }
            "--baud" | "-b" => {
                options.baud_rate = Some(value(i)?.parse().context("invalid baud rate")?);
                i += 1;
            }
            "--device" | "-d" => {
                options.device_number = value(i)?.parse().context("invalid device number")?;
                i += 1;
            }
            "--channels" | "-c" => {
                options.channels = Some(value(i)?.parse().context("invalid channel count")?);
                i += 1;
            }
            "--config" => {
                options.config_path = Some(value(i)?);
                i += 1;
            }
            "--sim" => options.simulate = true,
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            arg if !arg.starts_with('-') => options.port_name = arg.to_string(),
            other => bail!("unknown option: {}", other),
        }
        i += 1;
    }
    Ok(Some(options))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };

    let mut config = match &options.config_path {
        Some(path) => BusConfig::load(path)?,
        None => BusConfig::default(),
    };
    if let Some(baud_rate) = options.baud_rate {
        config.baud_rate = baud_rate;
    }

    println!("Servo Bus Probe");
    println!("  Port:     {}", if options.simulate { "simulated" } else { options.port_name.as_str() });
    println!("  Baud:     {}", config.baud_rate);
    println!("  Device:   {}", options.device_number);
    println!();

    let manager = PortManager::new(config);
    let mut controller = if options.simulate {
        let bus = SimulatedBus::new();
        bus.add_controller(options.device_number, 18);
        for channel in 0..18 {
            bus.set_position(options.device_number, channel, 1000.0 + channel as f64 * 50.0);
        }
        manager.controller_with(
            "sim",
            move || -> Box<dyn Connector> { Box::new(bus.connector()) },
            options.device_number,
        )?
    } else {
        manager.controller(&options.port_name, options.device_number)?
    };

    match options.channels {
        Some(count) => controller.set_channel_count(count),
        None => match controller.detect_channel_count(Duration::from_millis(200)) {
            Some(count) => println!("Detected {} channels", count),
            None => println!("No reply from device {}, assuming defaults", options.device_number),
        },
    }

    let (tx, rx) = mpsc::channel();
    controller.get_all_positions_batch(move |positions| {
        let _ = tx.send(positions);
    });
    let mut positions: Vec<(u8, f64)> = rx
        .recv_timeout(Duration::from_secs(30))
        .context("batch read did not finish")?
        .into_iter()
        .collect();
    positions.sort_by_key(|(channel, _)| *channel);

    println!();
    println!("Positions:");
    if positions.is_empty() {
        println!("  (none)");
    }
    for (channel, position) in positions {
        println!("  channel {:2}: {:8.2}", channel, position);
    }

    let (tx, rx) = mpsc::channel();
    controller.get_errors(
        move |errors| {
            let _ = tx.send(errors);
        },
        Priority::Normal,
    );
    match rx.recv_timeout(Duration::from_secs(5)).ok().flatten() {
        Some(errors) if errors.is_empty() => println!("Errors:   none"),
        Some(errors) => println!("Errors:   {}", errors.names().join(", ")),
        None => println!("Errors:   no reply"),
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&controller.status())?);

    drop(controller);
    manager.shutdown_all();
    Ok(())
}

fn print_help() {
    println!("Servo Bus Probe");
    println!();
    println!("Usage: bus_probe [OPTIONS] [PORT]");
    println!();
    println!("Options:");
    println!("  --port, -p PORT      Serial port (default: /dev/ttyACM0)");
    println!("  --baud, -b RATE      Baud rate (default: 9600)");
    println!("  --device, -d N       Controller device number (default: 12)");
    println!("  --channels, -c N     Assume N channels instead of detecting");
    println!("  --config FILE        Load bus settings from JSON");
    println!("  --sim                Use a simulated controller");
    println!("  --help, -h           Show this help");
}
