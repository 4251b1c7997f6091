//! gpib-scout
//!
//! Resets the GPIB interface, lists the instruments answering on the bus and
//! optionally sends one query to one of them.

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use common::{TracingProgress, setup_logging};
use protocol::{Address, BusPrimitives, HardResetProvider, UsbIdFilter};
use scout::config::ScoutConfig;
use scout::{BusController, SystemResetProvider};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gpib-scout")]
#[command(author, version, about = "Discover instruments on a GPIB bus")]
#[command(long_about = "
Brings up the GPIB interface, probes every primary address with an
identification query and prints the instruments that answered. A wedged
bus adapter is recovered by interface clear, USB reset and, if configured,
a rebind of the USB host controller driver.

EXAMPLES:
    # Scan the bus
    gpib-scout

    # Scan and print the result as JSON
    gpib-scout --json

    # Ask the instrument at address 5 for a measurement
    gpib-scout --query 5 'MEAS?'

    # Show which bus adapters the USB reset would touch
    gpib-scout --list-adapters

CONFIGURATION:
    The configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/gpib-scout/scout.toml
    3. /etc/gpib-scout/scout.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print discovered devices as JSON
    #[arg(long)]
    json: bool,

    /// After discovery, send COMMAND to the device at ADDR and print the reply
    #[arg(long, num_args = 2, value_names = ["ADDR", "COMMAND"])]
    query: Option<Vec<String>>,

    /// List USB devices matching the adapter signatures and exit
    #[arg(long)]
    list_adapters: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ScoutConfig::default();
        let path = ScoutConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ScoutConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ScoutConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.controller.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("gpib-scout v{}", env!("CARGO_PKG_VERSION"));

    if args.list_adapters {
        return list_adapters_mode(&config);
    }

    let query = args.query.as_deref().map(parse_query).transpose()?;
    let result = run_scan(&config, args.json, query);
    if let Err(e) = &result
        && let Some(err) = e.downcast_ref::<common::Error>()
        && err.is_fatal()
    {
        error!("The GPIB bus could not be recovered. Power-cycle the bus adapter and the instruments, then try again.");
    }
    result
}

fn parse_query(values: &[String]) -> Result<(Address, String)> {
    let [address, command] = values else {
        bail!("--query takes an address and a command");
    };
    let address: u8 = address
        .parse()
        .with_context(|| format!("Invalid address '{}'", address))?;
    Ok((Address::new(address)?, command.clone()))
}

/// Discover the bus, print the result and run the optional query
fn run_scan(config: &ScoutConfig, json: bool, query: Option<(Address, String)>) -> Result<()> {
    let primitives = open_backend(config)?;
    let provider = SystemResetProvider::new(&config.recovery.pci_drivers_path);
    let mut controller = BusController::new(config, primitives, provider)?;

    let count = controller.discover(&TracingProgress)?.len();
    if count == 0 {
        controller.shutdown()?;
        bail!("No GPIB devices found");
    }

    if json {
        let devices = controller.discovered();
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).context("Failed to serialize devices")?
        );
    } else {
        println!("Found {} device(s):\n", count);
        for device in controller.discovered() {
            println!("  [{:>2}] {}", device.address, device.identification);
        }
    }

    if let Some((address, command)) = query {
        let session = controller
            .device_mut(address)
            .ok_or_else(|| anyhow!("No device at address {}", address))?;
        let reply = session
            .exchange(&command)
            .with_context(|| format!("Query {:?} to address {} failed", command, address))?;
        println!("{}", reply);
    }

    controller.shutdown().context("Failed to close sessions")?;
    Ok(())
}

#[cfg(feature = "linux-gpib")]
fn open_backend(config: &ScoutConfig) -> Result<Box<dyn BusPrimitives>> {
    Ok(Box::new(scout::backend::LinuxGpib::new(
        config.controller.board_index,
    )))
}

#[cfg(not(feature = "linux-gpib"))]
fn open_backend(_config: &ScoutConfig) -> Result<Box<dyn BusPrimitives>> {
    bail!("No bus backend compiled in, rebuild with --features linux-gpib")
}

/// List attached USB devices that look like bus adapters
fn list_adapters_mode(config: &ScoutConfig) -> Result<()> {
    let filters = config.recovery.adapter_filters()?;
    let mut provider = SystemResetProvider::new(&config.recovery.pci_drivers_path);
    let adapters: Vec<_> = provider
        .list_usb_devices()
        .context("Failed to list USB devices")?
        .into_iter()
        .filter(|entry| UsbIdFilter::any_matches(&filters, entry.id))
        .collect();

    if adapters.is_empty() {
        println!("No bus adapters found.");
    } else {
        println!("Found {} bus adapter(s):\n", adapters.len());
        for entry in adapters {
            println!(
                "  {}  Bus {:03} Device {:03}",
                entry.id, entry.bus_number, entry.device_address
            );
        }
    }

    Ok(())
}
