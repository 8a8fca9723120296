mod config;
mod event_shim;
mod modbus_shim;
mod orchestrator;
mod relay_ctl;
mod relay_types;
mod shutdown;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use std::env;

use config::Args;
use event_shim::HttpEventSource;
use modbus_shim::ModbusTransport;
use orchestrator::Orchestrator;
use relay_ctl::RelayController;
use shutdown::listen_for_signals;
use shutdown::Shutdown;

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();

    stderrlog::new()
        .module(module_path!())
        .module("critical")
        .quiet(args.quiet)
        .verbosity(2 + usize::from(args.verbose))
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let config = args.into_config(|key| env::var(key).ok())?;

    let shutdown = Shutdown::new();
    listen_for_signals(shutdown.clone()).context("Failed to install signal handlers")?;

    info!(
        "Using '{}' (timeout {:?}), unit {}",
        config.transport,
        config.transport.timeout(),
        config.slave
    );
    let controller = RelayController::new(ModbusTransport::new(config.transport), config.slave);
    let source = HttpEventSource::new().context("Failed to create HTTP client")?;

    let mut orchestrator =
        Orchestrator::new(controller, source, shutdown, config.relays, config.schedule);

    if config.exercise {
        if !orchestrator.exercise() {
            info!("Exercise interrupted");
        }
    } else {
        orchestrator.run();
    }

    Ok(())
}
