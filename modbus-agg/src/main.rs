//! Modbus TCP aggregator.
//!
//! Polls the configured Modbus TCP devices and serves their combined
//! registers from one Modbus TCP server.

use anyhow::{Context, Result};
use tracing::info;

use modbus_agg::config::AggregatorConfig;
use modbus_agg::{allocate, server, tcp_pollers};
use modbus_agg_framework::{ServiceArgs, ServiceRunner};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServiceArgs::parse_with_default("modbus-agg.json5");

    let config =
        AggregatorConfig::load_with_overrides(&args.config, args.address.clone(), args.port)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let listen = config
        .server
        .socket_addr()
        .context("Invalid listen address")?;
    let space = allocate(&config).context("Failed to allocate address space")?;
    let pollers = tcp_pollers(&config, &space).context("Node does not fit the address space")?;

    let mut runner = ServiceRunner::new_with_args("modbus-agg", config, Some(&args))?;

    let sizes = space.sizes();
    info!(
        coils = sizes.coils,
        discrete_inputs = sizes.discrete_inputs,
        holding_registers = sizes.holding_registers,
        input_registers = sizes.input_registers,
        "Address space allocated"
    );

    let listener = server::bind(listen).await?;
    runner.spawn_critical("server".to_string(), server::serve(listener, space));

    for poller in pollers {
        runner.spawn(poller.run());
    }

    info!(nodes = runner.config().nodes.len(), "Aggregator running");

    runner.run().await?;

    Ok(())
}
