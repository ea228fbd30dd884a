//! Modbus TCP aggregator.
//!
//! Polls many Modbus TCP devices and exposes all of them through a single
//! Modbus TCP server. Each device ("node") owns a window of one shared
//! table at its configured offset:
//!
//! ```text
//! coils              [offset, offset + coils)
//! holding registers  [offset, offset + holding_registers)
//! input registers    [offset, offset + input_registers)
//! discrete inputs    [offset, offset + discrete_inputs)
//!                    + mirrored coils (optional)
//!                    + one liveness bit
//! ```
//!
//! Coils and holding registers are bidirectional: writes from a client of
//! the server are pushed to the device, changes on the device are pulled
//! into the table. When both sides changed the same address in one cycle,
//! the client's write wins.

pub mod config;
pub mod device;
pub mod layout;
pub mod poller;
pub mod reconcile;
pub mod server;
pub mod table;

use std::sync::Arc;

use crate::config::AggregatorConfig;
use crate::device::TcpConnector;
use crate::poller::NodePoller;
use crate::table::{AddressError, AddressSpace, AllocationError};

/// Allocate the shared table sized to cover every configured node.
pub fn allocate(config: &AggregatorConfig) -> Result<Arc<AddressSpace>, AllocationError> {
    AddressSpace::allocate(config.region_sizes()).map(Arc::new)
}

/// Build one Modbus TCP poller per configured node.
pub fn tcp_pollers(
    config: &AggregatorConfig,
    space: &Arc<AddressSpace>,
) -> Result<Vec<NodePoller<TcpConnector>>, AddressError> {
    config
        .nodes
        .iter()
        .map(|node| {
            NodePoller::new(
                node.clone(),
                TcpConnector::for_node(node),
                Arc::clone(space),
            )
        })
        .collect()
}
