//! Configuration for the Modbus aggregator.

use modbus_agg_common::{LoggingConfig, verbosity_level};
use modbus_agg_framework::{ServiceConfig, ServiceError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::layout::{NodeLayout, covering_sizes};
use crate::table::{MAX_REGION_SIZE, Region, RegionSizes};

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Node '{node}': {region} count {count} exceeds capacity {capacity}")]
    CapacityExceeded {
        node: String,
        region: Region,
        count: u16,
        capacity: u16,
    },
    #[error("Node '{node}': {region} window ends at {end}, beyond the 16-bit address space")]
    AddressOverflow {
        node: String,
        region: Region,
        end: usize,
    },
    #[error("Nodes '{first}' and '{second}' both claim {region} address {address}")]
    Collision {
        region: Region,
        first: String,
        second: String,
        address: usize,
    },
}

/// Largest count one Modbus request can carry for `region`.
///
/// Coils and holding registers are also written back in one request, so
/// they are bounded by the write limits.
pub fn region_capacity(region: Region) -> u16 {
    match region {
        Region::Coils => 1968,
        Region::DiscreteInputs => 2000,
        Region::HoldingRegisters => 123,
        Region::InputRegisters => 125,
    }
}

/// Complete aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Upstream-facing Modbus server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Global debug verbosity (0 = use logging.level)
    #[serde(default)]
    pub debug: u8,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Remote devices to aggregate
    pub nodes: Vec<NodeConfig>,
}

/// Listening socket of the Modbus server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (IP literal)
    #[serde(default = "default_listen_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Upper bound on the number of configured nodes
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    1503
}

fn default_max_nodes() -> usize {
    247
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
            max_nodes: default_max_nodes(),
        }
    }
}

impl ServerConfig {
    /// Parse the listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.host.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "'{}' is not a valid listen IP address",
                self.host
            ))
        })?;

        if self.port == 0 {
            return Err(ConfigError::Validation(
                "Listen port must be greater than 0".to_string(),
            ));
        }

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Start address on the remote device and number of entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionWindow {
    /// First remote address (0-based)
    #[serde(default)]
    pub start: u16,

    /// Number of entries (0 disables the region)
    #[serde(default)]
    pub count: u16,
}

impl RegionWindow {
    /// Window of `count` entries starting at remote address `start`.
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// Whether the region is polled at all.
    pub fn is_enabled(&self) -> bool {
        self.count > 0
    }
}

/// Configuration for a single remote node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name (used in logs)
    pub name: String,

    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    #[serde(default)]
    pub coils: RegionWindow,

    #[serde(default)]
    pub discrete_inputs: RegionWindow,

    #[serde(default)]
    pub holding_registers: RegionWindow,

    #[serde(default)]
    pub input_registers: RegionWindow,

    /// Position of this node's windows in the shared table
    #[serde(default)]
    pub offset: u16,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Only write coils to the device, never read them
    #[serde(default)]
    pub coil_push_only: bool,

    /// Only write holding registers to the device, never read them
    #[serde(default)]
    pub hr_push_only: bool,

    /// Copy the remote coils into the discrete input table
    #[serde(default)]
    pub mirror_coils: bool,

    /// Keep the connection open between cycles
    #[serde(default = "default_persistent")]
    pub persistent: bool,

    /// Connect and request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Per-node debug verbosity (0 = inherit)
    #[serde(default)]
    pub debug: u8,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    1
}

fn default_persistent() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    1000
}

impl NodeConfig {
    /// A node with every region disabled and default settings.
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_modbus_port(),
            unit_id: default_unit_id(),
            coils: RegionWindow::default(),
            discrete_inputs: RegionWindow::default(),
            holding_registers: RegionWindow::default(),
            input_registers: RegionWindow::default(),
            offset: 0,
            poll_interval_secs: default_poll_interval(),
            coil_push_only: false,
            hr_push_only: false,
            mirror_coils: false,
            persistent: default_persistent(),
            timeout_ms: default_timeout_ms(),
            debug: 0,
        }
    }

    /// Remote window configured for `region`.
    pub fn window(&self, region: Region) -> RegionWindow {
        match region {
            Region::Coils => self.coils,
            Region::DiscreteInputs => self.discrete_inputs,
            Region::HoldingRegisters => self.holding_registers,
            Region::InputRegisters => self.input_registers,
        }
    }

    /// Wait between cycles and between reconnect attempts.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Connect and per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Where this node lives in the shared table.
    pub fn layout(&self) -> NodeLayout {
        NodeLayout::of(self)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation(
                "Node name cannot be empty".to_string(),
            ));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::Validation(format!(
                "Node '{}': name may only contain letters, digits, '_' and '-'",
                self.name
            )));
        }

        if self.host.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Node '{}': host cannot be empty",
                self.name
            )));
        }

        if self.port == 0 {
            return Err(ConfigError::Validation(format!(
                "Node '{}': port must be greater than 0",
                self.name
            )));
        }

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "Node '{}': poll_interval_secs must be greater than 0",
                self.name
            )));
        }

        for region in Region::ALL {
            let window = self.window(region);
            let capacity = region_capacity(region);
            if window.count > capacity {
                return Err(ConfigError::CapacityExceeded {
                    node: self.name.clone(),
                    region,
                    count: window.count,
                    capacity,
                });
            }

            if usize::from(window.start) + usize::from(window.count) > MAX_REGION_SIZE {
                return Err(ConfigError::Validation(format!(
                    "Node '{}': remote {} window {}+{} exceeds the 16-bit address space",
                    self.name, region, window.start, window.count
                )));
            }
        }

        let layout = self.layout();
        for region in Region::ALL {
            let end = layout.footprint(region).end;
            if end > MAX_REGION_SIZE {
                return Err(ConfigError::AddressOverflow {
                    node: self.name.clone(),
                    region,
                    end,
                });
            }
        }

        Ok(())
    }
}

impl AggregatorConfig {
    /// Apply command-line overrides of the listen address.
    pub fn apply_overrides(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host {
            self.server.host = host;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
    }

    /// Load `path`, apply command-line listen overrides, then validate.
    ///
    /// Overrides are applied first so a listen address in the file that the
    /// command line replaces is never rejected.
    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<Self, ServiceError> {
        let mut config = Self::load_unvalidated(path)?;
        config.apply_overrides(host, port);
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;

        if self.nodes.is_empty() {
            return Err(ConfigError::Validation(
                "At least one node must be configured".to_string(),
            ));
        }

        if self.nodes.len() > self.server.max_nodes {
            return Err(ConfigError::Validation(format!(
                "{} nodes configured, max_nodes is {}",
                self.nodes.len(),
                self.server.max_nodes
            )));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            node.check()?;
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate node name '{}'",
                    node.name
                )));
            }
        }

        self.check_collisions()
    }

    fn check_collisions(&self) -> Result<(), ConfigError> {
        let layouts: Vec<_> = self.nodes.iter().map(NodeLayout::of).collect();

        for region in Region::ALL {
            let mut claims: Vec<_> = self
                .nodes
                .iter()
                .zip(&layouts)
                .map(|(node, layout)| (node.name.as_str(), layout.footprint(region)))
                .filter(|(_, range)| !range.is_empty())
                .collect();
            claims.sort_by_key(|(_, range)| range.start);

            for pair in claims.windows(2) {
                let (first, a) = &pair[0];
                let (second, b) = &pair[1];
                if b.start < a.end {
                    return Err(ConfigError::Collision {
                        region,
                        first: first.to_string(),
                        second: second.to_string(),
                        address: b.start,
                    });
                }
            }
        }

        Ok(())
    }

    /// Smallest table covering every node.
    pub fn region_sizes(&self) -> RegionSizes {
        let layouts: Vec<_> = self.nodes.iter().map(NodeLayout::of).collect();
        covering_sizes(&layouts)
    }
}

impl ServiceConfig for AggregatorConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn log_directives(&self) -> Vec<String> {
        let global = verbosity_level(self.debug).map(|level| format!("modbus_agg={}", level));

        let nodes = self.nodes.iter().filter_map(|node| {
            verbosity_level(node.debug)
                .map(|level| format!("modbus_agg[node{{name={}}}]={}", node.name, level))
        });

        global.into_iter().chain(nodes).collect()
    }

    fn validate(&self) -> Result<(), ServiceError> {
        self.check()
            .map_err(|e| ServiceError::validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> AggregatorConfig {
        json5::from_str(json).unwrap()
    }

    fn two_nodes(second_offset: u16) -> AggregatorConfig {
        let mut a = NodeConfig::new("a", "10.0.0.1");
        a.coils = RegionWindow::new(0, 8);
        a.discrete_inputs = RegionWindow::new(0, 4);

        let mut b = NodeConfig::new("b", "10.0.0.2");
        b.coils = RegionWindow::new(0, 8);
        b.offset = second_offset;

        AggregatorConfig {
            server: ServerConfig::default(),
            debug: 0,
            logging: LoggingConfig::default(),
            nodes: vec![a, b],
        }
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse(
            r#"{
                server: { host: "127.0.0.1", port: 1502 },
                debug: 2,
                nodes: [
                    {
                        name: "plc01",
                        host: "192.168.1.11",
                        unit_id: 3,
                        coils: { start: 0, count: 8 },
                        discrete_inputs: { start: 16, count: 8 },
                        holding_registers: { count: 4 },
                        offset: 100,
                        poll_interval_secs: 2,
                        hr_push_only: true,
                        mirror_coils: true,
                        persistent: false,
                        debug: 3
                    }
                ]
            }"#,
        );

        config.check().unwrap();
        assert_eq!(config.server.port, 1502);
        assert_eq!(config.debug, 2);

        let node = &config.nodes[0];
        assert_eq!(node.port, 502); // default
        assert_eq!(node.unit_id, 3);
        assert_eq!(node.discrete_inputs, RegionWindow::new(16, 8));
        assert_eq!(node.holding_registers, RegionWindow::new(0, 4));
        assert!(!node.input_registers.is_enabled());
        assert!(node.hr_push_only);
        assert!(!node.coil_push_only);
        assert!(!node.persistent);
        assert_eq!(node.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_defaults() {
        let config = parse(r#"{ nodes: [ { name: "n1", host: "plc.local" } ] }"#);

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 1503);
        assert_eq!(config.server.max_nodes, 247);
        assert_eq!(config.nodes[0].poll_interval_secs, 1);
        assert!(config.nodes[0].persistent);
        assert_eq!(config.nodes[0].timeout_ms, 1000);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_validate_empty_nodes() {
        let config = parse("{ nodes: [] }");
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut config = two_nodes(100);
        config.nodes[1].holding_registers = RegionWindow::new(0, 124);

        assert_eq!(
            config.check(),
            Err(ConfigError::CapacityExceeded {
                node: "b".to_string(),
                region: Region::HoldingRegisters,
                count: 124,
                capacity: 123,
            })
        );
    }

    #[test]
    fn test_collision_detected() {
        let config = two_nodes(4);
        assert_eq!(
            config.check(),
            Err(ConfigError::Collision {
                region: Region::Coils,
                first: "a".to_string(),
                second: "b".to_string(),
                address: 4,
            })
        );
    }

    #[test]
    fn test_adjacent_windows_do_not_collide() {
        let config = two_nodes(8);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_liveness_bit_collides() {
        // a owns discrete inputs 0..4 plus liveness bit 4; b's liveness bit is at 4 too
        let mut config = two_nodes(8);
        config.nodes[1].offset = 4;
        config.nodes[1].coils = RegionWindow::default();

        assert!(matches!(
            config.check(),
            Err(ConfigError::Collision {
                region: Region::DiscreteInputs,
                ..
            })
        ));
    }

    #[test]
    fn test_mirror_block_collides() {
        let mut config = two_nodes(8);
        // a: inputs 0..4, mirror 4..12, liveness 12; b liveness at 8
        config.nodes[0].mirror_coils = true;

        assert!(matches!(
            config.check(),
            Err(ConfigError::Collision {
                region: Region::DiscreteInputs,
                address: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_address_overflow() {
        let mut config = two_nodes(8);
        config.nodes[1].offset = u16::MAX;

        assert!(matches!(
            config.check(),
            Err(ConfigError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn test_duplicate_names() {
        let mut config = two_nodes(8);
        config.nodes[1].name = "a".to_string();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_invalid_name() {
        let mut config = two_nodes(8);
        config.nodes[1].name = "plc 01".to_string();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_zero_poll_interval() {
        let mut config = two_nodes(8);
        config.nodes[0].poll_interval_secs = 0;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_max_nodes() {
        let mut config = two_nodes(8);
        config.server.max_nodes = 1;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_listen_overrides() {
        let mut config = two_nodes(8);
        config.apply_overrides(Some("not-an-ip".to_string()), None);
        assert!(config.check().is_err());

        config.apply_overrides(Some("127.0.0.1".to_string()), Some(1600));
        assert_eq!(
            config.server.socket_addr().unwrap(),
            "127.0.0.1:1600".parse::<SocketAddr>().unwrap()
        );

        config.apply_overrides(None, Some(0));
        assert!(config.check().is_err());
    }

    #[test]
    fn test_region_sizes() {
        let sizes = two_nodes(8).region_sizes();

        assert_eq!(sizes.coils, 16);
        // a: inputs 0..4 + liveness 4; b: liveness 8
        assert_eq!(sizes.discrete_inputs, 9);
        assert_eq!(sizes.holding_registers, 0);
    }

    #[test]
    fn test_log_directives() {
        let mut config = two_nodes(8);
        assert!(config.log_directives().is_empty());

        config.debug = 1;
        config.nodes[1].debug = 3;
        assert_eq!(
            config.log_directives(),
            vec![
                "modbus_agg=info".to_string(),
                "modbus_agg[node{name=b}]=trace".to_string(),
            ]
        );
    }
}
