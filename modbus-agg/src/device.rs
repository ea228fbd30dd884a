//! Connections to the remote Modbus devices.

use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_modbus::Slave;
use tokio_modbus::client::{Context, Reader, Writer, tcp};

use crate::config::NodeConfig;

/// Error talking to a remote device. Always recoverable by reconnecting.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {addr} failed: {message}")]
    Connect { addr: String, message: String },
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("{operation} failed: {message}")]
    Io {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} rejected by device: {code}")]
    Exception {
        operation: &'static str,
        code: String,
    },
}

/// Modbus master operations the poller needs from a device.
#[async_trait]
pub trait RemoteDevice: Send {
    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, TransportError>;

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<(), TransportError>;

    async fn write_registers(&mut self, address: u16, values: &[u16])
        -> Result<(), TransportError>;
}

/// Opens connections to one device.
#[async_trait]
pub trait Connector: Send + Sync {
    type Device: RemoteDevice;

    async fn connect(&self) -> Result<Self::Device, TransportError>;
}

/// Connector for Modbus TCP devices.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
        }
    }

    pub fn for_node(node: &NodeConfig) -> Self {
        Self::new(node.host.clone(), node.port, node.unit_id, node.timeout())
    }

    /// `host:port` as configured.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect_error(&self, message: impl Into<String>) -> TransportError {
        TransportError::Connect {
            addr: self.address(),
            message: message.into(),
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| self.connect_error(format!("Address lookup failed: {}", e)))?
            .next()
            .ok_or_else(|| self.connect_error("Address lookup returned nothing"))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Device = TcpDevice;

    async fn connect(&self) -> Result<TcpDevice, TransportError> {
        let addr = self.resolve().await?;
        let slave = Slave(self.unit_id);

        let ctx = tokio::time::timeout(self.timeout, tcp::connect_slave(addr, slave))
            .await
            .map_err(|_| self.connect_error("Connection timeout"))?
            .map_err(|e| self.connect_error(e.to_string()))?;

        Ok(TcpDevice {
            ctx,
            timeout: self.timeout,
        })
    }
}

/// An open Modbus TCP connection. Dropping it closes the socket.
pub struct TcpDevice {
    ctx: Context,
    timeout: Duration,
}

/// Run one request under the transport timeout and flatten its two error layers.
async fn request<T, F>(
    timeout: Duration,
    operation: &'static str,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = tokio_modbus::Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Err(_) => Err(TransportError::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }),
        Ok(Err(e)) => Err(TransportError::Io {
            operation,
            message: e.to_string(),
        }),
        Ok(Ok(Err(code))) => Err(TransportError::Exception {
            operation,
            code: format!("{:?}", code),
        }),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

/// Devices may pad bit responses to whole bytes; anything shorter is an error.
fn exact<T>(
    mut values: Vec<T>,
    count: u16,
    operation: &'static str,
) -> Result<Vec<T>, TransportError> {
    let count = usize::from(count);
    if values.len() < count {
        return Err(TransportError::Io {
            operation,
            message: format!("expected {} values, got {}", count, values.len()),
        });
    }
    values.truncate(count);
    Ok(values)
}

#[async_trait]
impl RemoteDevice for TcpDevice {
    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, TransportError> {
        let op = "read coils";
        let values = request(self.timeout, op, self.ctx.read_coils(address, count)).await?;
        exact(values, count, op)
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let op = "read discrete inputs";
        let values = request(
            self.timeout,
            op,
            self.ctx.read_discrete_inputs(address, count),
        )
        .await?;
        exact(values, count, op)
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let op = "read holding registers";
        let values = request(
            self.timeout,
            op,
            self.ctx.read_holding_registers(address, count),
        )
        .await?;
        exact(values, count, op)
    }

    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let op = "read input registers";
        let values = request(
            self.timeout,
            op,
            self.ctx.read_input_registers(address, count),
        )
        .await?;
        exact(values, count, op)
    }

    async fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<(), TransportError> {
        match values {
            [value] => {
                request(
                    self.timeout,
                    "write coil",
                    self.ctx.write_single_coil(address, *value),
                )
                .await
            }
            _ => {
                request(
                    self.timeout,
                    "write coils",
                    self.ctx.write_multiple_coils(address, values),
                )
                .await
            }
        }
    }

    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        match values {
            [value] => {
                request(
                    self.timeout,
                    "write register",
                    self.ctx.write_single_register(address, *value),
                )
                .await
            }
            _ => {
                request(
                    self.timeout,
                    "write registers",
                    self.ctx.write_multiple_registers(address, values),
                )
                .await
            }
        }
    }
}
