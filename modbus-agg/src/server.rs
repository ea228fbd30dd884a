//! Modbus TCP server over the shared table.
//!
//! Every request is answered from the live table; there is no caching and
//! the unit id is ignored, so one server answers for every node.

use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_modbus::{ExceptionCode, Request, Response};
use tokio_modbus::server::Service;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};
use tracing::{debug, info, trace, warn};

use crate::table::{AddressError, AddressSpace, BitRegion, WordRegion};

/// Most bits a single read may request.
pub const MAX_READ_BITS: usize = 2000;
/// Most bits a single write may carry.
pub const MAX_WRITE_BITS: usize = 1968;
/// Most registers a single read may request.
pub const MAX_READ_WORDS: usize = 125;
/// Most registers a single write may carry.
pub const MAX_WRITE_WORDS: usize = 123;
/// Most registers the write half of a read/write request may carry.
pub const MAX_READ_WRITE_WORDS: usize = 121;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Server stopped: {0}")]
    Serve(#[source] io::Error),
}

fn check_quantity(count: usize, max: usize) -> Result<(), ExceptionCode> {
    if count == 0 || count > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

impl From<AddressError> for ExceptionCode {
    fn from(_: AddressError) -> Self {
        ExceptionCode::IllegalDataAddress
    }
}

/// Answers Modbus requests from an [`AddressSpace`].
#[derive(Debug, Clone)]
pub struct TableService {
    space: Arc<AddressSpace>,
}

impl TableService {
    pub fn new(space: Arc<AddressSpace>) -> Self {
        Self { space }
    }

    /// Execute one request against the table.
    pub fn handle(&self, request: Request<'_>) -> Result<Response, ExceptionCode> {
        let space = &self.space;

        match request {
            Request::ReadCoils(address, count) => {
                check_quantity(count.into(), MAX_READ_BITS)?;
                let values = space.read_bits(BitRegion::Coils, address, count)?;
                Ok(Response::ReadCoils(values))
            }
            Request::ReadDiscreteInputs(address, count) => {
                check_quantity(count.into(), MAX_READ_BITS)?;
                let values = space.read_bits(BitRegion::DiscreteInputs, address, count)?;
                Ok(Response::ReadDiscreteInputs(values))
            }
            Request::ReadHoldingRegisters(address, count) => {
                check_quantity(count.into(), MAX_READ_WORDS)?;
                let values = space.read_words(WordRegion::HoldingRegisters, address, count)?;
                Ok(Response::ReadHoldingRegisters(values))
            }
            Request::ReadInputRegisters(address, count) => {
                check_quantity(count.into(), MAX_READ_WORDS)?;
                let values = space.read_words(WordRegion::InputRegisters, address, count)?;
                Ok(Response::ReadInputRegisters(values))
            }
            Request::WriteSingleCoil(address, value) => {
                space.write_bits(BitRegion::Coils, address, &[value])?;
                Ok(Response::WriteSingleCoil(address, value))
            }
            Request::WriteMultipleCoils(address, values) => {
                check_quantity(values.len(), MAX_WRITE_BITS)?;
                space.write_bits(BitRegion::Coils, address, &values)?;
                Ok(Response::WriteMultipleCoils(address, values.len() as u16))
            }
            Request::WriteSingleRegister(address, value) => {
                space.write_words(WordRegion::HoldingRegisters, address, &[value])?;
                Ok(Response::WriteSingleRegister(address, value))
            }
            Request::WriteMultipleRegisters(address, values) => {
                check_quantity(values.len(), MAX_WRITE_WORDS)?;
                space.write_words(WordRegion::HoldingRegisters, address, &values)?;
                Ok(Response::WriteMultipleRegisters(address, values.len() as u16))
            }
            Request::MaskWriteRegister(address, and_mask, or_mask) => {
                space.mask_write_word(address, and_mask, or_mask)?;
                Ok(Response::MaskWriteRegister(address, and_mask, or_mask))
            }
            Request::ReadWriteMultipleRegisters(read_address, read_count, write_address, values) => {
                check_quantity(read_count.into(), MAX_READ_WORDS)?;
                check_quantity(values.len(), MAX_READ_WRITE_WORDS)?;
                let read =
                    space.write_then_read_words(read_address, read_count, write_address, &values)?;
                Ok(Response::ReadWriteMultipleRegisters(read))
            }
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

impl Service for TableService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        trace!(request = ?request, "Request");
        let result = self.handle(request);
        if let Err(code) = &result {
            debug!(exception = ?code, "Request rejected");
        }
        future::ready(result)
    }
}

/// Bind the listening socket.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Listen { addr, source })
}

/// Accept connections on `listener` until the task is aborted.
///
/// Each connection is served independently; there is no connection limit.
pub async fn serve(listener: TcpListener, space: Arc<AddressSpace>) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Modbus server listening");
    }

    let server = Server::new(listener);

    let on_connected = |stream, peer: SocketAddr| {
        let space = Arc::clone(&space);
        async move {
            accept_tcp_connection(stream, peer, |peer| {
                debug!(%peer, "Client connected");
                Ok(Some(TableService::new(Arc::clone(&space))))
            })
        }
    };
    let on_process_error = |e: io::Error| {
        warn!(error = %e, "Connection error");
    };

    server
        .serve(&on_connected, on_process_error)
        .await
        .map_err(ServerError::Serve)?;

    Ok(())
}

/// Bind `addr` and serve `space` on it.
pub async fn run(addr: SocketAddr, space: Arc<AddressSpace>) -> Result<(), ServerError> {
    let listener = bind(addr).await?;
    serve(listener, space).await
}
