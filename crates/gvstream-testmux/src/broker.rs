//! Broker and transport adapter contracts
//!
//! A broker is the actor that owns sockets. The reactor hands it one
//! adapter per handle (`Scribe`, `Doorman`, ...) and delivers inbound data
//! through the `new_*` callbacks. A callback returning `false` rejects the
//! data and puts the handle into passive mode.

use std::sync::Arc;

use crate::error::MuxResult;
use crate::handle::{
    AcceptHandle, AnyHandle, ConnectionHandle, DatagramSinkHandle, DatagramSourceHandle,
    EndpointHandle,
};
use crate::policy::ReceivePolicy;

pub trait Broker: Send + Sync {
    fn add_scribe(&self, scribe: Arc<dyn Scribe>);

    fn add_doorman(&self, doorman: Arc<dyn Doorman>);

    fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>);

    fn add_datagram_sink(&self, sink: Arc<dyn DatagramSink>);

    fn add_datagram_source(&self, source: Arc<dyn DatagramSource>);

    /// Bytes arrived on `hdl`.
    fn new_data(&self, hdl: ConnectionHandle, buf: &[u8]) -> bool;

    /// `acceptor` accepted `hdl`; its scribe was added right before.
    fn new_connection(&self, acceptor: AcceptHandle, hdl: ConnectionHandle) -> bool;

    fn new_endpoint_datagram(&self, hdl: EndpointHandle, buf: &[u8]) -> bool {
        let _ = (hdl, buf);
        true
    }

    fn new_source_datagram(&self, hdl: DatagramSourceHandle, buf: &[u8]) -> bool {
        let _ = (hdl, buf);
        true
    }

    /// The adapter for `hdl` stopped reading and is gone.
    fn detached(&self, hdl: AnyHandle) {
        let _ = hdl;
    }
}

/// Capabilities every adapter has.
pub trait Transport: Send + Sync {
    /// Mark the handle stopped and detach the adapter from its record.
    fn stop_reading(&self);

    /// Leave passive mode.
    fn add_to_loop(&self);

    /// Enter passive mode: the reactor stops driving reads.
    fn remove_from_loop(&self);

    fn addr(&self) -> String;

    fn port(&self) -> u16;

    /// Connection establishment hook.
    fn launch(&self) {}
}

pub trait Scribe: Transport {
    fn hdl(&self) -> ConnectionHandle;

    fn configure_read(&self, policy: ReceivePolicy);

    fn ack_writes(&self, enable: bool);

    /// Append to the outbound buffer.
    fn write(&self, data: &[u8]) -> MuxResult<()>;

    fn wr_buf(&self) -> MuxResult<Vec<u8>>;

    /// The chunk most recently delivered.
    fn rd_buf(&self) -> MuxResult<Vec<u8>>;

    fn flush(&self) {}

    /// Hand one chunk to the broker.
    fn consume(&self, buf: &[u8]) -> bool;
}

pub trait Doorman: Transport {
    fn hdl(&self) -> AcceptHandle;

    /// Accept `conn`: install its scribe with the broker and notify it.
    fn new_connection(&self, conn: ConnectionHandle) -> bool;
}

pub trait Endpoint: Transport {
    fn hdl(&self) -> EndpointHandle;

    fn configure_datagram_size(&self, size: usize);

    fn ack_writes(&self, enable: bool);

    fn write(&self, data: &[u8]) -> MuxResult<()>;

    fn wr_buf(&self) -> MuxResult<Vec<u8>>;

    fn rd_buf(&self) -> MuxResult<Vec<u8>>;

    fn consume(&self, buf: &[u8]) -> bool;
}

pub trait DatagramSink: Transport {
    fn hdl(&self) -> DatagramSinkHandle;

    fn ack_writes(&self, enable: bool);

    fn write(&self, data: &[u8]) -> MuxResult<()>;

    fn wr_buf(&self) -> MuxResult<Vec<u8>>;
}

pub trait DatagramSource: Transport {
    fn hdl(&self) -> DatagramSourceHandle;

    fn configure_datagram_size(&self, size: usize);

    fn rd_buf(&self) -> MuxResult<Vec<u8>>;

    fn consume(&self, buf: &[u8]) -> bool;
}
