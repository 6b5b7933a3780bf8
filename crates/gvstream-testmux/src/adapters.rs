//! Virtual transport adapters
//!
//! One generic adapter type serves all handle kinds. It resolves every
//! accessor against the reactor's record for its handle, so the broker and
//! the test driver always see the same buffers and flags.
//!
//! Adapters hold only `Weak` references: the reactor owns the adapter via
//! the record, the broker owns it via `add_*`, and neither owner is kept
//! alive by the adapter.

use std::sync::{Arc, Weak};

use crate::broker::{Broker, DatagramSink, DatagramSource, Doorman, Endpoint, Scribe, Transport};
use crate::error::{MuxError, MuxResult};
use crate::handle::{
    AcceptHandle, ConnectionHandle, DatagramSinkHandle, DatagramSourceHandle, EndpointHandle,
};
use crate::multiplexer::TestMultiplexer;
use crate::policy::ReceivePolicy;
use crate::records::{HandleRecord, VirtualHandle};

use gvstream_core::{kdebug, kwarn};

pub struct VirtualAdapter<H> {
    hdl: H,
    mux: Weak<TestMultiplexer>,
    broker: Weak<dyn Broker>,
}

pub type TestScribe = VirtualAdapter<ConnectionHandle>;
pub type TestDoorman = VirtualAdapter<AcceptHandle>;
pub type TestEndpoint = VirtualAdapter<EndpointHandle>;
pub type TestDatagramSink = VirtualAdapter<DatagramSinkHandle>;
pub type TestDatagramSource = VirtualAdapter<DatagramSourceHandle>;

impl<H: VirtualHandle> VirtualAdapter<H> {
    pub(crate) fn new(hdl: H, mux: Weak<TestMultiplexer>, broker: &Arc<dyn Broker>) -> Arc<Self> {
        Arc::new(Self {
            hdl,
            mux,
            broker: Arc::downgrade(broker),
        })
    }

    fn mux(&self) -> MuxResult<Arc<TestMultiplexer>> {
        self.mux.upgrade().ok_or(MuxError::ReactorGone)
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut H::Record) -> R) -> MuxResult<R> {
        let mux = self.mux()?;
        Ok(mux.with_record(self.hdl, f))
    }

    fn set_flag(&self, f: impl FnOnce(&mut H::Record)) {
        if self.with_record(f).is_err() {
            kwarn!("{}: reactor gone", self.hdl);
        }
    }
}

impl<H: VirtualHandle> Transport for VirtualAdapter<H> {
    fn stop_reading(&self) {
        let was_attached = self.with_record(|d| {
            *d.stopped_reading() = true;
            let had = d.has_impl();
            d.detach();
            had
        });
        if let Ok(true) = was_attached {
            kdebug!("{} stopped reading", self.hdl);
            if let Some(broker) = self.broker.upgrade() {
                broker.detached(self.hdl.into());
            }
        }
    }

    fn add_to_loop(&self) {
        self.set_flag(|d| *d.passive_mode() = false);
    }

    fn remove_from_loop(&self) {
        self.set_flag(|d| *d.passive_mode() = true);
    }

    fn addr(&self) -> String {
        "test".to_string()
    }

    fn port(&self) -> u16 {
        match self.mux() {
            Ok(mux) => self.hdl.adapter_port(&mux),
            Err(_) => 0,
        }
    }
}

impl Scribe for TestScribe {
    fn hdl(&self) -> ConnectionHandle {
        self.hdl
    }

    fn configure_read(&self, policy: ReceivePolicy) {
        self.set_flag(|d| d.recv_policy = policy);
    }

    fn ack_writes(&self, enable: bool) {
        self.set_flag(|d| d.ack_writes = enable);
    }

    fn write(&self, data: &[u8]) -> MuxResult<()> {
        self.with_record(|d| d.wr_buf.extend_from_slice(data))
    }

    fn wr_buf(&self) -> MuxResult<Vec<u8>> {
        self.with_record(|d| d.wr_buf.clone())
    }

    fn rd_buf(&self) -> MuxResult<Vec<u8>> {
        self.with_record(|d| d.rd_buf.clone())
    }

    fn consume(&self, buf: &[u8]) -> bool {
        match self.broker.upgrade() {
            Some(broker) => broker.new_data(self.hdl, buf),
            None => false,
        }
    }
}

impl Doorman for TestDoorman {
    fn hdl(&self) -> AcceptHandle {
        self.hdl
    }

    fn new_connection(&self, conn: ConnectionHandle) -> bool {
        let (Ok(mux), Some(broker)) = (self.mux(), self.broker.upgrade()) else {
            return false;
        };
        kdebug!("{} accepting {}", self.hdl, conn);
        mux.assign_tcp_scribe(&broker, conn);
        broker.new_connection(self.hdl, conn)
    }
}

impl Endpoint for TestEndpoint {
    fn hdl(&self) -> EndpointHandle {
        self.hdl
    }

    fn configure_datagram_size(&self, size: usize) {
        self.set_flag(|d| d.datagram_size = size);
    }

    fn ack_writes(&self, enable: bool) {
        self.set_flag(|d| d.ack_writes = enable);
    }

    fn write(&self, data: &[u8]) -> MuxResult<()> {
        self.with_record(|d| d.wr_buf.extend_from_slice(data))
    }

    fn wr_buf(&self) -> MuxResult<Vec<u8>> {
        self.with_record(|d| d.wr_buf.clone())
    }

    fn rd_buf(&self) -> MuxResult<Vec<u8>> {
        self.with_record(|d| d.rd_buf.clone())
    }

    fn consume(&self, buf: &[u8]) -> bool {
        match self.broker.upgrade() {
            Some(broker) => broker.new_endpoint_datagram(self.hdl, buf),
            None => false,
        }
    }
}

impl DatagramSink for TestDatagramSink {
    fn hdl(&self) -> DatagramSinkHandle {
        self.hdl
    }

    fn ack_writes(&self, enable: bool) {
        self.set_flag(|d| d.ack_writes = enable);
    }

    fn write(&self, data: &[u8]) -> MuxResult<()> {
        self.with_record(|d| d.wr_buf.extend_from_slice(data))
    }

    fn wr_buf(&self) -> MuxResult<Vec<u8>> {
        self.with_record(|d| d.wr_buf.clone())
    }
}

impl DatagramSource for TestDatagramSource {
    fn hdl(&self) -> DatagramSourceHandle {
        self.hdl
    }

    fn configure_datagram_size(&self, size: usize) {
        self.set_flag(|d| d.datagram_size = size);
    }

    fn rd_buf(&self) -> MuxResult<Vec<u8>> {
        self.with_record(|d| d.rd_buf.clone())
    }

    fn consume(&self, buf: &[u8]) -> bool {
        match self.broker.upgrade() {
            Some(broker) => broker.new_source_datagram(self.hdl, buf),
            None => false,
        }
    }
}
