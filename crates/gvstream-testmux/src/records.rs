//! Per-handle state records
//!
//! Every handle kind has a record holding what a kernel socket would: the
//! bytes "on the wire", the write and read buffers, and the reactor flags.
//! Records are created on first lookup and are never removed; a detached
//! handle simply has no adapter any more.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::broker::{DatagramSink, DatagramSource, Doorman, Endpoint, Scribe};
use crate::config::defaults;
use crate::handle::{
    AcceptHandle, AnyHandle, ConnectionHandle, DatagramSinkHandle, DatagramSourceHandle,
    EndpointHandle,
};
use crate::multiplexer::TestMultiplexer;
use crate::policy::ReceivePolicy;

/// Flags shared by all record kinds.
pub trait HandleRecord: Send {
    fn passive_mode(&mut self) -> &mut bool;

    fn stopped_reading(&mut self) -> &mut bool;

    fn has_impl(&self) -> bool;

    /// Drop the installed adapter.
    fn detach(&mut self);
}

/// A handle kind together with the reactor table that stores its records.
pub trait VirtualHandle:
    Copy + Eq + Hash + Send + Sync + fmt::Display + Into<AnyHandle> + 'static
{
    type Record: HandleRecord;

    fn table(mux: &TestMultiplexer) -> &HandleTable<Self, Self::Record>;

    /// Port an adapter for this handle reports.
    fn adapter_port(self, mux: &TestMultiplexer) -> u16;
}

/// Lazily populated `handle -> record` map.
pub struct HandleTable<H, D> {
    map: Mutex<HashMap<H, D>>,
    init: Box<dyn Fn() -> D + Send + Sync>,
}

impl<H: Copy + Eq + Hash, D> HandleTable<H, D> {
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
    {
        Self {
            map: Mutex::new(HashMap::new()),
            init: Box::new(init),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<H, D>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the record for `hdl`, creating it if needed.
    ///
    /// `f` runs under the table lock and must not call back into the reactor.
    pub fn with<R>(&self, hdl: H, f: impl FnOnce(&mut D) -> R) -> R {
        let mut map = self.lock();
        let rec = map.entry(hdl).or_insert_with(|| (self.init)());
        f(rec)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every record.
    pub(crate) fn take_all(&self) -> Vec<D> {
        self.lock().drain().map(|(_, d)| d).collect()
    }
}

impl<H: Copy + Eq + Hash, D: Default + 'static> Default for HandleTable<H, D> {
    fn default() -> Self {
        Self::new(D::default)
    }
}

macro_rules! impl_record_flags {
    ($rec:ty) => {
        impl HandleRecord for $rec {
            fn passive_mode(&mut self) -> &mut bool {
                &mut self.passive_mode
            }

            fn stopped_reading(&mut self) -> &mut bool {
                &mut self.stopped_reading
            }

            fn has_impl(&self) -> bool {
                self.ptr.is_some()
            }

            fn detach(&mut self) {
                self.ptr = None;
            }
        }
    };
}

#[derive(Default)]
pub struct ScribeData {
    /// Bytes sent by the virtual peer, not yet delivered
    pub xbuf: Vec<u8>,
    pub wr_buf: Vec<u8>,
    /// Last delivered chunk
    pub rd_buf: Vec<u8>,
    pub recv_policy: ReceivePolicy,
    pub ack_writes: bool,
    pub stopped_reading: bool,
    pub passive_mode: bool,
    pub(crate) ptr: Option<Arc<dyn Scribe>>,
}

#[derive(Default)]
pub struct DoormanData {
    pub port: u16,
    pub stopped_reading: bool,
    pub passive_mode: bool,
    pub(crate) ptr: Option<Arc<dyn Doorman>>,
}

pub struct EndpointData {
    /// Datagrams sent by the virtual peer, not yet delivered
    pub xbuf: VecDeque<Vec<u8>>,
    pub wr_buf: Vec<u8>,
    pub rd_buf: Vec<u8>,
    pub datagram_size: usize,
    pub local_port: u16,
    pub remote_port: u16,
    pub ack_writes: bool,
    pub stopped_reading: bool,
    pub passive_mode: bool,
    pub(crate) ptr: Option<Arc<dyn Endpoint>>,
}

impl Default for EndpointData {
    fn default() -> Self {
        Self {
            xbuf: VecDeque::new(),
            wr_buf: Vec::new(),
            rd_buf: Vec::new(),
            datagram_size: defaults::DATAGRAM_SIZE,
            local_port: 0,
            remote_port: 0,
            ack_writes: false,
            stopped_reading: false,
            passive_mode: false,
            ptr: None,
        }
    }
}

#[derive(Default)]
pub struct DatagramSinkData {
    pub wr_buf: Vec<u8>,
    pub port: u16,
    pub ack_writes: bool,
    pub stopped_reading: bool,
    pub passive_mode: bool,
    pub(crate) ptr: Option<Arc<dyn DatagramSink>>,
}

pub struct DatagramSourceData {
    pub xbuf: VecDeque<Vec<u8>>,
    pub rd_buf: Vec<u8>,
    pub datagram_size: usize,
    pub port: u16,
    pub stopped_reading: bool,
    pub passive_mode: bool,
    pub(crate) ptr: Option<Arc<dyn DatagramSource>>,
}

impl Default for DatagramSourceData {
    fn default() -> Self {
        Self {
            xbuf: VecDeque::new(),
            rd_buf: Vec::new(),
            datagram_size: defaults::DATAGRAM_SIZE,
            port: 0,
            stopped_reading: false,
            passive_mode: false,
            ptr: None,
        }
    }
}

impl_record_flags!(ScribeData);
impl_record_flags!(DoormanData);
impl_record_flags!(EndpointData);
impl_record_flags!(DatagramSinkData);
impl_record_flags!(DatagramSourceData);

// Stream connections and endpoints report their handle id as port (0 if
// it does not fit), everything else the port stored in the record.
macro_rules! impl_virtual_handle {
    (@table $hdl:ty, $rec:ty, $field:ident, $port:expr) => {
        impl VirtualHandle for $hdl {
            type Record = $rec;

            fn table(mux: &TestMultiplexer) -> &HandleTable<Self, Self::Record> {
                &mux.$field
            }

            fn adapter_port(self, mux: &TestMultiplexer) -> u16 {
                ($port)(self, mux)
            }
        }
    };
    ($hdl:ty, $rec:ty, $field:ident, port = id) => {
        impl_virtual_handle!(@table $hdl, $rec, $field, |h: $hdl, _mux: &TestMultiplexer| {
            u16::try_from(h.id()).unwrap_or(0)
        });
    };
    ($hdl:ty, $rec:ty, $field:ident, port = record) => {
        impl_virtual_handle!(@table $hdl, $rec, $field, |h: $hdl, mux: &TestMultiplexer| {
            mux.$field.with(h, |d| d.port)
        });
    };
}

impl_virtual_handle!(ConnectionHandle, ScribeData, scribe_data, port = id);
impl_virtual_handle!(AcceptHandle, DoormanData, doorman_data, port = record);
impl_virtual_handle!(EndpointHandle, EndpointData, endpoint_data, port = id);
impl_virtual_handle!(DatagramSinkHandle, DatagramSinkData, sink_data, port = record);
impl_virtual_handle!(DatagramSourceHandle, DatagramSourceData, source_data, port = record);
