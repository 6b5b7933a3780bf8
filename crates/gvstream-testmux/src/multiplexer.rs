//! Deterministic test multiplexer
//!
//! Stands in for the production event loop. Nothing here touches a real
//! socket: "the network" is a set of in-memory buffers that the driver
//! fills with `virtual_send`, and nothing runs unless the driver steps the
//! resumable queue.
//!
//! Design:
//! - Address tables (`provide_*` / `new_*`) map an address to a handle once
//! - Handle tables hold per-handle records, created on first lookup
//! - Resumable queue is a `VecDeque` behind `Mutex + Condvar`
//! - No lock is held while a broker, adapter or resumable runs
//!
//! Lifecycle of a handle:
//!
//! ```text
//!   unbound -> provided -> assigned (adapter installed)
//!                              |
//!                    passive <-+-> active
//!                              |
//!                       stop_reading -> detached (record stays)
//! ```

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use gvstream_core::{kdebug, kerror, ktrace};

use crate::adapters::{TestDatagramSink, TestDatagramSource, TestDoorman, TestEndpoint, TestScribe};
use crate::broker::{Broker, DatagramSink, DatagramSource, Doorman, Endpoint, Scribe};
use crate::config::MuxConfig;
use crate::error::{MuxError, MuxResult};
use crate::handle::{
    AcceptHandle, ConnectionHandle, DatagramSinkHandle, DatagramSourceHandle, EndpointHandle,
};
use crate::policy::ReceivePolicy;
use crate::records::{
    DatagramSinkData, DatagramSourceData, DoormanData, EndpointData, HandleRecord, HandleTable,
    ScribeData, VirtualHandle,
};
use crate::resumable::{ResumableKind, ResumablePtr, ResumeResult};
use crate::scheduler::{ExecutionScheduler, InjectorScheduler};

/// OS socket descriptor, accepted only to reject it.
pub type NativeSocket = i32;

type HostKey = (String, u16);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Register `hdl` under `key` unless the key is taken.
fn provide<K: Eq + Hash, H>(map: &Mutex<HashMap<K, H>>, key: K, hdl: H) -> bool {
    let mut map = lock(map);
    if map.contains_key(&key) {
        return false;
    }
    map.insert(key, hdl);
    true
}

/// Consume the mapping for `key`, or the invalid handle.
fn take<K: Eq + Hash, H: Default>(map: &Mutex<HashMap<K, H>>, key: &K) -> H {
    lock(map).remove(key).unwrap_or_default()
}

fn pop_datagram(
    queue: &mut VecDeque<Vec<u8>>,
    size: usize,
    rd_buf: &mut Vec<u8>,
) -> Option<(Vec<u8>, bool)> {
    *rd_buf = queue.pop_front()?;
    rd_buf.truncate(size);
    Some((rd_buf.clone(), true))
}

#[cold]
fn native_socket_abort(what: &str, fd: NativeSocket) -> ! {
    kerror!("TestMultiplexer::{} called with native socket {}", what, fd);
    std::process::abort()
}

pub struct TestMultiplexer {
    config: MuxConfig,
    scheduler: Arc<dyn ExecutionScheduler>,
    weak_self: Weak<TestMultiplexer>,

    resumables: Mutex<VecDeque<ResumablePtr>>,
    cond: Condvar,

    scribes: Mutex<HashMap<HostKey, ConnectionHandle>>,
    doormen: Mutex<HashMap<u16, AcceptHandle>>,
    remote_endpoints: Mutex<HashMap<HostKey, EndpointHandle>>,
    local_endpoints: Mutex<HashMap<u16, EndpointHandle>>,
    datagram_sinks: Mutex<HashMap<HostKey, DatagramSinkHandle>>,
    datagram_sources: Mutex<HashMap<u16, DatagramSourceHandle>>,
    /// acceptor -> connection, in insertion order
    pending_connects: Mutex<VecDeque<(AcceptHandle, ConnectionHandle)>>,

    pub(crate) scribe_data: HandleTable<ConnectionHandle, ScribeData>,
    pub(crate) doorman_data: HandleTable<AcceptHandle, DoormanData>,
    pub(crate) endpoint_data: HandleTable<EndpointHandle, EndpointData>,
    pub(crate) sink_data: HandleTable<DatagramSinkHandle, DatagramSinkData>,
    pub(crate) source_data: HandleTable<DatagramSourceHandle, DatagramSourceData>,
}

impl TestMultiplexer {
    pub fn new(config: MuxConfig, scheduler: Arc<dyn ExecutionScheduler>) -> Arc<Self> {
        let read_max = config.default_read_max;
        Arc::new_cyclic(|weak| Self {
            config,
            scheduler,
            weak_self: weak.clone(),
            resumables: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            scribes: Mutex::new(HashMap::new()),
            doormen: Mutex::new(HashMap::new()),
            remote_endpoints: Mutex::new(HashMap::new()),
            local_endpoints: Mutex::new(HashMap::new()),
            datagram_sinks: Mutex::new(HashMap::new()),
            datagram_sources: Mutex::new(HashMap::new()),
            pending_connects: Mutex::new(VecDeque::new()),
            scribe_data: HandleTable::new(move || ScribeData {
                recv_policy: ReceivePolicy::at_most(read_max),
                ..Default::default()
            }),
            doorman_data: HandleTable::default(),
            endpoint_data: HandleTable::default(),
            sink_data: HandleTable::default(),
            source_data: HandleTable::default(),
        })
    }

    /// Environment config and a collecting scheduler.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(MuxConfig::from_env(), Arc::new(InjectorScheduler::new()))
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // provide_* / new_*
    // ------------------------------------------------------------------

    pub fn provide_scribe(&self, host: impl Into<String>, port: u16, hdl: ConnectionHandle) {
        provide(&self.scribes, (host.into(), port), hdl);
    }

    pub fn provide_acceptor(&self, port: u16, hdl: AcceptHandle) {
        provide(&self.doormen, port, hdl);
        self.doorman_data.with(hdl, |d| d.port = port);
    }

    pub fn provide_remote_endpoint(&self, host: impl Into<String>, port: u16, hdl: EndpointHandle) {
        provide(&self.remote_endpoints, (host.into(), port), hdl);
        self.endpoint_data.with(hdl, |d| d.remote_port = port);
    }

    pub fn provide_local_endpoint(&self, port: u16, hdl: EndpointHandle) {
        provide(&self.local_endpoints, port, hdl);
    }

    pub fn provide_datagram_sink(&self, host: impl Into<String>, port: u16, hdl: DatagramSinkHandle) {
        provide(&self.datagram_sinks, (host.into(), port), hdl);
        self.sink_data.with(hdl, |d| d.port = port);
    }

    pub fn provide_datagram_source(&self, port: u16, hdl: DatagramSourceHandle) {
        provide(&self.datagram_sources, port, hdl);
        self.source_data.with(hdl, |d| d.port = port);
    }

    pub fn new_tcp_scribe(&self, host: &str, port: u16) -> ConnectionHandle {
        take(&self.scribes, &(host.to_string(), port))
    }

    pub fn new_tcp_doorman(&self, port: u16) -> (AcceptHandle, u16) {
        (take(&self.doormen, &port), port)
    }

    pub fn new_remote_endpoint(&self, host: &str, port: u16) -> EndpointHandle {
        take(&self.remote_endpoints, &(host.to_string(), port))
    }

    pub fn new_local_endpoint(&self, port: u16) -> (EndpointHandle, u16) {
        (take(&self.local_endpoints, &port), port)
    }

    pub fn new_datagram_sink(&self, host: &str, port: u16) -> DatagramSinkHandle {
        take(&self.datagram_sinks, &(host.to_string(), port))
    }

    pub fn new_datagram_source(&self, port: u16) -> (DatagramSourceHandle, u16) {
        (take(&self.datagram_sources, &port), port)
    }

    pub fn has_pending_scribe(&self, host: &str, port: u16) -> bool {
        lock(&self.scribes).contains_key(&(host.to_string(), port))
    }

    // ------------------------------------------------------------------
    // assign_*
    // ------------------------------------------------------------------

    pub fn assign_tcp_scribe(&self, broker: &Arc<dyn Broker>, hdl: ConnectionHandle) {
        let adapter = TestScribe::new(hdl, self.weak_self.clone(), broker);
        self.scribe_data
            .with(hdl, |d| d.ptr = Some(adapter.clone() as Arc<dyn Scribe>));
        kdebug!("{} assigned", hdl);
        broker.add_scribe(adapter);
    }

    pub fn assign_tcp_doorman(&self, broker: &Arc<dyn Broker>, hdl: AcceptHandle) {
        let adapter = TestDoorman::new(hdl, self.weak_self.clone(), broker);
        self.doorman_data
            .with(hdl, |d| d.ptr = Some(adapter.clone() as Arc<dyn Doorman>));
        kdebug!("{} assigned", hdl);
        broker.add_doorman(adapter);
    }

    pub fn assign_endpoint(&self, broker: &Arc<dyn Broker>, hdl: EndpointHandle) {
        let adapter = TestEndpoint::new(hdl, self.weak_self.clone(), broker);
        self.endpoint_data
            .with(hdl, |d| d.ptr = Some(adapter.clone() as Arc<dyn Endpoint>));
        kdebug!("{} assigned", hdl);
        broker.add_endpoint(adapter);
    }

    pub fn assign_datagram_sink(&self, broker: &Arc<dyn Broker>, hdl: DatagramSinkHandle) {
        let adapter = TestDatagramSink::new(hdl, self.weak_self.clone(), broker);
        self.sink_data
            .with(hdl, |d| d.ptr = Some(adapter.clone() as Arc<dyn DatagramSink>));
        kdebug!("{} assigned", hdl);
        broker.add_datagram_sink(adapter);
    }

    pub fn assign_datagram_source(&self, broker: &Arc<dyn Broker>, hdl: DatagramSourceHandle) {
        let adapter = TestDatagramSource::new(hdl, self.weak_self.clone(), broker);
        self.source_data
            .with(hdl, |d| d.ptr = Some(adapter.clone() as Arc<dyn DatagramSource>));
        kdebug!("{} assigned", hdl);
        broker.add_datagram_source(adapter);
    }

    // ------------------------------------------------------------------
    // add_*
    // ------------------------------------------------------------------

    pub fn add_tcp_scribe(
        &self,
        broker: &Arc<dyn Broker>,
        host: &str,
        port: u16,
    ) -> MuxResult<ConnectionHandle> {
        let hdl = self.new_tcp_scribe(host, port);
        if !hdl.is_valid() {
            return Err(MuxError::NoSuchHandle(format!("tcp scribe {}:{}", host, port)));
        }
        self.assign_tcp_scribe(broker, hdl);
        Ok(hdl)
    }

    pub fn add_tcp_doorman(
        &self,
        broker: &Arc<dyn Broker>,
        port: u16,
    ) -> MuxResult<(AcceptHandle, u16)> {
        let (hdl, port) = self.new_tcp_doorman(port);
        if !hdl.is_valid() {
            return Err(MuxError::NoSuchHandle(format!("tcp doorman :{}", port)));
        }
        self.doorman_data.with(hdl, |d| d.port = port);
        self.assign_tcp_doorman(broker, hdl);
        Ok((hdl, port))
    }

    pub fn add_remote_endpoint(
        &self,
        broker: &Arc<dyn Broker>,
        host: &str,
        port: u16,
    ) -> MuxResult<EndpointHandle> {
        let hdl = self.new_remote_endpoint(host, port);
        if !hdl.is_valid() {
            return Err(MuxError::NoSuchHandle(format!("remote endpoint {}:{}", host, port)));
        }
        self.assign_endpoint(broker, hdl);
        Ok(hdl)
    }

    pub fn add_local_endpoint(
        &self,
        broker: &Arc<dyn Broker>,
        port: u16,
    ) -> MuxResult<(EndpointHandle, u16)> {
        let (hdl, port) = self.new_local_endpoint(port);
        if !hdl.is_valid() {
            return Err(MuxError::NoSuchHandle(format!("local endpoint :{}", port)));
        }
        self.endpoint_data.with(hdl, |d| d.local_port = port);
        self.assign_endpoint(broker, hdl);
        Ok((hdl, port))
    }

    pub fn add_datagram_sink(
        &self,
        broker: &Arc<dyn Broker>,
        host: &str,
        port: u16,
    ) -> MuxResult<DatagramSinkHandle> {
        let hdl = self.new_datagram_sink(host, port);
        if !hdl.is_valid() {
            return Err(MuxError::NoSuchHandle(format!("datagram sink {}:{}", host, port)));
        }
        self.assign_datagram_sink(broker, hdl);
        Ok(hdl)
    }

    pub fn add_datagram_source(
        &self,
        broker: &Arc<dyn Broker>,
        port: u16,
    ) -> MuxResult<(DatagramSourceHandle, u16)> {
        let (hdl, port) = self.new_datagram_source(port);
        if !hdl.is_valid() {
            return Err(MuxError::NoSuchHandle(format!("datagram source :{}", port)));
        }
        self.source_data.with(hdl, |d| d.port = port);
        self.assign_datagram_source(broker, hdl);
        Ok((hdl, port))
    }

    // Native-socket entry points exist for interface parity only. Reaching
    // one means the harness is wired to production code.

    pub fn add_tcp_scribe_native(&self, _broker: &Arc<dyn Broker>, fd: NativeSocket) -> ! {
        native_socket_abort("add_tcp_scribe", fd)
    }

    pub fn add_tcp_doorman_native(&self, _broker: &Arc<dyn Broker>, fd: NativeSocket) -> ! {
        native_socket_abort("add_tcp_doorman", fd)
    }

    pub fn add_endpoint_native(&self, _broker: &Arc<dyn Broker>, fd: NativeSocket) -> ! {
        native_socket_abort("add_endpoint", fd)
    }

    pub fn add_datagram_sink_native(&self, _broker: &Arc<dyn Broker>, fd: NativeSocket) -> ! {
        native_socket_abort("add_datagram_sink", fd)
    }

    pub fn add_datagram_source_native(&self, _broker: &Arc<dyn Broker>, fd: NativeSocket) -> ! {
        native_socket_abort("add_datagram_source", fd)
    }

    // ------------------------------------------------------------------
    // Record access
    // ------------------------------------------------------------------

    /// Run `f` on the record of `hdl`. `f` must not call into the reactor.
    pub fn with_record<H: VirtualHandle, R>(&self, hdl: H, f: impl FnOnce(&mut H::Record) -> R) -> R {
        H::table(self).with(hdl, f)
    }

    pub fn passive_mode<H: VirtualHandle>(&self, hdl: H) -> bool {
        self.with_record(hdl, |d| *d.passive_mode())
    }

    pub fn set_passive_mode<H: VirtualHandle>(&self, hdl: H, passive: bool) {
        self.with_record(hdl, |d| *d.passive_mode() = passive);
    }

    pub fn stopped_reading<H: VirtualHandle>(&self, hdl: H) -> bool {
        self.with_record(hdl, |d| *d.stopped_reading())
    }

    pub fn has_impl<H: VirtualHandle>(&self, hdl: H) -> bool {
        self.with_record(hdl, |d| d.has_impl())
    }

    /// Bytes sent by the peer and not yet delivered.
    pub fn virtual_network_buffer(&self, hdl: ConnectionHandle) -> Vec<u8> {
        self.scribe_data.with(hdl, |d| d.xbuf.clone())
    }

    pub fn output_buffer(&self, hdl: ConnectionHandle) -> Vec<u8> {
        self.scribe_data.with(hdl, |d| d.wr_buf.clone())
    }

    pub fn input_buffer(&self, hdl: ConnectionHandle) -> Vec<u8> {
        self.scribe_data.with(hdl, |d| d.rd_buf.clone())
    }

    pub fn read_config(&self, hdl: ConnectionHandle) -> ReceivePolicy {
        self.scribe_data.with(hdl, |d| d.recv_policy)
    }

    pub fn set_read_config(&self, hdl: ConnectionHandle, policy: ReceivePolicy) {
        self.scribe_data.with(hdl, |d| d.recv_policy = policy);
    }

    pub fn ack_writes(&self, hdl: ConnectionHandle) -> bool {
        self.scribe_data.with(hdl, |d| d.ack_writes)
    }

    pub fn acceptor_port(&self, hdl: AcceptHandle) -> u16 {
        self.doorman_data.with(hdl, |d| d.port)
    }

    pub fn add_pending_connect(&self, acceptor: AcceptHandle, conn: ConnectionHandle) {
        lock(&self.pending_connects).push_back((acceptor, conn));
    }

    pub fn has_pending_connect(&self, acceptor: AcceptHandle) -> bool {
        lock(&self.pending_connects).iter().any(|(a, _)| *a == acceptor)
    }

    fn take_pending_connect(&self, acceptor: AcceptHandle) -> Option<ConnectionHandle> {
        let mut pending = lock(&self.pending_connects);
        let pos = pending.iter().position(|(a, _)| *a == acceptor)?;
        pending.remove(pos).map(|(_, c)| c)
    }

    // ------------------------------------------------------------------
    // Virtual network
    // ------------------------------------------------------------------

    /// The peer writes `bytes` to `hdl`; deliver right away.
    pub fn virtual_send(&self, hdl: ConnectionHandle, bytes: &[u8]) {
        self.scribe_data.with(hdl, |d| d.xbuf.extend_from_slice(bytes));
        self.read_data(hdl);
    }

    /// Deliver buffered bytes of `hdl` according to its receive policy.
    ///
    /// Queued resumables run first. If `hdl` still has no adapter afterwards
    /// this blocks on the queue until one is installed.
    pub fn read_data(&self, hdl: ConnectionHandle) {
        if self.passive_mode(hdl) {
            return;
        }
        self.flush_runnables();
        let scribe = loop {
            if let Some(ptr) = self.scribe_data.with(hdl, |d| d.ptr.clone()) {
                break ptr;
            }
            self.exec_runnable();
        };
        self.deliver(
            hdl,
            |d| {
                let policy = d.recv_policy;
                d.rd_buf = policy.next_chunk(&mut d.xbuf)?;
                Some((d.rd_buf.clone(), policy.repeats()))
            },
            |buf| scribe.consume(buf),
        );
    }

    /// The peer sends one datagram to endpoint `hdl`.
    pub fn virtual_send_datagram(&self, hdl: EndpointHandle, bytes: &[u8]) {
        self.endpoint_data.with(hdl, |d| d.xbuf.push_back(bytes.to_vec()));
        self.read_datagrams(hdl);
    }

    /// Deliver queued datagrams of `hdl`, each cut to the datagram size.
    pub fn read_datagrams(&self, hdl: EndpointHandle) {
        if self.passive_mode(hdl) {
            return;
        }
        self.flush_runnables();
        let Some(endpoint) = self.endpoint_data.with(hdl, |d| d.ptr.clone()) else {
            return;
        };
        self.deliver(
            hdl,
            |d| pop_datagram(&mut d.xbuf, d.datagram_size, &mut d.rd_buf),
            |buf| endpoint.consume(buf),
        );
    }

    /// The peer sends one datagram to source `hdl`.
    pub fn virtual_send_source_datagram(&self, hdl: DatagramSourceHandle, bytes: &[u8]) {
        self.source_data.with(hdl, |d| d.xbuf.push_back(bytes.to_vec()));
        self.read_source_datagrams(hdl);
    }

    pub fn read_source_datagrams(&self, hdl: DatagramSourceHandle) {
        if self.passive_mode(hdl) {
            return;
        }
        self.flush_runnables();
        let Some(source) = self.source_data.with(hdl, |d| d.ptr.clone()) else {
            return;
        };
        self.deliver(
            hdl,
            |d| pop_datagram(&mut d.xbuf, d.datagram_size, &mut d.rd_buf),
            |buf| source.consume(buf),
        );
    }

    /// Cut chunks with `next` and hand them to `consume` until `next` has
    /// nothing more or the consumer rejects one.
    ///
    /// `next` moves each chunk into the record's read buffer and returns a
    /// copy: the consumer runs after the record lock is released.
    fn deliver<H: VirtualHandle>(
        &self,
        hdl: H,
        mut next: impl FnMut(&mut H::Record) -> Option<(Vec<u8>, bool)>,
        consume: impl Fn(&[u8]) -> bool,
    ) {
        loop {
            let Some((chunk, more)) = self.with_record(hdl, |d| next(d)) else {
                break;
            };
            ktrace!("{}: delivering {} bytes", hdl, chunk.len());
            if !consume(&chunk) {
                kdebug!("{}: consumer rejected data, going passive", hdl);
                self.set_passive_mode(hdl, true);
                break;
            }
            if !more {
                break;
            }
        }
    }

    /// Let acceptor `hdl` accept one pending connection.
    ///
    /// Returns `false` if the acceptor is passive, has no adapter, or has
    /// nothing pending. A failed accept step makes the acceptor passive.
    pub fn accept_connection(&self, hdl: AcceptHandle) -> bool {
        let (passive, doorman) = self.doorman_data.with(hdl, |d| (d.passive_mode, d.ptr.clone()));
        if passive {
            return false;
        }
        let Some(doorman) = doorman else {
            return false;
        };
        let Some(conn) = self.take_pending_connect(hdl) else {
            return false;
        };
        if !doorman.new_connection(conn) {
            kdebug!("{}: accept of {} failed, going passive", hdl, conn);
            self.set_passive_mode(hdl, true);
        }
        true
    }

    // ------------------------------------------------------------------
    // Resumable queue
    // ------------------------------------------------------------------

    fn queue(&self) -> MutexGuard<'_, VecDeque<ResumablePtr>> {
        lock(&self.resumables)
    }

    /// Number of resumables waiting in the reactor queue.
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Queue I/O actors and function objects; forward anything else to
    /// the external scheduler.
    pub fn exec_later(&self, ptr: ResumablePtr) {
        match ptr.subtype() {
            ResumableKind::IoActor | ResumableKind::FunctionObject => {
                let mut q = self.queue();
                q.push_back(ptr);
                self.cond.notify_all();
            }
            _ => self.scheduler.enqueue(ptr),
        }
    }

    /// Pop and run one resumable, blocking until one is queued.
    pub fn exec_runnable(&self) {
        let ptr = {
            let mut q = self.queue();
            loop {
                if let Some(ptr) = q.pop_front() {
                    break ptr;
                }
                q = self.cond.wait(q).unwrap_or_else(|e| e.into_inner());
            }
        };
        self.exec(ptr);
    }

    /// Run one resumable if any is queued.
    pub fn try_exec_runnable(&self) -> bool {
        let Some(ptr) = self.queue().pop_front() else {
            return false;
        };
        self.exec(ptr);
        true
    }

    /// Run queued resumables in bursts until a burst finds the queue empty.
    pub fn flush_runnables(&self) {
        let burst = self.config.flush_burst.max(1);
        let mut runnables = Vec::with_capacity(burst);
        loop {
            {
                let mut q = self.queue();
                while runnables.len() < burst {
                    match q.pop_front() {
                        Some(ptr) => runnables.push(ptr),
                        None => break,
                    }
                }
            }
            if runnables.is_empty() {
                break;
            }
            ktrace!("flushing burst of {}", runnables.len());
            for ptr in runnables.drain(..) {
                self.exec(ptr);
            }
        }
    }

    fn exec(&self, ptr: ResumablePtr) {
        match ptr.resume(self, self.config.max_throughput) {
            ResumeResult::ResumeLater => self.exec_later(ptr),
            ResumeResult::Done | ResumeResult::AwaitingMessage => drop(ptr),
            // the resumable deals with its own shutdown
            ResumeResult::ShutdownExecutionUnit => {}
        }
    }
}

impl Drop for TestMultiplexer {
    fn drop(&mut self) {
        let queued: Vec<ResumablePtr> = self.queue().drain(..).collect();
        let records = self.scribe_data.take_all().len()
            + self.doorman_data.take_all().len()
            + self.endpoint_data.take_all().len()
            + self.sink_data.take_all().len()
            + self.source_data.take_all().len();
        ktrace!(
            "reactor dropped: released {} resumables, {} records",
            queued.len(),
            records
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::AnyHandle;
    use crate::resumable::{FnResumable, Resumable};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Broker that records everything and rejects on request.
    #[derive(Default)]
    struct TestBroker {
        scribes: Mutex<Vec<Arc<dyn Scribe>>>,
        doormen: Mutex<Vec<Arc<dyn Doorman>>>,
        endpoints: Mutex<Vec<Arc<dyn Endpoint>>>,
        sinks: Mutex<Vec<Arc<dyn DatagramSink>>>,
        sources: Mutex<Vec<Arc<dyn DatagramSource>>>,
        chunks: Mutex<Vec<(ConnectionHandle, Vec<u8>)>>,
        datagrams: Mutex<Vec<Vec<u8>>>,
        connections: Mutex<Vec<(AcceptHandle, ConnectionHandle)>>,
        detached: Mutex<Vec<AnyHandle>>,
        /// Reject the next delivered chunk or datagram
        reject_next: AtomicBool,
        refuse_connections: AtomicBool,
    }

    impl TestBroker {
        fn chunk_sizes(&self) -> Vec<usize> {
            lock(&self.chunks).iter().map(|(_, c)| c.len()).collect()
        }

        fn accept_data(&self) -> bool {
            !self.reject_next.swap(false, Ordering::SeqCst)
        }
    }

    impl Broker for TestBroker {
        fn add_scribe(&self, scribe: Arc<dyn Scribe>) {
            lock(&self.scribes).push(scribe);
        }
        fn add_doorman(&self, doorman: Arc<dyn Doorman>) {
            lock(&self.doormen).push(doorman);
        }
        fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
            lock(&self.endpoints).push(endpoint);
        }
        fn add_datagram_sink(&self, sink: Arc<dyn DatagramSink>) {
            lock(&self.sinks).push(sink);
        }
        fn add_datagram_source(&self, source: Arc<dyn DatagramSource>) {
            lock(&self.sources).push(source);
        }
        fn new_data(&self, hdl: ConnectionHandle, buf: &[u8]) -> bool {
            lock(&self.chunks).push((hdl, buf.to_vec()));
            self.accept_data()
        }
        fn new_connection(&self, acceptor: AcceptHandle, hdl: ConnectionHandle) -> bool {
            lock(&self.connections).push((acceptor, hdl));
            !self.refuse_connections.load(Ordering::SeqCst)
        }
        fn new_endpoint_datagram(&self, _hdl: EndpointHandle, buf: &[u8]) -> bool {
            lock(&self.datagrams).push(buf.to_vec());
            self.accept_data()
        }
        fn new_source_datagram(&self, _hdl: DatagramSourceHandle, buf: &[u8]) -> bool {
            lock(&self.datagrams).push(buf.to_vec());
            self.accept_data()
        }
        fn detached(&self, hdl: AnyHandle) {
            lock(&self.detached).push(hdl);
        }
    }

    fn setup() -> (Arc<TestMultiplexer>, Arc<TestBroker>, Arc<dyn Broker>) {
        let mux = TestMultiplexer::new(MuxConfig::new(), Arc::new(InjectorScheduler::new()));
        let broker = Arc::new(TestBroker::default());
        let dyn_broker: Arc<dyn Broker> = broker.clone();
        (mux, broker, dyn_broker)
    }

    fn conn(n: i64) -> ConnectionHandle {
        ConnectionHandle::from_int(n)
    }

    fn connected(policy: ReceivePolicy) -> (Arc<TestMultiplexer>, Arc<TestBroker>, ConnectionHandle) {
        let (mux, broker, dyn_broker) = setup();
        mux.provide_scribe("localhost", 80, conn(1));
        let hdl = mux.add_tcp_scribe(&dyn_broker, "localhost", 80).unwrap();
        mux.set_read_config(hdl, policy);
        (mux, broker, hdl)
    }

    /// Resumable with a scripted outcome.
    struct Scripted {
        kind: ResumableKind,
        later: AtomicUsize,
        finish: ResumeResult,
        runs: AtomicUsize,
    }

    impl Scripted {
        fn new(kind: ResumableKind, later: usize, finish: ResumeResult) -> Arc<Self> {
            Arc::new(Self {
                kind,
                later: AtomicUsize::new(later),
                finish,
                runs: AtomicUsize::new(0),
            })
        }
    }

    impl Resumable for Scripted {
        fn subtype(&self) -> ResumableKind {
            self.kind
        }
        fn resume(&self, _mux: &TestMultiplexer, max_throughput: usize) -> ResumeResult {
            assert_eq!(max_throughput, 1);
            self.runs.fetch_add(1, Ordering::SeqCst);
            let left = self.later.load(Ordering::SeqCst);
            if left > 0 {
                self.later.store(left - 1, Ordering::SeqCst);
                ResumeResult::ResumeLater
            } else {
                self.finish
            }
        }
    }

    #[test]
    fn test_provide_is_single_use() {
        let (mux, _, _) = setup();
        mux.provide_scribe("localhost", 80, conn(1));
        assert!(mux.has_pending_scribe("localhost", 80));
        assert_eq!(mux.new_tcp_scribe("localhost", 80), conn(1));
        assert!(!mux.has_pending_scribe("localhost", 80));
        assert_eq!(mux.new_tcp_scribe("localhost", 80), ConnectionHandle::INVALID);
    }

    #[test]
    fn test_first_provide_wins() {
        let (mux, _, _) = setup();
        mux.provide_acceptor(8080, AcceptHandle::from_int(1));
        mux.provide_acceptor(8080, AcceptHandle::from_int(2));
        assert_eq!(mux.new_tcp_doorman(8080), (AcceptHandle::from_int(1), 8080));
        assert_eq!(mux.new_tcp_doorman(8080).0, AcceptHandle::INVALID);
    }

    #[test]
    fn test_add_unprovided_fails_without_assigning() {
        let (mux, broker, dyn_broker) = setup();
        let err = mux.add_tcp_scribe(&dyn_broker, "nowhere", 1).unwrap_err();
        assert!(matches!(err, MuxError::NoSuchHandle(_)));
        assert!(mux.add_datagram_source(&dyn_broker, 9).is_err());
        assert!(lock(&broker.scribes).is_empty());
        assert!(lock(&broker.sources).is_empty());
    }

    #[test]
    fn test_add_installs_adapter() {
        let (mux, broker, hdl) = connected(ReceivePolicy::at_most(16));
        assert!(mux.has_impl(hdl));
        let scribes = lock(&broker.scribes);
        assert_eq!(scribes.len(), 1);
        assert_eq!(scribes[0].hdl(), hdl);
        assert_eq!(scribes[0].addr(), "test");
        assert_eq!(scribes[0].port(), 1);
    }

    #[test]
    fn test_default_read_policy_from_config() {
        let mux = TestMultiplexer::new(
            MuxConfig::new().default_read_max(5),
            Arc::new(InjectorScheduler::new()),
        );
        assert_eq!(mux.read_config(conn(3)), ReceivePolicy::AtMost(5));
    }

    #[test]
    fn test_exactly_policy() {
        let (mux, broker, hdl) = connected(ReceivePolicy::exactly(3));
        mux.virtual_send(hdl, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(broker.chunk_sizes(), vec![3, 3]);
        assert_eq!(mux.virtual_network_buffer(hdl), vec![7]);
        assert_eq!(mux.input_buffer(hdl), vec![4, 5, 6]);
    }

    #[test]
    fn test_at_least_policy() {
        let (mux, broker, hdl) = connected(ReceivePolicy::at_least(3));
        mux.virtual_send(hdl, &[1, 2]);
        assert!(broker.chunk_sizes().is_empty());
        mux.virtual_send(hdl, &[3, 4, 5, 6, 7]);
        assert_eq!(broker.chunk_sizes(), vec![7]);
        assert!(mux.virtual_network_buffer(hdl).is_empty());
        assert_eq!(mux.input_buffer(hdl), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_at_most_policy() {
        let (mux, broker, hdl) = connected(ReceivePolicy::at_most(3));
        mux.virtual_send(hdl, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(broker.chunk_sizes(), vec![3, 3, 1]);
        let chunks = lock(&broker.chunks);
        assert_eq!(chunks[2], (hdl, vec![7]));
    }

    #[test]
    fn test_policy_changed_by_consumer() {
        let (mux, broker, hdl) = connected(ReceivePolicy::exactly(2));
        let scribe = lock(&broker.scribes)[0].clone();
        scribe.configure_read(ReceivePolicy::exactly(4));
        mux.virtual_send(hdl, &[0; 8]);
        assert_eq!(broker.chunk_sizes(), vec![4, 4]);
    }

    #[test]
    fn test_rejection_halts_then_resumes() {
        let (mux, broker, hdl) = connected(ReceivePolicy::at_most(3));
        broker.reject_next.store(true, Ordering::SeqCst);
        mux.virtual_send(hdl, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(broker.chunk_sizes(), vec![3]);
        assert!(mux.passive_mode(hdl));
        assert_eq!(mux.virtual_network_buffer(hdl).len(), 4);

        // still passive: nothing happens
        mux.read_data(hdl);
        assert_eq!(broker.chunk_sizes(), vec![3]);

        let scribe = lock(&broker.scribes)[0].clone();
        scribe.add_to_loop();
        mux.read_data(hdl);
        assert_eq!(broker.chunk_sizes(), vec![3, 3, 1]);
        assert!(!mux.passive_mode(hdl));
    }

    #[test]
    fn test_passive_send_only_buffers() {
        let (mux, broker, hdl) = connected(ReceivePolicy::at_most(3));
        mux.set_passive_mode(hdl, true);
        mux.virtual_send(hdl, b"abc");
        assert!(broker.chunk_sizes().is_empty());
        assert_eq!(mux.virtual_network_buffer(hdl), b"abc".to_vec());
    }

    #[test]
    fn test_read_data_runs_queue_until_adapter_installed() {
        let (mux, broker, dyn_broker) = setup();
        mux.set_read_config(conn(5), ReceivePolicy::exactly(2));
        mux.exec_later(FnResumable::new(move |m: &TestMultiplexer| {
            m.assign_tcp_scribe(&dyn_broker, conn(5));
        }));
        mux.virtual_send(conn(5), b"hi");
        assert_eq!(broker.chunk_sizes(), vec![2]);
        assert_eq!(mux.queued(), 0);
    }

    #[test]
    fn test_scribe_writes_land_in_output_buffer() {
        let (mux, broker, hdl) = connected(ReceivePolicy::at_most(3));
        let scribe = lock(&broker.scribes)[0].clone();
        scribe.write(b"pong").unwrap();
        scribe.ack_writes(true);
        assert_eq!(mux.output_buffer(hdl), b"pong".to_vec());
        assert_eq!(scribe.wr_buf().unwrap(), b"pong".to_vec());
        assert!(mux.ack_writes(hdl));
    }

    #[test]
    fn test_stop_reading_detaches() {
        let (mux, broker, hdl) = connected(ReceivePolicy::at_most(3));
        let scribe = lock(&broker.scribes)[0].clone();
        scribe.stop_reading();
        assert!(mux.stopped_reading(hdl));
        assert!(!mux.has_impl(hdl));
        assert_eq!(*lock(&broker.detached), vec![AnyHandle::Connection(hdl)]);
        // the record is still there
        assert_eq!(mux.read_config(hdl), ReceivePolicy::AtMost(3));
    }

    fn with_doorman() -> (Arc<TestMultiplexer>, Arc<TestBroker>, AcceptHandle) {
        let (mux, broker, dyn_broker) = setup();
        mux.provide_acceptor(8080, AcceptHandle::from_int(1));
        let (hdl, port) = mux.add_tcp_doorman(&dyn_broker, 8080).unwrap();
        assert_eq!(port, 8080);
        (mux, broker, hdl)
    }

    #[test]
    fn test_accept_without_adapter() {
        let (mux, _, _) = setup();
        let acc = AcceptHandle::from_int(9);
        mux.add_pending_connect(acc, conn(1));
        assert!(!mux.accept_connection(acc));
        assert!(mux.has_pending_connect(acc));
    }

    #[test]
    fn test_accept_without_pending_connect() {
        let (mux, _, acc) = with_doorman();
        assert!(!mux.accept_connection(acc));
        assert!(!mux.passive_mode(acc));
    }

    #[test]
    fn test_accept_success() {
        let (mux, broker, acc) = with_doorman();
        assert_eq!(lock(&broker.doormen)[0].port(), 8080);
        mux.add_pending_connect(acc, conn(4));
        mux.add_pending_connect(acc, conn(5));
        assert!(mux.accept_connection(acc));
        assert!(!mux.passive_mode(acc));
        assert!(mux.has_impl(conn(4)));
        assert!(!mux.has_impl(conn(5)));
        assert_eq!(*lock(&broker.connections), vec![(acc, conn(4))]);
        assert_eq!(lock(&broker.scribes).len(), 1);
    }

    #[test]
    fn test_accept_failure_goes_passive() {
        let (mux, broker, acc) = with_doorman();
        broker.refuse_connections.store(true, Ordering::SeqCst);
        mux.add_pending_connect(acc, conn(4));
        assert!(mux.accept_connection(acc));
        assert!(mux.passive_mode(acc));

        mux.add_pending_connect(acc, conn(6));
        assert!(!mux.accept_connection(acc));
        assert!(mux.has_pending_connect(acc));
    }

    #[test]
    fn test_flush_converges() {
        let (mux, _, _) = setup();
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let runs = runs.clone();
            mux.exec_later(FnResumable::new(move |m: &TestMultiplexer| {
                runs.fetch_add(1, Ordering::SeqCst);
                let runs = runs.clone();
                m.exec_later(FnResumable::new(move |_: &TestMultiplexer| {
                    runs.fetch_add(100, Ordering::SeqCst);
                }));
            }));
        }
        assert_eq!(mux.queued(), 5);
        mux.flush_runnables();
        assert_eq!(runs.load(Ordering::SeqCst), 505);
        assert_eq!(mux.queued(), 0);
    }

    #[test]
    fn test_flush_more_than_one_burst() {
        let mux = TestMultiplexer::new(MuxConfig::new().flush_burst(2), Arc::new(InjectorScheduler::new()));
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..7 {
            let runs = runs.clone();
            mux.exec_later(FnResumable::new(move |_: &TestMultiplexer| {
                runs.fetch_add(1, Ordering::SeqCst);
            }));
        }
        mux.flush_runnables();
        assert_eq!(runs.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_resume_later_requeues() {
        let (mux, _, _) = setup();
        let r = Scripted::new(ResumableKind::IoActor, 2, ResumeResult::Done);
        mux.exec_later(r.clone());
        assert!(mux.try_exec_runnable());
        assert_eq!(mux.queued(), 1);
        mux.flush_runnables();
        assert_eq!(r.runs.load(Ordering::SeqCst), 3);
        assert_eq!(mux.queued(), 0);
        assert!(!mux.try_exec_runnable());
    }

    #[test]
    fn test_terminal_outcomes_release() {
        let (mux, _, _) = setup();
        for finish in [
            ResumeResult::Done,
            ResumeResult::AwaitingMessage,
            ResumeResult::ShutdownExecutionUnit,
        ] {
            let r = Scripted::new(ResumableKind::FunctionObject, 0, finish);
            mux.exec_later(r.clone());
            mux.flush_runnables();
            assert_eq!(Arc::strong_count(&r), 1);
        }
    }

    #[test]
    fn test_other_kinds_forwarded() {
        let sched = Arc::new(InjectorScheduler::new());
        let mux = TestMultiplexer::new(MuxConfig::new(), sched.clone());
        mux.exec_later(Scripted::new(ResumableKind::ScheduledActor, 0, ResumeResult::Done));
        mux.exec_later(Scripted::new(ResumableKind::Unspecified, 0, ResumeResult::Done));
        assert_eq!(mux.queued(), 0);
        assert_eq!(sched.len(), 2);
        assert!(!mux.try_exec_runnable());
    }

    #[test]
    fn test_exec_runnable_blocks_for_other_thread() {
        let (mux, _, _) = setup();
        let ran = Arc::new(AtomicBool::new(false));
        let producer = {
            let mux = mux.clone();
            let ran = ran.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                mux.exec_later(FnResumable::new(move |_: &TestMultiplexer| {
                    ran.store(true, Ordering::SeqCst);
                }));
            })
        };
        mux.exec_runnable();
        assert!(ran.load(Ordering::SeqCst));
        producer.join().unwrap();
    }

    #[test]
    fn test_endpoint_datagrams_truncated() {
        let (mux, broker, dyn_broker) = setup();
        let ep = EndpointHandle::from_int(3);
        mux.provide_remote_endpoint("peer", 53, ep);
        assert_eq!(mux.add_remote_endpoint(&dyn_broker, "peer", 53).unwrap(), ep);
        let adapter = lock(&broker.endpoints)[0].clone();
        adapter.configure_datagram_size(4);
        mux.virtual_send_datagram(ep, b"abcdef");
        mux.virtual_send_datagram(ep, b"xy");
        assert_eq!(*lock(&broker.datagrams), vec![b"abcd".to_vec(), b"xy".to_vec()]);
        assert_eq!(adapter.rd_buf().unwrap(), b"xy".to_vec());
        assert_eq!(mux.with_record(ep, |d| d.remote_port), 53);
    }

    #[test]
    fn test_source_rejection_goes_passive() {
        let (mux, broker, dyn_broker) = setup();
        let src = DatagramSourceHandle::from_int(7);
        mux.provide_datagram_source(5000, src);
        assert_eq!(mux.add_datagram_source(&dyn_broker, 5000).unwrap(), (src, 5000));
        assert_eq!(lock(&broker.sources)[0].port(), 5000);

        mux.set_passive_mode(src, true);
        mux.virtual_send_source_datagram(src, b"one");
        mux.virtual_send_source_datagram(src, b"two");
        assert!(lock(&broker.datagrams).is_empty());

        mux.set_passive_mode(src, false);
        broker.reject_next.store(true, Ordering::SeqCst);
        mux.read_source_datagrams(src);
        assert_eq!(*lock(&broker.datagrams), vec![b"one".to_vec()]);
        assert!(mux.passive_mode(src));
        assert_eq!(mux.with_record(src, |d| d.xbuf.len()), 1);
    }

    #[test]
    fn test_local_endpoint_and_sink() {
        let (mux, broker, dyn_broker) = setup();
        mux.provide_local_endpoint(6000, EndpointHandle::from_int(1));
        let (ep, port) = mux.add_local_endpoint(&dyn_broker, 6000).unwrap();
        assert_eq!(port, 6000);
        assert_eq!(mux.with_record(ep, |d| d.local_port), 6000);

        mux.provide_datagram_sink("peer", 7000, DatagramSinkHandle::from_int(2));
        let sink = mux.add_datagram_sink(&dyn_broker, "peer", 7000).unwrap();
        let adapter = lock(&broker.sinks)[0].clone();
        assert_eq!(adapter.port(), 7000);
        adapter.write(b"dgram").unwrap();
        assert_eq!(mux.with_record(sink, |d| d.wr_buf.clone()), b"dgram".to_vec());
    }

    #[test]
    fn test_drop_releases_queue_and_adapters() {
        let (mux, broker, hdl) = connected(ReceivePolicy::at_most(3));
        let r = Scripted::new(ResumableKind::IoActor, 0, ResumeResult::Done);
        let weak_r = Arc::downgrade(&r);
        mux.exec_later(r);
        let scribe = lock(&broker.scribes)[0].clone();
        assert_eq!(Arc::strong_count(&scribe), 3);

        drop(mux);
        assert!(weak_r.upgrade().is_none());
        assert_eq!(Arc::strong_count(&scribe), 2);
        assert_eq!(scribe.write(b"x"), Err(MuxError::ReactorGone));
        assert_eq!(scribe.hdl(), hdl);
    }
}
