//! # gvstream-testmux
//!
//! Deterministic, single-driver reactor for testing brokers and stream
//! actors without real sockets.
//!
//! The test driver decides everything: which handle an address resolves
//! to (`provide_*`), what the peer sends (`virtual_send*`), when pending
//! connections are accepted (`accept_connection`), and when queued
//! resumables run (`exec_runnable`, `flush_runnables`).
//!
//! ## Modules
//!
//! - `handle` - Virtual handle types
//! - `policy` - Receive policies for stream connections
//! - `broker` - Broker and adapter traits
//! - `adapters` - Adapters backed by reactor records
//! - `records` - Per-handle state
//! - `resumable` - Units of work for the reactor queue
//! - `scheduler` - Scheduler seam for forwarded resumables
//! - `multiplexer` - The reactor itself
//! - `config` - Reactor configuration
//! - `error` - Error types

pub mod handle;
pub mod policy;
pub mod broker;
pub mod adapters;
pub mod records;
pub mod resumable;
pub mod scheduler;
pub mod multiplexer;
pub mod config;
pub mod error;

// Re-exports for convenience
pub use handle::{
    AcceptHandle, AnyHandle, ConnectionHandle, DatagramSinkHandle, DatagramSourceHandle,
    EndpointHandle,
};
pub use policy::ReceivePolicy;
pub use broker::{Broker, DatagramSink, DatagramSource, Doorman, Endpoint, Scribe, Transport};
pub use adapters::{
    TestDatagramSink, TestDatagramSource, TestDoorman, TestEndpoint, TestScribe, VirtualAdapter,
};
pub use records::{HandleRecord, HandleTable, VirtualHandle};
pub use resumable::{FnResumable, Resumable, ResumableKind, ResumablePtr, ResumeResult};
pub use scheduler::{ExecutionScheduler, InjectorScheduler};
pub use multiplexer::{NativeSocket, TestMultiplexer};
pub use config::MuxConfig;
pub use error::{MuxError, MuxResult};
