//! # gvstream-core
//!
//! Flow-controlled outbound side of actor streams: paths, downstream
//! managers, and the fused router that fans one stream across several
//! sub-protocols.
//!
//! This crate knows nothing about sockets or schedulers. The
//! deterministic reactor lives in `gvstream-testmux`.
//!
//! ## Modules
//!
//! - `slot` - Stream slot identifiers
//! - `path` - Outbound paths and credit bookkeeping
//! - `outbox` - Downstream messages and the outbox they are sent through
//! - `manager` - The `DownstreamManager` trait
//! - `broadcast` - Broadcast downstream manager
//! - `fused` - Router over a fixed set of nested managers
//! - `coordinator` - Scoped action queue
//! - `config` - Stream configuration
//! - `error` - Error types
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod slot;
pub mod path;
pub mod outbox;
pub mod manager;
pub mod broadcast;
pub mod fused;
pub mod coordinator;
pub mod config;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use slot::{StreamSlot, StreamSlots};
pub use path::{ActorAddr, OutboundPath};
pub use outbox::{Batch, DownstreamMsg, Envelope, Outbox};
pub use manager::{DownstreamManager, PathAlgorithm};
pub use broadcast::BroadcastManager;
pub use fused::{FusedDownstreamManager, ManagerId};
pub use coordinator::{Action, Disposable, DisposableFlag, ScopedCoordinator};
pub use config::StreamConfig;
pub use error::{RouteError, RouteResult, StreamError};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};
