//! ZFS snapshot lifecycle and bi-directional replication engine.
//!
//! The modules mirror the components of the replication subsystem: naming
//! and retention (`name`, `retention`), the snapshot task (`snapshot`), the
//! action planner (`planner`), the stream transport (`transport`), the
//! top-level orchestrator (`replicator`), and the bi-directional link
//! manager (`bidir`). `zfs` and `rpc` are the two I/O boundaries everything
//! else is built on top of.

pub mod bidir;
pub mod config;
pub mod dataset;
pub mod error;
pub mod name;
pub mod planner;
pub mod progress;
pub mod replicator;
pub mod retention;
pub mod rpc;
pub mod services;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod zfs;

pub use error::ReplicationError;
