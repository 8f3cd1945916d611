//! Weft is a distributed serverless-compute fabric that executes user
//! functions across a cluster of hosts, with first-class support for
//! multi-process message-passing workloads.
//!
//! Two subsystems make up the core. The cluster scheduler admits batches of
//! function invocations, balances them against local and remote host
//! resources, keeps warm-executor affinity per function, and forwards spills
//! to other hosts (pushing memory snapshots ahead of them where needed). The
//! per-job messaging world gives an admitted parallel job point-to-point
//! sends and receives, the classic collectives, asynchronous request
//! handles, a 2-D Cartesian topology and one-sided remote memory access,
//! transparently across colocated and remote ranks.
//!
//! Cluster-wide metadata lives in an external key-value store behind the
//! [`state::KvStore`] contract; host-to-host traffic goes through a
//! [`transport::Transport`] registered at startup. User code runs inside
//! executors through the [`executor::ExecutorHandler`] hooks.
//!
//! EXAMPLES
//! --------
//!
//! # Scheduling a batch of invocations
//! ```
//! use weft::message::{batch_exec_factory, message_factory};
//! use weft::scheduler::scheduler;
//!
//! let msgs = vec![
//!     message_factory("demo", "echo"),
//!     message_factory("demo", "echo"),
//! ];
//! let req = batch_exec_factory(msgs);
//! let hosts = scheduler().call_functions(req).unwrap();
//! assert_eq!(hosts.len(), 2);
//! ```
//!
//! # A world of two colocated ranks
//! ```
//! use weft::message::message_factory;
//! use weft::mpi::{ints_to_bytes, MpiDatatype, MpiWorld};
//!
//! let msg = message_factory("demo", "ring");
//! let mut world = MpiWorld::new();
//! world.create(&msg, 123, 2).unwrap();
//! world.register_rank(1).unwrap();
//!
//! let data = ints_to_bytes(&[0, 1, 2]);
//! world.send(0, 1, &data, MpiDatatype::Int, 3).unwrap();
//!
//! let mut buffer = vec![0u8; 12];
//! world.recv(0, 1, &mut buffer, MpiDatatype::Int, 3, None).unwrap();
//! assert_eq!(buffer, data);
//! ```

#[macro_use]
extern crate lazy_static;

pub mod env_var;
pub mod error;
pub mod executor;
pub mod message;
pub mod mpi;
pub mod queue;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod testing;
pub mod transport;

pub use error::{Error, Result};

/// Encode a value for the wire or the KV store
pub fn serialize<T: serde::Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).unwrap()
}

/// Decode a value from the wire or the KV store
pub fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
