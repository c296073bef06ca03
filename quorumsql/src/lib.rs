//! An embeddable SQL engine that replicates every write across a cluster.
//!
//! Applications open a [`Database`] backed by the in-memory VFS, create a
//! [`Leader`] connection against it and submit [`Exec`] requests. A write
//! statement runs through SQLite locally, the WAL frames it produced are
//! captured as a [`quorumsql_replication::FramesEntry`] and handed to the
//! consensus layer, and the request completes only once a quorum holds the
//! entry. The [`RoleManager`] keeps the cluster's voter and standby
//! placement healthy as nodes come and go.
//!
//! The consensus implementation itself, the client wire protocol and the
//! transport are consumed through the [`raft::Raft`] and
//! [`rpc::ClusterClient`] interfaces and live elsewhere.
#![allow(async_fn_in_trait)]

pub mod addr;
pub mod config;
pub mod database;
pub mod error;
pub mod leader;
pub mod raft;
pub mod roles;
pub mod rpc;

pub use config::Config;
pub use database::Database;
pub use error::Error;
pub use leader::{Exec, ExecHandle, ExecResult, ExecState, Leader, Work};
pub use raft::{NodeId, Raft, RaftError, Role, ServerInfo};
pub use roles::{compute_changes, Change, NodeView, RoleManager};

pub type Result<T> = std::result::Result<T, Error>;
