//! The role-management RPC surface the core consumes.
//!
//! The wire protocol and connection handling live outside the core; role
//! adjustment and handover only need these three request kinds.

use crate::raft::{NodeId, Role};
use crate::Result;

/// Placement metadata a node reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta {
    pub failure_domain: u64,
    pub weight: u64,
}

pub trait ClusterClient {
    /// Asks the node at `address` for its failure domain and weight.
    async fn describe(&self, address: &str) -> Result<NodeMeta>;

    /// Asks the leader at `address` to assign `role` to node `id`.
    async fn assign(&self, address: &str, id: NodeId, role: Role) -> Result<()>;

    /// Asks the node at `address` to transfer its leadership away.
    async fn transfer(&self, address: &str) -> Result<()>;
}
