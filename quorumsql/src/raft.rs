//! The interface the core consumes from the consensus layer.
//!
//! Log storage, elections, membership changes and snapshot transport all
//! live behind this trait; the core only submits frames entries, waits for
//! barriers, and asks for role and leadership changes.

use quorumsql_replication::FramesEntry;

pub type NodeId = u64;

/// Cluster roles. Voters vote and hold quorum copies, standbys receive
/// entries without voting, spares receive nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Voter = 0,
    Standby = 1,
    Spare = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: NodeId,
    pub address: String,
    pub role: Role,
}

/// Errors reported by the consensus layer. Translated to client-facing
/// errors only at the leader-exec boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RaftError {
    #[error("this node is not the raft leader")]
    NotLeader,
    #[error("leadership was lost")]
    LeadershipLost,
    #[error("a configuration change is already in progress")]
    CantChange,
    #[error("{0}")]
    Other(String),
}

pub trait Raft {
    fn id(&self) -> NodeId;

    fn is_leader(&self) -> bool;

    /// The current leader, if one is known.
    fn leader(&self) -> Option<ServerInfo>;

    /// The current cluster configuration.
    fn configuration(&self) -> Vec<ServerInfo>;

    /// Resolves once every entry committed before the call has been applied
    /// locally, so a read that follows observes leader state.
    async fn barrier(&self) -> Result<(), RaftError>;

    /// Submits a frames entry and resolves once it is committed (durably
    /// replicated to a quorum of voters and applied locally).
    async fn apply(&self, entry: FramesEntry) -> Result<(), RaftError>;

    /// Asks the leader to transfer leadership to another voter.
    async fn transfer(&self) -> Result<(), RaftError>;

    /// Changes a node's role through the membership API. Must run on the
    /// leader.
    async fn assign(&self, id: NodeId, role: Role) -> Result<(), RaftError>;
}
