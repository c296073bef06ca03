//! Automatic role management.
//!
//! The cluster leader periodically runs an adjustment pass: it polls every
//! node for liveness, failure domain and weight, computes the promotions
//! and demotions needed to hold the configured number of voters and
//! standbys, and applies them one at a time through the membership API.
//! A node shutting down while it is leader or voter runs a handover
//! instead: transfer leadership, promote a replacement, demote itself.
//!
//! The change computation is pure and deterministic given its inputs; the
//! same cluster view always yields the same set of changes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Error;
use crate::raft::{NodeId, Raft, Role};
use crate::rpc::ClusterClient;
use crate::Result;

/// Budget for polling a single node during adjustment and handover.
const POLL_TIMEOUT: Duration = Duration::from_millis(5000);

/// One node as seen by an adjustment pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub id: NodeId,
    pub address: String,
    pub role: Role,
    pub online: bool,
    pub failure_domain: u64,
    pub weight: u64,
}

/// A role change to apply through the membership API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub id: NodeId,
    pub role: Role,
}

/// Occurrence counts of failure domains within a role class.
#[derive(Default)]
struct DomainCounts(HashMap<u64, i64>);

impl DomainCounts {
    fn count(&self, domain: u64) -> i64 {
        self.0.get(&domain).copied().unwrap_or(0)
    }

    fn add(&mut self, domain: u64) {
        *self.0.entry(domain).or_insert(0) += 1;
    }

    fn remove(&mut self, domain: u64) {
        if let Some(count) = self.0.get_mut(&domain) {
            if *count > 0 {
                *count -= 1;
            }
        }
    }
}

/// Promotion preference: least-represented failure domain first, then
/// lower weight, then standbys ahead of spares.
fn promotion_order(a: &NodeView, b: &NodeView, domains: &DomainCounts) -> std::cmp::Ordering {
    domains
        .count(a.failure_domain)
        .cmp(&domains.count(b.failure_domain))
        .then(a.weight.cmp(&b.weight))
        .then(a.role.cmp(&b.role))
}

/// Computes the role changes needed to reach `voters` online voters and
/// `standbys` online standbys.
///
/// Mutates `cluster` in place to reflect the computed changes (so the
/// result is also the post-adjustment view) and returns the changes with
/// at most one entry per node, the last role winning.
pub fn compute_changes(
    voters: usize,
    standbys: usize,
    cluster: &mut [NodeView],
    my_id: NodeId,
) -> Vec<Change> {
    let mut changes: Vec<Change> = Vec::new();
    fn queue(changes: &mut Vec<Change>, id: NodeId, role: Role) {
        // A node already queued collapses to its final role.
        if let Some(change) = changes.iter_mut().find(|c| c.id == id) {
            change.role = role;
        } else {
            changes.push(Change { id, role });
        }
    }

    let mut voter_count = 0usize;
    let mut standby_count = 0usize;
    let mut voter_domains = DomainCounts::default();
    let mut standby_domains = DomainCounts::default();

    // Demote every offline node to spare, and count what is online.
    for node in cluster.iter_mut() {
        if !node.online && node.role != Role::Spare {
            queue(&mut changes, node.id, Role::Spare);
            node.role = Role::Spare;
        } else if node.online && node.role == Role::Voter {
            voter_count += 1;
            voter_domains.add(node.failure_domain);
        } else if node.online && node.role == Role::Standby {
            standby_count += 1;
            standby_domains.add(node.failure_domain);
        }
    }

    // Not enough voters: promote standbys and spares.
    if voter_count < voters {
        cluster.sort_by(|a, b| promotion_order(a, b, &voter_domains));
    }
    for i in 0..cluster.len() {
        if voter_count >= voters {
            break;
        }
        let node = &mut cluster[i];
        if !node.online || node.role == Role::Voter {
            continue;
        }
        queue(&mut changes, node.id, Role::Voter);
        if node.role == Role::Standby {
            standby_count -= 1;
            standby_domains.remove(node.failure_domain);
        }
        node.role = Role::Voter;
        voter_count += 1;
        voter_domains.add(node.failure_domain);
    }

    // Too many voters: demote the least attractive ones to spare, never
    // the local node. A demoted node that should end up standby is picked
    // back up below, and the two changes collapse into one.
    if voter_count > voters {
        cluster.sort_by(|a, b| promotion_order(b, a, &voter_domains));
    }
    for i in 0..cluster.len() {
        if voter_count <= voters {
            break;
        }
        let node = &mut cluster[i];
        if node.role != Role::Voter || node.id == my_id {
            continue;
        }
        queue(&mut changes, node.id, Role::Spare);
        node.role = Role::Spare;
        voter_count -= 1;
        voter_domains.remove(node.failure_domain);
    }

    // Not enough standbys: promote spares.
    if standby_count < standbys {
        cluster.sort_by(|a, b| promotion_order(a, b, &standby_domains));
    }
    for i in 0..cluster.len() {
        if standby_count >= standbys {
            break;
        }
        let node = &mut cluster[i];
        if !node.online || node.role != Role::Spare {
            continue;
        }
        queue(&mut changes, node.id, Role::Standby);
        node.role = Role::Standby;
        standby_count += 1;
        standby_domains.add(node.failure_domain);
    }

    // Too many standbys: demote the surplus.
    if standby_count > standbys {
        cluster.sort_by(|a, b| promotion_order(b, a, &standby_domains));
    }
    for i in 0..cluster.len() {
        if standby_count <= standbys {
            break;
        }
        let node = &mut cluster[i];
        if node.role != Role::Standby {
            continue;
        }
        queue(&mut changes, node.id, Role::Spare);
        node.role = Role::Spare;
        standby_count -= 1;
        standby_domains.remove(node.failure_domain);
    }

    changes
}

/// Runs adjustment and handover for one node.
pub struct RoleManager<R, C> {
    raft: Arc<R>,
    client: Arc<C>,
    config: Arc<Config>,
    changes: Mutex<VecDeque<Change>>,
}

impl<R: Raft, C: ClusterClient> RoleManager<R, C> {
    pub fn new(raft: Arc<R>, client: Arc<C>, config: Arc<Config>) -> Self {
        Self {
            raft,
            client,
            config,
            changes: Mutex::new(VecDeque::new()),
        }
    }

    /// One adjustment pass. Only the leader assigns roles, and a pass is
    /// skipped while changes from the previous one are still draining.
    pub async fn adjust(&self) {
        if !self.raft.is_leader() {
            return;
        }
        if !self.changes.lock().is_empty() {
            return;
        }
        let mut cluster = self.poll_cluster().await;
        let changes = compute_changes(
            self.config.voters,
            self.config.standbys,
            &mut cluster,
            self.config.node_id,
        );
        if changes.is_empty() {
            return;
        }
        tracing::info!(count = changes.len(), "applying role adjustments");
        self.enqueue(changes);
        self.drain().await;
    }

    fn enqueue(&self, changes: Vec<Change>) {
        let mut queue = self.changes.lock();
        for change in changes {
            if let Some(record) = queue.iter_mut().find(|c| c.id == change.id) {
                record.role = change.role;
            } else {
                queue.push_back(change);
            }
        }
    }

    /// Applies queued changes one at a time through the membership API.
    /// Failures are logged and skipped; the next adjustment pass retries.
    async fn drain(&self) {
        loop {
            let Some(change) = self.changes.lock().pop_front() else {
                return;
            };
            tracing::debug!(id = change.id, role = ?change.role, "assigning role");
            if let Err(err) = self.raft.assign(change.id, change.role).await {
                tracing::warn!(id = change.id, error = %err, "role assignment failed");
            }
        }
    }

    /// Drops queued changes without applying them. Called when the node
    /// stops so queued work does not leak.
    pub fn cancel_pending(&self) {
        self.changes.lock().clear();
    }

    /// Polls every node in the configuration for liveness, failure domain
    /// and weight. Unreachable nodes are reported offline.
    async fn poll_cluster(&self) -> Vec<NodeView> {
        let servers = self.raft.configuration();
        let polls = servers.iter().map(|server| {
            let client = self.client.clone();
            let address = server.address.clone();
            async move { tokio::time::timeout(POLL_TIMEOUT, client.describe(&address)).await }
        });
        let metas = futures::future::join_all(polls).await;

        servers
            .into_iter()
            .zip(metas)
            .map(|(server, meta)| {
                let meta = meta.ok().and_then(|meta| meta.ok());
                NodeView {
                    id: server.id,
                    address: server.address,
                    role: server.role,
                    online: meta.is_some(),
                    failure_domain: meta.map(|m| m.failure_domain).unwrap_or(0),
                    weight: meta.map(|m| m.weight).unwrap_or(0),
                }
            })
            .collect()
    }

    /// Hands this node's responsibilities over before shutdown: transfer
    /// leadership if we hold it, promote a replacement voter, demote
    /// ourselves to spare. Failure is reported but never blocks the
    /// caller's close path.
    pub async fn handover(&self) -> Result<()> {
        // Try the transfer unconditionally; Raft tells us if we are not
        // the leader.
        match self.raft.transfer().await {
            Ok(()) | Err(crate::raft::RaftError::NotLeader) => {}
            Err(err) => return Err(Error::from_raft(err)),
        }

        let my_id = self.config.node_id;
        let mut cluster = self.poll_cluster().await;

        // Pick a replacement with the same ordering adjustment uses,
        // measured against the remaining voters' domains.
        let mut domains = DomainCounts::default();
        for node in &cluster {
            if node.online && node.role == Role::Voter && node.id != my_id {
                domains.add(node.failure_domain);
            }
        }
        cluster.sort_by(|a, b| promotion_order(a, b, &domains));
        let target = cluster
            .iter()
            .find(|n| n.online && n.role != Role::Voter && n.id != my_id)
            .ok_or_else(|| Error::Handover("no promotion candidate".into()))?;

        let leader = self
            .raft
            .leader()
            .ok_or_else(|| Error::Handover("no leader to hand over to".into()))?;
        if leader.id == my_id {
            return Err(Error::Handover("leadership transfer did not move".into()));
        }

        tracing::info!(target = target.id, leader = leader.id, "handing over voter role");
        self.client
            .assign(&leader.address, target.id, Role::Voter)
            .await?;
        self.client.assign(&leader.address, my_id, Role::Spare).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, role: Role, online: bool, failure_domain: u64, weight: u64) -> NodeView {
        NodeView {
            id,
            address: format!("127.0.0.1:{}", 9000 + id),
            role,
            online,
            failure_domain,
            weight,
        }
    }

    fn role_of(cluster: &[NodeView], id: NodeId) -> Role {
        cluster.iter().find(|n| n.id == id).map(|n| n.role).unwrap()
    }

    #[test]
    fn standby_is_promoted_when_voters_are_short() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
            node(3, Role::Standby, true, 1, 1),
        ];
        compute_changes(3, 0, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 3), Role::Voter);
    }

    #[test]
    fn surplus_voter_is_demoted_but_never_the_local_node() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
        ];
        let changes = compute_changes(1, 0, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 1), Role::Voter);
        assert_eq!(role_of(&cluster, 2), Role::Spare);
        assert_eq!(changes, vec![Change { id: 2, role: Role::Spare }]);
    }

    #[test]
    fn spare_is_promoted_when_standbys_are_short() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
            node(3, Role::Voter, true, 1, 1),
            node(4, Role::Spare, true, 1, 1),
        ];
        compute_changes(3, 1, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 4), Role::Standby);
    }

    #[test]
    fn surplus_standby_is_demoted() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Standby, true, 1, 1),
        ];
        compute_changes(1, 0, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 2), Role::Spare);
    }

    #[test]
    fn offline_nodes_are_demoted_even_when_short() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
            node(3, Role::Standby, false, 1, 1),
        ];
        compute_changes(3, 1, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 3), Role::Spare);
    }

    #[test]
    fn offline_voter_is_exchanged_for_an_online_spare() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
            node(3, Role::Voter, false, 1, 1),
            node(4, Role::Spare, true, 1, 1),
        ];
        compute_changes(3, 0, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 3), Role::Spare);
        assert_eq!(role_of(&cluster, 4), Role::Voter);
    }

    #[test]
    fn offline_standby_is_exchanged_for_an_online_spare() {
        let mut cluster = vec![
            node(1, Role::Spare, true, 1, 1),
            node(2, Role::Standby, false, 1, 1),
            node(3, Role::Voter, true, 1, 1),
        ];
        compute_changes(1, 1, &mut cluster, 3);
        assert_eq!(role_of(&cluster, 1), Role::Standby);
        assert_eq!(role_of(&cluster, 2), Role::Spare);
        assert_eq!(role_of(&cluster, 3), Role::Voter);
    }

    #[test]
    fn offline_standby_is_not_promoted_despite_a_distinctive_domain() {
        // The online standby in the voters' own domain wins the promotion;
        // the offline one in a fresh domain is demoted instead.
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
            node(3, Role::Standby, true, 1, 1),
            node(4, Role::Standby, false, 2, 1),
        ];
        compute_changes(3, 1, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 3), Role::Voter);
        assert_eq!(role_of(&cluster, 4), Role::Spare);
    }

    #[test]
    fn offline_spare_is_not_promoted_despite_a_distinctive_domain() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Spare, false, 2, 1),
            node(3, Role::Spare, true, 1, 1),
        ];
        compute_changes(1, 1, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 2), Role::Spare);
        assert_eq!(role_of(&cluster, 3), Role::Standby);
    }

    #[test]
    fn promotion_prefers_underrepresented_failure_domains() {
        // Domains 1 and 2 already hold voters; the spare in domain 3 wins
        // over the lighter spare in domain 1.
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 2, 1),
            node(3, Role::Spare, true, 1, 0),
            node(4, Role::Spare, true, 3, 5),
        ];
        compute_changes(3, 0, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 4), Role::Voter);
        assert_eq!(role_of(&cluster, 3), Role::Spare);
    }

    #[test]
    fn promotion_prefers_lower_weight_within_a_domain() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Spare, true, 1, 7),
            node(3, Role::Spare, true, 1, 2),
        ];
        compute_changes(2, 0, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 3), Role::Voter);
        assert_eq!(role_of(&cluster, 2), Role::Spare);
    }

    #[test]
    fn standby_outranks_spare_for_promotion() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Spare, true, 1, 1),
            node(3, Role::Standby, true, 1, 1),
        ];
        compute_changes(2, 0, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 3), Role::Voter);
        assert_eq!(role_of(&cluster, 2), Role::Spare);
    }

    #[test]
    fn distinctive_domain_beats_lower_weight_for_voter_promotion() {
        // Both voters sit in domain 1; the heavier standby in domain 2 is
        // promoted ahead of the lighter one in domain 1.
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
            node(3, Role::Standby, true, 2, 2),
            node(4, Role::Standby, true, 1, 1),
        ];
        compute_changes(3, 1, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 3), Role::Voter);
        assert_eq!(role_of(&cluster, 4), Role::Standby);
    }

    #[test]
    fn distinctive_domain_beats_lower_weight_for_standby_promotion() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Standby, true, 1, 1),
            node(3, Role::Spare, true, 1, 1),
            node(4, Role::Spare, true, 2, 2),
        ];
        compute_changes(1, 2, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 2), Role::Standby);
        assert_eq!(role_of(&cluster, 3), Role::Spare);
        assert_eq!(role_of(&cluster, 4), Role::Standby);
    }

    #[test]
    fn four_node_adjustment_is_idempotent() {
        // Target {voters: 3, standbys: 1} over [voter, voter, standby,
        // spare]: the standby becomes voter, the spare becomes standby,
        // nothing is demoted.
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
            node(3, Role::Standby, true, 1, 1),
            node(4, Role::Spare, true, 1, 1),
        ];
        let changes = compute_changes(3, 1, &mut cluster, 1);
        assert_eq!(role_of(&cluster, 1), Role::Voter);
        assert_eq!(role_of(&cluster, 2), Role::Voter);
        assert_eq!(role_of(&cluster, 3), Role::Voter);
        assert_eq!(role_of(&cluster, 4), Role::Standby);
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&Change { id: 3, role: Role::Voter }));
        assert!(changes.contains(&Change { id: 4, role: Role::Standby }));

        // A second pass over the adjusted view changes nothing.
        let again = compute_changes(3, 1, &mut cluster, 1);
        assert!(again.is_empty());

        // And the same inputs always yield the same changes.
        let mut replay = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Voter, true, 1, 1),
            node(3, Role::Standby, true, 1, 1),
            node(4, Role::Spare, true, 1, 1),
        ];
        assert_eq!(compute_changes(3, 1, &mut replay, 1), changes);
    }

    #[test]
    fn online_counts_match_targets_when_candidates_suffice() {
        let mut cluster = vec![
            node(1, Role::Voter, true, 1, 1),
            node(2, Role::Spare, true, 2, 1),
            node(3, Role::Spare, true, 3, 1),
            node(4, Role::Spare, true, 1, 1),
            node(5, Role::Spare, true, 2, 2),
        ];
        compute_changes(3, 1, &mut cluster, 1);
        let voters = cluster
            .iter()
            .filter(|n| n.online && n.role == Role::Voter)
            .count();
        let standbys = cluster
            .iter()
            .filter(|n| n.online && n.role == Role::Standby)
            .count();
        assert_eq!(voters, 3);
        assert_eq!(standbys, 1);

        // The three voters cover all three failure domains.
        let mut domains: Vec<u64> = cluster
            .iter()
            .filter(|n| n.role == Role::Voter)
            .map(|n| n.failure_domain)
            .collect();
        domains.sort_unstable();
        assert_eq!(domains, vec![1, 2, 3]);
    }
}
