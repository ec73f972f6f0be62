//! Node lifecycle and replication-group membership.
//!
//! Consensus roles (status, term, applied) are recorded exactly as the
//! consensus layer reports them; nothing here computes an election.
//! Suffrage only moves forward one step at a time
//! (`NonVoter -> Staging -> Voter`) and a group promotes at most one
//! member at a time. Demotion is removal followed by a fresh add.

use serde::Serialize;
use tracing::{debug, info, warn};

use sliced_core::*;
use sliced_state::*;

// ── Nodes ─────────────────────────────────────────────────────────

/// Register a node, or refresh the facts of an active one.
pub fn init_node(state: &mut ClusterState, node: &Node, at: Timestamp) -> TxResult<Applied> {
    if node.id.is_empty() {
        return Err(TxError::InvalidCommand("node id must not be empty".into()));
    }
    let record = match state.nodes.get(&node.id) {
        Some(existing) => {
            if existing.lifecycle() != NodeLifecycle::Active {
                return Err(TxError::InvalidLifecycle {
                    node_id: node.id.clone(),
                    reason: format!("cannot re-init a {:?} node", existing.lifecycle()),
                });
            }
            check_clock(existing, at)?;
            Node {
                created: existing.created,
                inited: existing.inited,
                changed: at,
                dropped: 0,
                removed: 0,
                ..node.clone()
            }
        }
        None => Node {
            created: if node.created > 0 { node.created } else { at },
            inited: at,
            changed: at,
            dropped: 0,
            removed: 0,
            ..node.clone()
        },
    };
    if state.nodes.get(&node.id) == Some(&record) {
        return Ok(Applied::unchanged());
    }
    info!(node_id = %record.id, host = %record.host, "node initialized");
    state.nodes.insert(record.id.clone(), record);
    Ok(Applied::changed(vec![Event::NodeChanged {
        node_id: node.id.clone(),
        lifecycle: NodeLifecycle::Active,
    }]))
}

/// Active -> Dropped.
pub fn drop_node(state: &mut ClusterState, node_id: &str, at: Timestamp) -> TxResult<Applied> {
    let node = state.node(node_id)?;
    if node.lifecycle() != NodeLifecycle::Active {
        return Err(TxError::InvalidLifecycle {
            node_id: node_id.to_string(),
            reason: format!("cannot drop a {:?} node", node.lifecycle()),
        });
    }
    check_clock(node, at)?;
    if let Some(node) = state.nodes.get_mut(node_id) {
        node.dropped = at;
        node.changed = at;
    }
    info!(%node_id, "node dropped");
    Ok(Applied::changed(vec![Event::NodeChanged {
        node_id: node_id.to_string(),
        lifecycle: NodeLifecycle::Dropped,
    }]))
}

/// Dropped -> Removed. Refused while the node is still a group member.
pub fn remove_node(state: &mut ClusterState, node_id: &str, at: Timestamp) -> TxResult<Applied> {
    let node = state.node(node_id)?;
    if node.lifecycle() != NodeLifecycle::Dropped {
        return Err(TxError::InvalidLifecycle {
            node_id: node_id.to_string(),
            reason: format!("cannot remove a {:?} node", node.lifecycle()),
        });
    }
    check_clock(node, at)?;
    let groups = state.groups_of(node_id);
    if !groups.is_empty() {
        return Err(TxError::InvalidLifecycle {
            node_id: node_id.to_string(),
            reason: format!("still a member of groups {groups:?}"),
        });
    }
    if let Some(node) = state.nodes.get_mut(node_id) {
        node.removed = at;
        node.changed = at;
    }
    info!(%node_id, "node removed");
    Ok(Applied::changed(vec![Event::NodeChanged {
        node_id: node_id.to_string(),
        lifecycle: NodeLifecycle::Removed,
    }]))
}

fn check_clock(node: &Node, at: Timestamp) -> TxResult<()> {
    if at < node.changed {
        return Err(TxError::InvalidLifecycle {
            node_id: node.id.clone(),
            reason: format!("timestamp {at} precedes last change {}", node.changed),
        });
    }
    Ok(())
}

// ── Groups ────────────────────────────────────────────────────────

pub fn create_group(state: &mut ClusterState, name: &str) -> TxResult<Applied> {
    if name.is_empty() {
        return Err(TxError::InvalidCommand("group name must not be empty".into()));
    }
    if state.groups.values().any(|g| g.name == name) {
        return Err(TxError::AlreadyExists(format!("group {name}")));
    }
    let id = state.seq.next_group();
    state.groups.insert(
        id,
        NodeGroup {
            id,
            name: name.to_string(),
            members: Vec::new(),
        },
    );
    info!(group_id = id, %name, "group created");
    Ok(Applied::changed(vec![Event::GroupCreated {
        group_id: id,
        name: name.to_string(),
    }]))
}

/// Add a member or promote an existing one by one suffrage step.
pub fn add_node_to_group(
    state: &mut ClusterState,
    node_id: &str,
    group_id: GroupId,
    suffrage: Suffrage,
    bootstrap: bool,
    address: &str,
) -> TxResult<Applied> {
    let node = state.node(node_id)?;
    if node.lifecycle() != NodeLifecycle::Active {
        return Err(TxError::InvalidLifecycle {
            node_id: node_id.to_string(),
            reason: format!("a {:?} node cannot join a group", node.lifecycle()),
        });
    }
    let group = state.group(group_id)?;
    let current = group.member(node_id).map(|m| m.suffrage);

    match current {
        Some(have) if have == suffrage => {
            return Err(TxError::AlreadyMember {
                node_id: node_id.to_string(),
                group_id,
            });
        }
        Some(have) if have.next() != Some(suffrage) => {
            return Err(TxError::InvalidSuffrageTransition {
                node_id: node_id.to_string(),
                from: Some(have),
                to: suffrage,
            });
        }
        None if suffrage == Suffrage::Voter && !(bootstrap && !group.has_voters()) => {
            return Err(TxError::InvalidSuffrageTransition {
                node_id: node_id.to_string(),
                from: None,
                to: suffrage,
            });
        }
        _ => {}
    }
    if suffrage == Suffrage::Staging {
        if let Some(staging) = group.staging() {
            return Err(TxError::MembershipChangeInProgress {
                group_id,
                staging: staging.id.clone(),
            });
        }
    }

    let group = state.group_mut(group_id)?;
    match group.member_mut(node_id) {
        Some(member) => {
            debug!(%node_id, group_id, from = ?member.suffrage, to = ?suffrage, "member promoted");
            member.suffrage = suffrage;
        }
        None => {
            let member = RaftMember::new(node_id, address, suffrage);
            let pos = group.members.partition_point(|m| m.id.as_str() < node_id);
            group.members.insert(pos, member);
            info!(%node_id, group_id, ?suffrage, "member added");
        }
    }
    state.sync_slice_nodes(group_id);
    Ok(Applied::changed(vec![Event::MemberChanged {
        group_id,
        node_id: node_id.to_string(),
        suffrage: Some(suffrage),
    }]))
}

pub fn remove_node_from_group(
    state: &mut ClusterState,
    node_id: &str,
    group_id: GroupId,
) -> TxResult<Applied> {
    let group = state.group_mut(group_id)?;
    let Some(pos) = group.members.iter().position(|m| m.id == node_id) else {
        return Err(TxError::NotFound(format!(
            "node {node_id} in group {group_id}"
        )));
    };
    let removed = group.members.remove(pos);
    if removed.suffrage == Suffrage::Voter && !group.has_voters() && !group.members.is_empty() {
        warn!(%node_id, group_id, "last voter removed; group cannot elect a leader");
    }
    info!(%node_id, group_id, "member removed");
    state.sync_slice_nodes(group_id);
    Ok(Applied::changed(vec![Event::MemberChanged {
        group_id,
        node_id: node_id.to_string(),
        suffrage: None,
    }]))
}

/// Record a member's consensus role as observed by the consensus layer.
///
/// Terms and applied indexes never go backwards. A leader report for a
/// newer term demotes any older-term leader to follower; two leaders in
/// the same term are a conflict.
pub fn report_member(
    state: &mut ClusterState,
    group_id: GroupId,
    node_id: &str,
    status: RaftStatus,
    term: u64,
    applied: u64,
) -> TxResult<Applied> {
    let group = state.group(group_id)?;
    let member = group
        .member(node_id)
        .ok_or_else(|| TxError::NotFound(format!("node {node_id} in group {group_id}")))?;

    if term < member.term {
        return Err(TxError::StaleTerm {
            group_id,
            node_id: node_id.to_string(),
            reported: term,
            known: member.term,
        });
    }
    if applied < member.applied {
        return Err(TxError::StaleSnapshot(format!(
            "{node_id} reported applied {applied} below {}",
            member.applied
        )));
    }
    if member.status == status && member.term == term && member.applied == applied {
        return Ok(Applied::unchanged());
    }
    let was_leader = member.status == RaftStatus::Leader && member.term == term;

    if status == RaftStatus::Leader {
        for other in group.members.iter().filter(|m| m.id != node_id) {
            if other.status != RaftStatus::Leader {
                continue;
            }
            if other.term == term {
                return Err(TxError::DuplicateLeader {
                    group_id,
                    leader: other.id.clone(),
                    term,
                });
            }
            if other.term > term {
                return Err(TxError::StaleTerm {
                    group_id,
                    node_id: node_id.to_string(),
                    reported: term,
                    known: other.term,
                });
            }
        }
    }

    let group = state.group_mut(group_id)?;
    if status == RaftStatus::Leader {
        for other in group.members.iter_mut().filter(|m| m.id != node_id) {
            if other.status == RaftStatus::Leader {
                debug!(node_id = %other.id, group_id, term = other.term, "older leader demoted");
                other.status = RaftStatus::Follower;
            }
        }
    }
    if let Some(member) = group.member_mut(node_id) {
        member.status = status;
        member.term = term;
        member.applied = applied;
    }
    state.sync_slice_nodes(group_id);

    let mut events = Vec::new();
    if status == RaftStatus::Leader && !was_leader {
        info!(%node_id, group_id, term, "leader elected");
        events.push(Event::LeaderChanged {
            group_id,
            leader: node_id.to_string(),
            term,
        });
    }
    Ok(Applied::changed(events))
}

// ── Reporting ─────────────────────────────────────────────────────

/// Summary of one group for logs and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub id: GroupId,
    pub name: String,
    pub leader: Option<NodeId>,
    pub term: u64,
    pub voters: usize,
    pub non_voters: usize,
    pub staging: Option<NodeId>,
    /// Slices replicated by this group.
    pub slices: Vec<SliceId>,
}

pub fn group_report(state: &ClusterState) -> Vec<GroupReport> {
    state
        .groups
        .values()
        .map(|g| {
            let leader = g.leader();
            GroupReport {
                id: g.id,
                name: g.name.clone(),
                leader: leader.map(|m| m.id.clone()),
                term: leader.map(|m| m.term).unwrap_or(0),
                voters: count(g, Suffrage::Voter),
                non_voters: count(g, Suffrage::NonVoter),
                staging: g.staging().map(|m| m.id.clone()),
                slices: state
                    .slices
                    .values()
                    .flat_map(|s| s.values())
                    .filter(|s| s.group == g.id)
                    .map(|s| s.id)
                    .collect(),
            }
        })
        .collect()
}

fn count(group: &NodeGroup, suffrage: Suffrage) -> usize {
    group.members.iter().filter(|m| m.suffrage == suffrage).count()
}
