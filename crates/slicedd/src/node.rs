//! Node wiring.
//!
//! 1. Opens the redb file shared by the state store, the Raft log and
//!    the node id map
//! 2. Starts the metadata Raft group, bootstrapping it if configured
//! 3. Registers this node and its group membership
//! 4. Runs the reporter, membership reconciler, provisioner, roller and
//!    rebalancer until Ctrl-C

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use openraft::{BasicNode, ServerState};
use tokio::sync::watch;
use tracing::info;

use sliced_core::{GroupId, NodeConfig, Suffrage};
use sliced_raft::{
    Consensus, LogStore, MemberReporter, MembershipReconciler, NodeIdMap, Publisher,
    RaftConsensus, Router, SlicedRaft, StateMachine,
};
use sliced_segment::{LocalBlobStore, Provisioner, RollerSet, SegmentPlacement};
use sliced_state::{ClusterState, Command, Drive, Node, StateStore};

use crate::tasks::{Leadership, Rebalancer, RollerTask, now_ms};

/// Raft log group replicating [`ClusterState`].
const META_GROUP: GroupId = 1;
const META_GROUP_NAME: &str = "meta";

const EVENT_CAPACITY: usize = 4096;
const REPORT_APPLIED_STEP: u64 = 100;
const REBALANCE_PERIOD: Duration = Duration::from_secs(10);
const MEMBERSHIP_PERIOD: Duration = Duration::from_secs(5);
const LEADER_WAIT: Duration = Duration::from_secs(30);

fn local_node(config: &NodeConfig, at: u64) -> Node {
    let drives = config
        .storage
        .as_ref()
        .and_then(|s| s.drives.as_ref())
        .map(|drives| {
            drives
                .iter()
                .map(|d| Drive {
                    mount: d.mount.clone(),
                    kind: d.kind.unwrap_or_default(),
                    stats: None,
                    working: true,
                    filesystem: String::new(),
                })
                .collect()
        })
        .unwrap_or_default();
    Node {
        id: config.node.id.clone(),
        host: config.node.host.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        region: config.node.region.clone().unwrap_or_default(),
        zone: config.node.zone.clone().unwrap_or_default(),
        bootstrap: config.bootstrap(),
        drives,
        created: at,
        ..Default::default()
    }
}

/// Initialize the Raft group and register this node as its first voter.
async fn bootstrap(
    raft: &SlicedRaft,
    raft_id: u64,
    config: &NodeConfig,
    consensus: &RaftConsensus,
) -> anyhow::Result<()> {
    let mut members = BTreeMap::new();
    members.insert(raft_id, BasicNode::new(&config.node.host));
    if let Err(e) = raft.initialize(members).await {
        // NotAllowed means already initialized; expected on restart.
        info!(error = %e, "raft initialize (may already be bootstrapped)");
    }

    raft.wait(Some(LEADER_WAIT))
        .state(ServerState::Leader, "bootstrap leadership")
        .await
        .context("waiting for leadership")?;

    let at = now_ms();
    let state = consensus.snapshot();
    consensus
        .propose(Command::InitNode {
            node: local_node(config, at),
            at,
        })
        .await?;

    if !state.groups.values().any(|g| g.name == META_GROUP_NAME) {
        consensus
            .propose(Command::CreateGroup {
                name: META_GROUP_NAME.to_string(),
            })
            .await?;
    }
    let group_id = consensus
        .snapshot()
        .groups
        .values()
        .find(|g| g.name == META_GROUP_NAME)
        .map(|g| g.id)
        .context("metadata group missing after create")?;
    let joined = consensus
        .snapshot()
        .groups
        .get(&group_id)
        .is_some_and(|g| g.member(&config.node.id).is_some());
    if !joined {
        consensus
            .propose(Command::AddNodeToGroup {
                node_id: config.node.id.clone(),
                group_id,
                suffrage: Suffrage::Voter,
                bootstrap: true,
                address: config.node.host.clone(),
            })
            .await?;
    }
    info!(group_id, node_id = %config.node.id, "cluster bootstrapped");
    Ok(())
}

/// Run the node until Ctrl-C.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    info!(node_id = %config.node.id, "sliced daemon starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    // ── Storage ──────────────────────────────────────────────────
    let db_path = data_dir.join("sliced.redb");
    let store = StateStore::open(&db_path)?;
    let db = store.database();
    info!(path = ?db_path, "state store opened");

    let node_map = Arc::new(NodeIdMap::open(Arc::clone(&db))?);
    let raft_id = node_map.resolve(&config.node.id)?;
    info!(node_id = %config.node.id, raft_id, "node id mapped");

    // ── Raft ─────────────────────────────────────────────────────
    let log_store = LogStore::open(Arc::clone(&db), META_GROUP)?;
    let publisher = Publisher::new(ClusterState::default(), EVENT_CAPACITY);
    let state_machine = StateMachine::open(store, publisher.clone())?;
    let router = Router::new();

    let (heartbeat, election_min, election_max) = config.raft_timings();
    let raft_config = openraft::Config {
        cluster_name: "sliced".to_string(),
        heartbeat_interval: heartbeat,
        election_timeout_min: election_min,
        election_timeout_max: election_max,
        ..Default::default()
    }
    .validate()?;

    let raft = openraft::Raft::new(
        raft_id,
        Arc::new(raft_config),
        router.clone(),
        log_store,
        state_machine,
    )
    .await?;
    router.register(raft_id, raft.clone());
    info!("raft instance created");

    let consensus =
        Arc::new(RaftConsensus::new(raft.clone(), publisher.clone()).with_router(router.clone()));

    if config.bootstrap() {
        bootstrap(&raft, raft_id, &config, &consensus).await?;
    } else {
        info!("not bootstrapping; waiting to be added to the cluster");
    }

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let leadership = Leadership::Raft {
        metrics: raft.metrics(),
        id: raft_id,
    };

    // Member status reporter.
    let reporter = MemberReporter::new(
        Arc::clone(&consensus),
        config.node.id.clone(),
        REPORT_APPLIED_STEP,
    );
    let reporter_handle = tokio::spawn(reporter.run(raft.metrics(), shutdown_rx.clone()));

    // Raft membership follows the group's suffrage.
    let reconciler = MembershipReconciler::new(raft.clone(), Arc::clone(&node_map), META_GROUP);
    let reconciler_handle = tokio::spawn(reconciler.run(
        MEMBERSHIP_PERIOD,
        consensus.subscribe(),
        consensus.watch(),
        shutdown_rx.clone(),
    ));

    // Segment provisioner.
    let (initial, max, alert_after) = config.provisioner_backoff();
    let blobs = Arc::new(LocalBlobStore::new(data_dir.join("segments")));
    let provisioner = Provisioner::new(blobs, initial, max, alert_after);
    let provisioner_handle = tokio::spawn(provisioner.run(
        consensus.subscribe(),
        consensus.watch(),
        shutdown_rx.clone(),
    ));

    // Segment roller.
    let placement = SegmentPlacement {
        volume_id: config.node.id.clone(),
        drive: config
            .storage
            .as_ref()
            .and_then(|s| s.drives.as_ref())
            .and_then(|d| d.first())
            .map(|d| d.mount.clone())
            .unwrap_or_default(),
    };
    let rollers = RollerSet::new(placement, config.roller_idle_ms());
    let roller = RollerTask::new(Arc::clone(&consensus), rollers, leadership.clone());
    let roller_handle = tokio::spawn(roller.run(config.roller_tick(), shutdown_rx.clone()));

    // Rebalancer.
    let rebalancer = Rebalancer::new(Arc::clone(&consensus), leadership);
    let rebalancer_handle = tokio::spawn(rebalancer.run(
        REBALANCE_PERIOD,
        consensus.subscribe(),
        shutdown_rx,
    ));

    // ── Shutdown ─────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reporter_handle.await;
    let _ = reconciler_handle.await;
    let _ = provisioner_handle.await;
    let _ = roller_handle.await;
    let _ = rebalancer_handle.await;

    router.unregister(raft_id);
    raft.shutdown().await?;
    info!("sliced daemon stopped");
    Ok(())
}
