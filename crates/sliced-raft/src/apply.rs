//! Deterministic apply dispatcher.
//!
//! Routes each [`Command`] to its apply step. Apply steps validate
//! everything before their first mutation, so commands are applied to
//! the state in place and an error never leaves a half-applied command
//! behind.

use tracing::{debug, warn};

use sliced_cluster::{database, membership};
use sliced_segment::lifecycle::{self, QueueSpec, TopicSpec};
use sliced_state::{Applied, ClusterState, Command, ErrorClass, TxResult};

/// Apply one command.
pub fn apply(state: &mut ClusterState, command: &Command) -> TxResult<Applied> {
    match dispatch(state, command) {
        Ok(applied) => {
            debug!(
                command = command.kind(),
                outcome = ?applied.outcome,
                events = applied.events.len(),
                "command applied"
            );
            Ok(applied)
        }
        Err(e) => {
            if e.class() == ErrorClass::Fatal {
                warn!(command = command.kind(), error = %e, "command failed fatally");
            } else {
                debug!(command = command.kind(), error = %e, "command rejected");
            }
            Err(e)
        }
    }
}

/// Apply `command` to a scratch copy, leaving `state` as it is.
pub fn check(state: &ClusterState, command: &Command) -> TxResult<Applied> {
    let mut scratch = state.clone();
    dispatch(&mut scratch, command)
}

/// Rebuild state from an ordered log. Rejected commands are skipped
/// exactly as they were when first applied.
pub fn replay<'a>(commands: impl IntoIterator<Item = &'a Command>) -> ClusterState {
    let mut state = ClusterState::default();
    for (index, command) in commands.into_iter().enumerate() {
        if let Err(e) = apply(&mut state, command) {
            warn!(index, command = command.kind(), error = %e, "replayed command rejected");
        }
    }
    state
}

fn dispatch(state: &mut ClusterState, command: &Command) -> TxResult<Applied> {
    match command {
        Command::InitNode { node, at } => membership::init_node(state, node, *at),
        Command::DropNode { node_id, at } => membership::drop_node(state, node_id, *at),
        Command::RemoveNode { node_id, at } => membership::remove_node(state, node_id, *at),
        Command::CreateGroup { name } => membership::create_group(state, name),
        Command::AddNodeToGroup {
            node_id,
            group_id,
            suffrage,
            bootstrap,
            address,
        } => membership::add_node_to_group(
            state, node_id, *group_id, *suffrage, *bootstrap, address,
        ),
        Command::RemoveNodeFromGroup { node_id, group_id } => {
            membership::remove_node_from_group(state, node_id, *group_id)
        }
        Command::ReportMember {
            group_id,
            node_id,
            status,
            term,
            applied,
        } => membership::report_member(state, *group_id, node_id, *status, *term, *applied),

        Command::CreateDatabase {
            name,
            description,
            group_id,
            slices,
            size,
            at,
        } => database::create_database(state, name, description, *group_id, *slices, *size, *at),
        Command::DropDatabase { database: db, at } => database::drop_database(state, *db, *at),
        Command::RemoveDatabase { database: db, at } => {
            database::remove_database(state, *db, *at)
        }
        Command::RenameDatabase {
            database: db,
            name,
            at,
        } => database::rename_database(state, *db, name, *at),
        Command::SetRingLayout {
            database: db,
            layout,
        } => database::set_ring_layout(state, *db, *layout),
        Command::AddSlice {
            database: db,
            group_id,
        } => database::add_slice(state, *db, *group_id),
        Command::RemoveSlice { slice } => database::remove_slice(state, *slice),
        Command::ChangeRing {
            database: db,
            rebalance,
            from,
            to,
        } => database::change_ring(state, *db, *rebalance, from, to),
        Command::ChangeRingCancel {
            database: db,
            rebalance,
        } => database::change_ring_cancel(state, *db, *rebalance),

        Command::CreateRoller { name, limits } => lifecycle::create_roller(state, name, limits),
        Command::CreateTopic {
            database: db,
            name,
            mode,
            roller_id,
            codec,
            level,
            app_id,
            drive,
        } => lifecycle::create_topic(
            state,
            &TopicSpec {
                database: *db,
                name: name.clone(),
                mode: *mode,
                roller_id: *roller_id,
                codec: *codec,
                level: *level,
                app_id: app_id.clone(),
                drive: *drive,
            },
        ),
        Command::CreateQueue {
            database: db,
            name,
            roller_id,
            level,
            fifo,
            max_in_flight,
            max_visibility_ms,
            max_delay_ms,
            max_retries,
            app_id,
            tags,
        } => lifecycle::create_queue(
            state,
            &QueueSpec {
                database: *db,
                name: name.clone(),
                roller_id: *roller_id,
                level: *level,
                fifo: *fifo,
                max_in_flight: *max_in_flight,
                max_visibility_ms: *max_visibility_ms,
                max_delay_ms: *max_delay_ms,
                max_retries: *max_retries,
                app_id: app_id.clone(),
                tags: tags.clone(),
            },
        ),
        Command::CreateSegment { topic_id, next } => {
            lifecycle::create_segment(state, *topic_id, next)
        }
        Command::Roll {
            roller_id,
            topic_id,
            segment_id,
            stats,
            next,
        } => lifecycle::roll(state, *roller_id, *topic_id, *segment_id, stats, next),
        Command::DeleteTopic { topic_id } => lifecycle::delete_topic(state, *topic_id),
        Command::DeleteQueue { queue_id } => lifecycle::delete_queue(state, *queue_id),
        Command::SplitTopic {
            topic_id,
            name,
            slot,
            stats,
            next,
        } => lifecycle::split_topic(state, *topic_id, name.as_deref(), *slot, stats, next),
    }
}
