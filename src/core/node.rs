use tracing::warn;

use super::models::NodeStatus;
use super::queue::JobQueue;

/// Compute a node's status from the live queue.
///
/// Status is advisory, so an unreachable store yields an "unknown" status
/// instead of an error.
pub async fn node_status(queue: &JobQueue, node_name: &str) -> NodeStatus {
    match queue.count_running().await {
        Ok(running) => NodeStatus::from_running(node_name, running),
        Err(e) => {
            warn!(node = node_name, error = %e, "Queue unreachable, reporting unknown status");
            NodeStatus::unknown(node_name)
        }
    }
}
