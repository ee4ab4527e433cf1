//! Moving items out of `inbox` with classifier output.

use serde::Serialize;
use tracing::{info, warn};

use crate::collab::Classifier;
use crate::error::{ForemanError, Result};
use crate::graph::edges::EdgeKind;
use crate::model::{BlockCause, BlockDiagnostic, InvalidTransition, ItemId, Status, WorkItem};
use crate::store::GraphStore;

/// A proposed edge the graph refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedEdge {
    pub to: ItemId,
    pub kind: EdgeKind,
    pub reason: String,
}

/// Result of [`classify`].
#[derive(Debug, Clone, Serialize)]
pub struct Intake {
    /// The item after its status change.
    pub item: WorkItem,
    pub rejected: Vec<RejectedEdge>,
}

/// Classify an inbox item and move it to `ready`, or to `blocked` when a
/// proposed edge was rejected or a hard dependency is not done yet.
///
/// Edges accepted before a rejection stay in the graph.
///
/// # Errors
///
/// - [`ForemanError::NotFound`].
/// - [`ForemanError::InvalidTransition`] when the item is not in `inbox`.
/// - [`ForemanError::Infrastructure`] when the classifier fails; the item
///   stays in `inbox` unchanged.
/// - [`ForemanError::Validation`] for an empty project or an out-of-range
///   priority.
pub fn classify(store: &GraphStore, id: &str, classifier: &dyn Classifier) -> Result<Intake> {
    let item = store.get(id)?;
    if item.status != Status::Inbox {
        return Err(ForemanError::transition(
            &item.id,
            InvalidTransition {
                from: item.status,
                to: Status::Ready,
                reason: "only inbox items are classified",
            },
        ));
    }

    let proposal = classifier.classify(&item)?;
    if proposal.project.trim().is_empty() {
        return Err(ForemanError::validation(format!(
            "classifier gave item {id} an empty project"
        )));
    }
    store.update_classification(id, &proposal.project, proposal.priority, proposal.item_type)?;

    let proposed = proposal
        .parent
        .into_iter()
        .map(|p| (p, EdgeKind::Parent))
        .chain(proposal.depends_on.into_iter().map(|d| (d, EdgeKind::DependsOn)));

    let mut rejected = Vec::new();
    for (to, kind) in proposed {
        match store.add_edge(id, to.as_str(), kind) {
            Ok(_) => {}
            Err(
                err @ (ForemanError::Cycle(_)
                | ForemanError::DanglingReference { .. }
                | ForemanError::Validation(_)),
            ) => {
                warn!(item_id = id, to = %to, %kind, error = %err, "proposed edge rejected");
                rejected.push(RejectedEdge {
                    to,
                    kind,
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    let item = if rejected.is_empty() {
        store.settle(id, Status::Inbox)?
    } else {
        let detail = rejected
            .iter()
            .map(|r| format!("{} -> {}: {}", r.kind, r.to, r.reason))
            .collect::<Vec<_>>()
            .join("\n");
        store.block(
            id,
            Status::Inbox,
            BlockDiagnostic::new(BlockCause::GraphConflict, detail),
        )?
    };

    info!(
        item_id = id,
        project = %item.project,
        priority = item.priority,
        to = %item.status,
        rejected = rejected.len(),
        "item classified"
    );
    Ok(Intake { item, rejected })
}
