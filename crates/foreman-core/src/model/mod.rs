//! Work item data model: identifiers, lifecycle states, and ownership.

pub mod item;
pub mod item_id;

pub use item::{
    Assignee, BlockCause, BlockDiagnostic, InvalidTransition, ItemSpec, ItemType, Ownership,
    Status, WorkItem,
};
pub use item_id::ItemId;
