//! State Management Module
//!
//! Domain bookkeeping: per-node history, the pending change queue,
//! matching of START messages to changes, and the victim set.

mod change;
mod history;
pub mod matcher;
mod victims;

pub use change::{AddedChange, Change, ChangeState, ChangeTracker, Member};
pub use history::{FenceHow, HistoryStore, NodeHistory};
pub use matcher::{find_change, match_change, StartRef};
pub use victims::{Victim, VictimSet};
