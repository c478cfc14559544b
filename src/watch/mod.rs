//! Blocking-query support: watch handles, watch sets, commit-time
//! notification, and the narrow-versus-coarse arming strategy.

mod notifier;
mod planner;
mod set;

pub use notifier::Notifier;
pub use planner::{JoinWatch, WatchPlanner};
pub use set::{WatchCh, WatchKey, WatchSet};
