//! Member state: reachability tracking and pod inspection

mod pods;
mod state;

pub use pods::inspect_pods;
pub use state::{AggregateState, MemberState, MemberStateTracker, VERSION_PATH};
