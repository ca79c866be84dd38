//! Cached view of the cluster objects owned by a deployment

mod resource_cache;
mod throttle;

pub use resource_cache::{ResourceCache, Snapshot};
pub use throttle::{ResourceKind, Throttle, Throttles};
