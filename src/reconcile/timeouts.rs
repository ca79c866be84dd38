//! Action timeout resolution

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crd::{ActionType, ArangoDeploymentSpec};

/// Key in `spec.timeouts.actions` applying to every type without its own entry
pub const DEFAULT_KEY: &str = "default";

/// Timeout for an action type: the per type override, then the `default`
/// override, then the registered default. Zero disables the timeout.
pub fn action_timeout(
    spec: &ArangoDeploymentSpec,
    action_type: ActionType,
    registered: Duration,
) -> Option<Duration> {
    let timeout = spec
        .action_timeout_override(action_type.as_str())
        .or_else(|| spec.action_timeout_override(DEFAULT_KEY))
        .map(Duration::from_secs)
        .unwrap_or(registered);
    (!timeout.is_zero()).then_some(timeout)
}

/// An action is expired once strictly more than `timeout` passed since it started
pub fn is_expired(started_at: DateTime<Utc>, now: DateTime<Utc>, timeout: Option<Duration>) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };
    let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
    elapsed > timeout
}
