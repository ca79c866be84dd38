pub mod context;
pub mod error;
pub mod inspection;
pub mod interval;
pub mod reconciler;
pub mod secrets;
pub mod spec_acceptance;
pub mod status;
pub mod validation;

pub use context::{Context, DeploymentHandle};
pub use error::{BackoffConfig, Error, ErrorContext, Result, ResultExt};
pub use inspection::{MAINTENANCE_ANNOTATION, PLAN_CLEAN_ANNOTATION, inspect_deployment};
pub use interval::Interval;
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use spec_acceptance::{Acceptance, SpecAcceptor};
pub use status::StatusManager;
pub use validation::{MAX_MEMBERS, MIN_MEMBERS, SpecDiff, validate_spec, validate_spec_change};
