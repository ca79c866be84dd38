//! Planning and plan execution
//!
//! The planner turns observed state into a [`Plan`](crate::crd::Plan) that
//! is persisted in the deployment status. The executor then runs that plan
//! one action at a time across inspection ticks.

pub mod action;
pub mod actions;
pub mod executor;
pub mod planner;
pub mod registry;
pub mod timeouts;

pub use action::{ActionContext, ActionImpl, Progress};
pub use executor::{ActionOutcome, ExecutionReport, PlanExecutor};
pub use planner::{PlanInput, create_plan};
pub use registry::ActionRegistry;
