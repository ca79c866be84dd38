//! Registry from action type to implementation and default timeout

use std::collections::BTreeMap;
use std::time::Duration;

use super::action::ActionImpl;
use super::actions;
use crate::controller::error::{Error, Result};
use crate::crd::{Action, ActionType, UnknownActionType};

/// Builds the implementation of one planned action
pub type ActionFactory = fn(Action) -> Box<dyn ActionImpl>;

struct Registration {
    factory: ActionFactory,
    timeout: Duration,
}

/// Action types known to the executor. Filled once at startup and read only
/// afterwards.
#[derive(Default)]
pub struct ActionRegistry {
    entries: BTreeMap<ActionType, Registration>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built in action type. `default_timeout` applies
    /// to types without a timeout of their own.
    pub fn with_defaults(default_timeout: Duration) -> Result<Self> {
        let mut registry = Self::new();
        actions::register_all(&mut registry, default_timeout)?;
        Ok(registry)
    }

    /// Register a type. Registering the same type twice is a startup error.
    pub fn register(&mut self, type_: ActionType, timeout: Duration, factory: ActionFactory) -> Result<()> {
        if self.entries.contains_key(&type_) {
            return Err(Error::InvalidConfig(format!(
                "action type {type_} registered twice"
            )));
        }
        self.entries.insert(type_, Registration { factory, timeout });
        Ok(())
    }

    pub fn is_registered(&self, type_: ActionType) -> bool {
        self.entries.contains_key(&type_)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered default timeout of a type
    pub fn default_timeout(&self, type_: ActionType) -> Option<Duration> {
        self.entries.get(&type_).map(|r| r.timeout)
    }

    /// Build the implementation of a persisted action
    pub fn build(&self, action: &Action) -> Result<Box<dyn ActionImpl>> {
        let type_ = action.action_type()?;
        let registration = self
            .entries
            .get(&type_)
            .ok_or_else(|| UnknownActionType(action.type_.clone()))?;
        Ok((registration.factory)(action.clone()))
    }
}
