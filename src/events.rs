//! Kubernetes Event recording for the deployment controller.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break an inspection tick.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{EventType, Recorder, Reporter};
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason string (e.g. "ActionAborted")
    /// * `action` - What the controller was doing (e.g. "ExecutePlan")
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// One event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub object: Option<String>,
    pub type_: EventType,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// Publisher that keeps every event in memory, for assertions
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedEvent {
                object: resource_ref.name.clone(),
                type_,
                reason: reason.to_string(),
                action: action.to_string(),
                note,
            });
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A spec was accepted for reconciliation
    pub const SPEC_ACCEPTED: &str = "SpecAccepted";
    /// The new spec failed validation and the previous one stays in effect
    pub const SPEC_INVALID: &str = "SpecInvalid";
    /// An immutable field was changed and has been reset
    pub const IMMUTABLE_FIELD_RESET: &str = "ImmutableFieldReset";
    /// A referenced secret changed since it was recorded
    pub const SECRETS_CHANGED: &str = "SecretsChanged";
    pub const PLAN_CREATED: &str = "PlanCreated";
    pub const PLAN_CLEANED: &str = "PlanCleaned";
    /// An action gave up or its timeout passed
    pub const ACTION_ABORTED: &str = "ActionAborted";
    pub const ACTION_TIMEOUT: &str = "ActionTimeout";
    pub const MEMBER_ADDED: &str = "MemberAdded";
    pub const MEMBER_REMOVED: &str = "MemberRemoved";
    pub const MEMBER_FAILED: &str = "MemberFailed";
    pub const RESTORE_FAILED: &str = "RestoreFailed";
    pub const RESTORE_COMPLETED: &str = "RestoreCompleted";
    /// An inspection tick failed
    pub const INSPECTION_FAILED: &str = "InspectionFailed";
}

/// Well-known event action strings.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const ACCEPT_SPEC: &str = "AcceptSpec";
    pub const CREATE_PLAN: &str = "CreatePlan";
    pub const EXECUTE_PLAN: &str = "ExecutePlan";
    pub const INSPECT_SECRETS: &str = "InspectSecrets";
}
