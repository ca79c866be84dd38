//! Error types for the ArangoDeployment controller

use std::time::Duration;

use thiserror::Error;

use crate::agency::AgencyError;
use crate::client::ConnectionError;
use crate::crd::UnknownActionType;

#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Agency error: {0}")]
    AgencyError(#[from] AgencyError),

    #[error("Member connection error: {0}")]
    ConnectionError(#[from] ConnectionError),

    /// A persisted action names a type that is not registered
    #[error("Structural error: {0}")]
    UnknownActionType(#[from] UnknownActionType),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The current action cannot complete and was aborted
    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Timed out: {0}")]
    TimeoutError(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with a description of what was being attempted
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error beneath any context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::KubeError(kube::Error::Api(api_err)) => {
                // conflicts and throttling resolve themselves, other client errors do not
                let code = api_err.code;
                if (400..500).contains(&code) {
                    return code == 409 || code == 429;
                }
                true
            }
            Error::KubeError(_) => true,
            Error::AgencyError(_) | Error::ConnectionError(_) => true,
            Error::TransientError(_) | Error::TimeoutError(_) => true,
            Error::NotFound(_) | Error::FinalizerError(_) => true,
            Error::UnknownActionType(_) => false,
            Error::ActionFailed(_) => false,
            Error::InvalidConfig(_) | Error::ValidationError(_) => false,
            Error::SerializationError(_) | Error::MissingObjectKey(_) => false,
            Error::Context { .. } => true,
        }
    }

    /// Check if this error means the object is gone
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }

    /// Programmer errors: bad persisted data rather than a bad cluster
    pub fn is_structural(&self) -> bool {
        matches!(self.root(), Error::UnknownActionType(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 409)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attach operation context to any error convertible into [`Error`]
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().wrap(context))
    }
}

/// Requeue delay after a failed tick, doubling from `initial_delay` up to
/// `max_delay` with a little jitter so deployments spread out
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::between(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl BackoffConfig {
    pub fn between(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `attempt`, counting from zero
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(32)).unwrap_or(32);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let spread = base * self.jitter;
        let jittered = (base + rand::random::<f64>() * spread * 2.0 - spread).max(0.0);

        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Errors a retry cannot fix wait the full `max_delay`
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}

/// Tracks consecutive inspection failures for one deployment
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Number of consecutive errors
    pub consecutive_errors: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ErrorContext {
    pub fn record_error(&mut self, error: &Error) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = Some(error.to_string());
    }

    /// Reset error tracking (called on a clean tick)
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.last_error = None;
    }
}
