//! Operator configuration
//!
//! Every knob has a default and can be overridden through an
//! `ARANGO_OPERATOR_*` environment variable. Durations are given in
//! milliseconds (`*_MS`) or seconds (`*_SECS`).

use std::time::Duration;

use crate::controller::error::{Error, Result};

const ENV_PREFIX: &str = "ARANGO_OPERATOR_";

/// Per resource kind refresh throttles for the resource cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub pods: Duration,
    pub pvcs: Duration,
    pub secrets: Duration,
    pub services: Duration,
    pub pdbs: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            pods: Duration::ZERO,
            pvcs: Duration::ZERO,
            secrets: Duration::from_secs(15),
            services: Duration::from_secs(15),
            pdbs: Duration::from_secs(30),
        }
    }
}

/// Lease used to pick the single active operator replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub lease_ttl: Duration,
    /// Must be well below `lease_ttl` or the lease lapses between renewals
    pub renew_interval: Duration,
    /// Time in-flight ticks get after a shutdown signal
    pub shutdown_grace_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_name: "arango-operator-leader".to_string(),
            lease_ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Shortest requeue interval, used to retry right away
    pub min_inspection_interval: Duration,
    /// Longest requeue interval
    pub max_inspection_interval: Duration,
    /// Deadline for a whole inspection tick
    pub reconciliation_timeout: Duration,
    /// Deadline for a single agency request
    pub agency_request_timeout: Duration,
    /// Deadline for a single member request
    pub member_request_timeout: Duration,
    /// Deadline for pod create/patch/delete calls
    pub pod_update_timeout: Duration,
    /// Timeout for actions registered without their own default
    pub default_action_timeout: Duration,
    /// Concurrent fetches during a resource cache refresh
    pub worker_pool_size: usize,
    /// Actions that may complete synchronously in one tick
    pub max_synchronous_actions: usize,
    /// Lifetime of the bearer tokens signed for member requests
    pub jwt_token_ttl: Duration,
    /// Port every member listens on
    pub member_port: u16,
    pub throttles: ThrottleConfig,
    pub leader_election: LeaderElectionConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            min_inspection_interval: Duration::from_millis(250),
            max_inspection_interval: Duration::from_secs(10),
            reconciliation_timeout: Duration::from_secs(120),
            agency_request_timeout: Duration::from_secs(10),
            member_request_timeout: Duration::from_secs(5),
            pod_update_timeout: Duration::from_secs(60),
            default_action_timeout: Duration::from_secs(600),
            worker_pool_size: 15,
            max_synchronous_actions: 10,
            jwt_token_ttl: Duration::from_secs(3600),
            member_port: 8529,
            throttles: ThrottleConfig::default(),
            leader_election: LeaderElectionConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let reader = EnvReader { lookup };

        let config = Self {
            min_inspection_interval: reader
                .millis("MIN_INSPECTION_INTERVAL_MS")?
                .unwrap_or(defaults.min_inspection_interval),
            max_inspection_interval: reader
                .secs("MAX_INSPECTION_INTERVAL_SECS")?
                .unwrap_or(defaults.max_inspection_interval),
            reconciliation_timeout: reader
                .secs("RECONCILIATION_TIMEOUT_SECS")?
                .unwrap_or(defaults.reconciliation_timeout),
            agency_request_timeout: reader
                .secs("AGENCY_REQUEST_TIMEOUT_SECS")?
                .unwrap_or(defaults.agency_request_timeout),
            member_request_timeout: reader
                .secs("MEMBER_REQUEST_TIMEOUT_SECS")?
                .unwrap_or(defaults.member_request_timeout),
            pod_update_timeout: reader
                .secs("POD_UPDATE_TIMEOUT_SECS")?
                .unwrap_or(defaults.pod_update_timeout),
            default_action_timeout: reader
                .secs("DEFAULT_ACTION_TIMEOUT_SECS")?
                .unwrap_or(defaults.default_action_timeout),
            worker_pool_size: reader
                .number("WORKER_POOL_SIZE")?
                .unwrap_or(defaults.worker_pool_size),
            max_synchronous_actions: reader
                .number("MAX_SYNCHRONOUS_ACTIONS")?
                .unwrap_or(defaults.max_synchronous_actions),
            jwt_token_ttl: reader
                .secs("JWT_TOKEN_TTL_SECS")?
                .unwrap_or(defaults.jwt_token_ttl),
            member_port: reader
                .number("MEMBER_PORT")?
                .unwrap_or(defaults.member_port),
            throttles: ThrottleConfig {
                pods: reader
                    .secs("THROTTLE_PODS_SECS")?
                    .unwrap_or(defaults.throttles.pods),
                pvcs: reader
                    .secs("THROTTLE_PVCS_SECS")?
                    .unwrap_or(defaults.throttles.pvcs),
                secrets: reader
                    .secs("THROTTLE_SECRETS_SECS")?
                    .unwrap_or(defaults.throttles.secrets),
                services: reader
                    .secs("THROTTLE_SERVICES_SECS")?
                    .unwrap_or(defaults.throttles.services),
                pdbs: reader
                    .secs("THROTTLE_PDBS_SECS")?
                    .unwrap_or(defaults.throttles.pdbs),
            },
            leader_election: LeaderElectionConfig {
                lease_name: reader
                    .number("LEASE_NAME")?
                    .unwrap_or(defaults.leader_election.lease_name),
                lease_ttl: reader
                    .secs("LEASE_TTL_SECS")?
                    .unwrap_or(defaults.leader_election.lease_ttl),
                renew_interval: reader
                    .secs("LEASE_RENEW_INTERVAL_SECS")?
                    .unwrap_or(defaults.leader_election.renew_interval),
                shutdown_grace_period: reader
                    .secs("SHUTDOWN_GRACE_PERIOD_SECS")?
                    .unwrap_or(defaults.leader_election.shutdown_grace_period),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.min_inspection_interval > self.max_inspection_interval {
            return Err(Error::InvalidConfig(format!(
                "min inspection interval {:?} exceeds max {:?}",
                self.min_inspection_interval, self.max_inspection_interval
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(Error::InvalidConfig(
                "worker pool size must be at least 1".to_string(),
            ));
        }
        if self.max_synchronous_actions == 0 {
            return Err(Error::InvalidConfig(
                "max synchronous actions must be at least 1".to_string(),
            ));
        }
        let lease = &self.leader_election;
        if lease.lease_name.is_empty() {
            return Err(Error::InvalidConfig("lease name must not be empty".to_string()));
        }
        if lease.renew_interval >= lease.lease_ttl {
            return Err(Error::InvalidConfig(format!(
                "lease renew interval {:?} must be shorter than the lease ttl {:?}",
                lease.renew_interval, lease.lease_ttl
            )));
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn number<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>> {
        let key = format!("{ENV_PREFIX}{name}");
        match (self.lookup)(&key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| Error::InvalidConfig(format!("{key}: invalid value {raw:?}"))),
        }
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.number::<u64>(name)?.map(Duration::from_secs))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.number::<u64>(name)?.map(Duration::from_millis))
    }
}
