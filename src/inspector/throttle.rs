//! Per resource kind refresh throttles

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::ThrottleConfig;

/// Resource kinds tracked by the resource cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    PersistentVolumeClaim,
    Secret,
    Service,
    PodDisruptionBudget,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Pod,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::Secret,
        ResourceKind::Service,
        ResourceKind::PodDisruptionBudget,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Pod => "pod",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaim",
            ResourceKind::Secret => "secret",
            ResourceKind::Service => "service",
            ResourceKind::PodDisruptionBudget => "poddisruptionbudget",
        };
        f.write_str(s)
    }
}

/// Refresh gate for one resource kind
///
/// A fresh or invalidated throttle is always due. After a load the next load
/// is held back for `delay`.
#[derive(Clone, Debug)]
pub struct Throttle {
    delay: Duration,
    next: Option<Instant>,
    count: u64,
    generation: u64,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next: None,
            count: 0,
            generation: 0,
        }
    }

    /// Whether a load is allowed at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        match self.next {
            None => true,
            Some(next) => now >= next,
        }
    }

    /// Record a load at `now` and hold the next one back
    pub fn delay(&mut self, now: Instant) {
        self.next = Some(now + self.delay);
        self.count += 1;
    }

    /// Record a load that started when the throttle was at `generation`.
    /// An invalidation since then keeps the kind due.
    pub fn loaded(&mut self, now: Instant, generation: u64) {
        if self.generation == generation {
            self.delay(now);
        } else {
            self.count += 1;
        }
    }

    /// Force the next refresh to load this kind
    pub fn invalidate(&mut self) {
        self.next = None;
        self.generation += 1;
    }

    /// Bumped by every invalidation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of loads recorded
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Throttles for every tracked kind
#[derive(Clone, Debug)]
pub struct Throttles {
    pods: Throttle,
    pvcs: Throttle,
    secrets: Throttle,
    services: Throttle,
    pdbs: Throttle,
}

impl Throttles {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            pods: Throttle::new(config.pods),
            pvcs: Throttle::new(config.pvcs),
            secrets: Throttle::new(config.secrets),
            services: Throttle::new(config.services),
            pdbs: Throttle::new(config.pdbs),
        }
    }

    pub fn get(&self, kind: ResourceKind) -> &Throttle {
        match kind {
            ResourceKind::Pod => &self.pods,
            ResourceKind::PersistentVolumeClaim => &self.pvcs,
            ResourceKind::Secret => &self.secrets,
            ResourceKind::Service => &self.services,
            ResourceKind::PodDisruptionBudget => &self.pdbs,
        }
    }

    pub fn get_mut(&mut self, kind: ResourceKind) -> &mut Throttle {
        match kind {
            ResourceKind::Pod => &mut self.pods,
            ResourceKind::PersistentVolumeClaim => &mut self.pvcs,
            ResourceKind::Secret => &mut self.secrets,
            ResourceKind::Service => &mut self.services,
            ResourceKind::PodDisruptionBudget => &mut self.pdbs,
        }
    }

    pub fn invalidate_all(&mut self) {
        for kind in ResourceKind::ALL {
            self.get_mut(kind).invalidate();
        }
    }
}
