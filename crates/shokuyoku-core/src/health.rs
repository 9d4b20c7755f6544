//! Health tracking for the worker's external dependencies.
//!
//! The ingestion loop marks the stream, schema, and storage components as it
//! talks to them; the CLI's HTTP server reports the result on `/health`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// An external dependency whose health is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Message stream (Kafka)
    Stream,
    /// Schema registry (file or Hive Metastore)
    Schema,
    /// Object storage
    Storage,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Stream, Component::Schema, Component::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Stream => "stream",
            Component::Schema => "schema",
            Component::Storage => "storage",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational but failing some requests
    Degraded(String),
    Unhealthy(String),
    /// Not contacted yet
    Unknown,
}

/// Overall worker health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Snapshot returned by the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub running: bool,
    pub components: BTreeMap<Component, ComponentStatus>,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub last_commit_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Activity {
    running: bool,
    last_flush_at: Option<DateTime<Utc>>,
    last_commit_at: Option<DateTime<Utc>>,
}

/// Health check manager shared between the engine and the HTTP server.
pub struct HealthCheck {
    components: RwLock<BTreeMap<Component, ComponentStatus>>,
    activity: RwLock<Activity>,
}

impl HealthCheck {
    /// Create a health check with every component unknown.
    pub fn new() -> Self {
        let components = Component::ALL
            .iter()
            .map(|c| (*c, ComponentStatus::Unknown))
            .collect();
        Self {
            components: RwLock::new(components),
            activity: RwLock::new(Activity::default()),
        }
    }

    pub fn mark_healthy(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy);
    }

    pub fn mark_degraded(&self, component: Component, reason: impl Into<String>) {
        self.set(component, ComponentStatus::Degraded(reason.into()));
    }

    pub fn mark_unhealthy(&self, component: Component, reason: impl Into<String>) {
        self.set(component, ComponentStatus::Unhealthy(reason.into()));
    }

    fn set(&self, component: Component, status: ComponentStatus) {
        self.components.write().insert(component, status);
    }

    pub fn component_status(&self, component: Component) -> ComponentStatus {
        self.components
            .read()
            .get(&component)
            .cloned()
            .unwrap_or(ComponentStatus::Unknown)
    }

    /// Get overall system health status.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        self.overall_status() != HealthStatus::Unhealthy
    }

    pub fn worker_started(&self) {
        self.activity.write().running = true;
    }

    pub fn worker_stopped(&self) {
        self.activity.write().running = false;
    }

    pub fn is_running(&self) -> bool {
        self.activity.read().running
    }

    pub fn record_flush(&self) {
        self.activity.write().last_flush_at = Some(Utc::now());
    }

    pub fn record_commit(&self) {
        self.activity.write().last_commit_at = Some(Utc::now());
    }

    pub fn report(&self) -> HealthReport {
        let activity = self.activity.read();
        HealthReport {
            status: self.overall_status(),
            running: activity.running,
            components: self.components.read().clone(),
            last_flush_at: activity.last_flush_at,
            last_commit_at: activity.last_commit_at,
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
