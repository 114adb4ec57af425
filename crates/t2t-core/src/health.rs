//! Health check system for monitoring component status.
//!
//! The engine registers `source`, `sink` and `checkpoint`, plus one
//! `partition-<n>` component per running partition worker.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Component name for the source connector.
pub const SOURCE: &str = "source";
/// Component name for the sink connector.
pub const SINK: &str = "sink";
/// Component name for the checkpoint store.
pub const CHECKPOINT: &str = "checkpoint";

/// Component name for a partition worker.
pub fn partition_component(partition: i32) -> String {
    format!("partition-{}", partition)
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

/// Health check manager for tracking component health.
pub struct HealthCheck {
    components: RwLock<HashMap<String, ComponentStatus>>,
    started_at: RwLock<Option<Instant>>,
    job_running: RwLock<bool>,
}

impl HealthCheck {
    /// Create a new health check manager.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            started_at: RwLock::new(None),
            job_running: RwLock::new(false),
        }
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        self.components
            .write()
            .insert(name.to_string(), ComponentStatus::Unknown);
    }

    /// Stop tracking a component.
    pub fn remove_component(&self, name: &str) {
        self.components.write().remove(name);
    }

    pub fn mark_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy);
    }

    pub fn mark_degraded(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Degraded(reason.to_string()));
    }

    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Unhealthy(reason.to_string()));
    }

    fn set(&self, name: &str, status: ComponentStatus) {
        let mut components = self.components.write();
        // Unchanged status: keep the existing entry.
        if components.get(name) == Some(&status) {
            return;
        }
        components.insert(name.to_string(), status);
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).cloned()
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.components.read().clone()
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

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Ready to process: running and operational.
    pub fn is_ready(&self) -> bool {
        self.is_job_running() && self.is_operational()
    }

    /// Mark the stream job as started.
    pub fn job_started(&self) {
        *self.job_running.write() = true;
        *self.started_at.write() = Some(Instant::now());
    }

    /// Mark the stream job as completed.
    pub fn job_completed(&self) {
        *self.job_running.write() = false;
    }

    /// Check if the stream job is running.
    pub fn is_job_running(&self) -> bool {
        *self.job_running.read()
    }

    /// Time since the job last started.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.read().map(|t| t.elapsed())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_lifecycle() {
        let health = HealthCheck::new();

        health.register_component(SOURCE);
        health.register_component(SINK);

        assert_eq!(
            health.get_component_status(SOURCE),
            Some(ComponentStatus::Unknown)
        );

        health.mark_healthy(SOURCE);
        health.mark_healthy(SINK);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_degraded(SINK, "publish retrying");
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
        assert!(health.is_operational());

        health.mark_unhealthy(SOURCE, "broker unreachable");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        assert!(!health.is_operational());
    }

    #[test]
    fn test_partition_components() {
        let health = HealthCheck::new();
        let name = partition_component(3);
        assert_eq!(name, "partition-3");

        health.register_component(&name);
        health.mark_unhealthy(&name, "failed at offset 51");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);

        health.remove_component(&name);
        assert_eq!(health.get_component_status(&name), None);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_job_lifecycle_and_readiness() {
        let health = HealthCheck::new();
        assert!(!health.is_job_running());
        assert!(!health.is_ready());
        assert!(health.uptime().is_none());

        health.job_started();
        assert!(health.is_ready());
        assert!(health.uptime().is_some());

        health.register_component(CHECKPOINT);
        health.mark_unhealthy(CHECKPOINT, "disk full");
        assert!(!health.is_ready());

        health.job_completed();
        assert!(!health.is_job_running());
    }

    #[test]
    fn test_get_all_statuses() {
        let health = HealthCheck::new();
        health.register_component(SOURCE);
        health.register_component(CHECKPOINT);
        health.mark_healthy(SOURCE);
        health.mark_degraded(CHECKPOINT, "slow fsync");

        let statuses = health.get_all_statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses.get(SOURCE), Some(&ComponentStatus::Healthy));
        assert!(matches!(
            statuses.get(CHECKPOINT),
            Some(ComponentStatus::Degraded(_))
        ));
    }
}
