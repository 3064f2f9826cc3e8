use std::time::SystemTime;
use serde::{Serialize, Deserialize};
use crate::tasks::DispatcherStats;

/// Core statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreStats {
    // General info
    pub uptime_secs: u64,
    pub start_time: SystemTime,

    // Concordance cache
    pub cache: CacheStats,

    // Background tasks
    pub tasks: DispatcherStats,

    // Query chains
    pub hot_records: usize,
    pub archive_queue_len: usize,
    pub archived_records: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub corpora: usize,
    pub entries: usize,
    pub complete_entries: usize,
    pub in_flight: usize,           // Entries guarded by a producer pidfile
    pub total_bytes: u64,
}

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub timestamp: SystemTime,
}

impl HealthCheckResult {
    /// Worst status among the checks wins
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let unhealthy: Vec<&str> = checks
            .iter()
            .filter(|c| matches!(c.status, HealthStatus::Unhealthy(_)))
            .map(|c| c.name.as_str())
            .collect();
        let degraded: Vec<&str> = checks
            .iter()
            .filter(|c| matches!(c.status, HealthStatus::Degraded(_)))
            .map(|c| c.name.as_str())
            .collect();

        let status = if !unhealthy.is_empty() {
            HealthStatus::Unhealthy(format!("failing: {}", unhealthy.join(", ")))
        } else if !degraded.is_empty() {
            HealthStatus::Degraded(format!("degraded: {}", degraded.join(", ")))
        } else {
            HealthStatus::Healthy
        };

        HealthCheckResult {
            status,
            checks,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub latency_ms: u64,
}
