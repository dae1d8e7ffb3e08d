use crate::{resident_memory_bytes, BrowserPoolStats, CaptureService};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub max_memory_usage: usize,
    /// Share of failed pool instances that degrades health
    pub warn_failure_rate: f64,
    pub critical_failure_rate: f64,
    /// Share of busy pool instances or capture slots that degrades health
    pub warn_utilization: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_memory_usage: 1024 * 1024 * 1024, // 1GB
            warn_failure_rate: 0.2,
            critical_failure_rate: 0.5,
            warn_utilization: 0.9,
        }
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub uptime_seconds: u64,
    pub tracked_clients: usize,
    pub in_flight_captures: usize,
    pub max_concurrent_captures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_pool: Option<BrowserPoolStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

pub struct SystemHealthChecker {
    service: Arc<CaptureService>,
    thresholds: HealthThresholds,
}

impl SystemHealthChecker {
    pub fn new(service: Arc<CaptureService>) -> Self {
        Self {
            service,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn check_system_health(&self) -> HealthReport {
        let start_time = Instant::now();

        let pool_stats = self.service.pool_stats().await;
        let memory_bytes = resident_memory_bytes();
        let in_flight = self.service.in_flight();
        let capacity = self.service.config().max_concurrent_captures;

        let status = determine_overall_health(&[
            pool_stats
                .as_ref()
                .map_or(HealthLevel::Healthy, |stats| self.check_browser_pool_health(stats)),
            self.check_capacity_health(in_flight, capacity),
            self.check_resource_health(memory_bytes),
        ]);

        debug!("Health check completed in {:?}: {:?}", start_time.elapsed(), status);

        HealthReport {
            status,
            uptime_seconds: self.service.uptime().as_secs(),
            tracked_clients: self.service.limiter().tracked_clients(),
            in_flight_captures: in_flight,
            max_concurrent_captures: capacity,
            browser_pool: pool_stats,
            memory_bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn check_browser_pool_health(&self, stats: &BrowserPoolStats) -> HealthLevel {
        if stats.total_instances == 0 {
            error!("Browser pool health critical: no instances");
            return HealthLevel::Critical;
        }

        let failure_rate = stats.failed_instances as f64 / stats.total_instances as f64;
        if failure_rate > self.thresholds.critical_failure_rate {
            error!(
                "Browser pool health critical: failure rate {:.2}%",
                failure_rate * 100.0
            );
            return HealthLevel::Critical;
        } else if failure_rate > self.thresholds.warn_failure_rate {
            warn!(
                "Browser pool health warning: failure rate {:.2}%",
                failure_rate * 100.0
            );
            return HealthLevel::Warning;
        }

        let utilization = stats.busy_instances as f64 / stats.total_instances as f64;
        if utilization > self.thresholds.warn_utilization {
            warn!("Browser pool high utilization: {:.2}%", utilization * 100.0);
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }

    pub fn check_capacity_health(&self, in_flight: usize, capacity: usize) -> HealthLevel {
        if capacity > 0 && in_flight as f64 / capacity as f64 > self.thresholds.warn_utilization {
            warn!("Capture slots nearly exhausted: {}/{}", in_flight, capacity);
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }

    pub fn check_resource_health(&self, memory_bytes: Option<usize>) -> HealthLevel {
        let Some(memory_usage) = memory_bytes else {
            return HealthLevel::Healthy;
        };

        if memory_usage > self.thresholds.max_memory_usage {
            error!(
                "Resource health critical: memory usage {} MB",
                memory_usage / 1024 / 1024
            );
            HealthLevel::Critical
        } else if memory_usage > self.thresholds.max_memory_usage * 8 / 10 {
            warn!(
                "Resource health warning: memory usage {} MB",
                memory_usage / 1024 / 1024
            );
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

pub fn determine_overall_health(levels: &[HealthLevel]) -> HealthLevel {
    levels.iter().copied().max().unwrap_or(HealthLevel::Healthy)
}
