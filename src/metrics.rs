use crate::{resident_memory_bytes, CaptureFormat, ErrorKind};
use metrics::{gauge, histogram, increment_counter};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Record a finished capture; `failure` is `None` on success
pub fn record_capture(format: CaptureFormat, failure: Option<ErrorKind>, duration: Duration) {
    let outcome = failure.map_or("success", |kind| kind.as_str());

    increment_counter!(
        "captures_total",
        "format" => format.extension(),
        "outcome" => outcome
    );
    histogram!(
        "capture_duration_seconds",
        duration.as_secs_f64(),
        "format" => format.extension()
    );
}

pub fn record_rate_limited() {
    increment_counter!("capture_rate_limited_total");
}

pub fn set_in_flight(count: usize) {
    gauge!("captures_in_flight", count as f64);
}

/// Install the global Prometheus recorder
///
/// The returned handle renders the text exposition served at `/metrics`.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Periodically samples process-level gauges
pub struct MetricsCollector {
    start_time: Instant,
    collection_interval: Duration,
}

impl MetricsCollector {
    pub fn new(collection_interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            collection_interval,
        }
    }

    pub fn start_collection(&self) -> JoinHandle<()> {
        let interval = self.collection_interval;
        let start_time = self.start_time;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                interval_timer.tick().await;

                if let Some(memory) = resident_memory_bytes() {
                    gauge!("process_resident_memory_bytes", memory as f64);
                }
                gauge!("uptime_seconds", start_time.elapsed().as_secs_f64());

                debug!("Metrics collection completed");
            }
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
