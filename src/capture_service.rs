//! Capture orchestration
//!
//! [`CaptureService`] runs one capture per request: validate, pass the rate
//! gate, wait for a concurrency slot, open a browser session, navigate under
//! the deadline, extract the requested format and close the session again.
//! The session is closed on every path once it was opened.

use crate::metrics::{record_capture, record_rate_limited, set_in_flight};
use crate::{
    format_duration, raster_dimensions, BrowserPoolStats, BrowserSession, CaptureError, CaptureFormat, CaptureQuery,
    CaptureRequest, CaptureResult, ChromeLauncher, ClientId, Clock, Config, PooledLauncher, RasterFormat,
    RateDecision, RateLimiter, SessionError, SessionLauncher, SessionMode, SystemClock,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Headless capture service
///
/// # Examples
///
/// ```rust,no_run
/// use capture_service::{CaptureService, CaptureRequest, ClientId, Config};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let service = CaptureService::new(config.clone()).await?;
///
///     let request = CaptureRequest::new("https://example.com", &config)?;
///     let result = service.capture(&ClientId::Unidentified, request).await?;
///     println!("Captured {} bytes as {}", result.bytes.len(), result.mime_type);
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct CaptureService {
    config: Config,
    limiter: Arc<RateLimiter>,
    launcher: Arc<dyn SessionLauncher>,
    clock: Arc<dyn Clock>,
    concurrency_limiter: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl CaptureService {
    /// Build the service with the session launcher selected by `config`
    ///
    /// In pooled mode this launches the whole browser pool before returning.
    pub async fn new(config: Config) -> Result<Self, SessionError> {
        let launcher: Arc<dyn SessionLauncher> = match config.browser.session_mode {
            SessionMode::PerRequest => Arc::new(ChromeLauncher::new(config.browser_settings())),
            SessionMode::Pooled => Arc::new(
                PooledLauncher::new(config.browser_settings(), config.default_viewport).await?,
            ),
        };

        info!(
            "Capture service using {:?} sessions, {} concurrent captures",
            config.browser.session_mode, config.max_concurrent_captures
        );

        let service = Self::with_launcher(config, launcher, Arc::new(SystemClock));
        service.start_sweeper();
        Ok(service)
    }

    /// Build the service around an existing launcher and clock
    ///
    /// No background task is started; call [`CaptureService::start_sweeper`]
    /// to evict idle clients periodically.
    pub fn with_launcher(config: Config, launcher: Arc<dyn SessionLauncher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            concurrency_limiter: Arc::new(Semaphore::new(config.max_concurrent_captures)),
            config,
            launcher,
            clock,
            in_flight: Arc::new(AtomicUsize::new(0)),
            sweeper: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn start_sweeper(&self) {
        let handle = self
            .limiter
            .clone()
            .start_sweeper(self.config.rate_limit.sweep_interval, self.clock.clone());

        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Validate raw query parameters, then capture
    pub async fn capture_query(&self, client: &ClientId, query: CaptureQuery) -> Result<CaptureResult, CaptureError> {
        let request = match CaptureRequest::from_query(query, &self.config) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejected request from {}: {}", client, e);
                return Err(e);
            }
        };

        self.capture(client, request).await
    }

    pub async fn capture(&self, client: &ClientId, request: CaptureRequest) -> Result<CaptureResult, CaptureError> {
        let span = info_span!(
            "capture",
            request_id = %Uuid::new_v4(),
            client = %client,
            format = %request.format,
        );

        self.capture_admitted(client, request).instrument(span).await
    }

    async fn capture_admitted(&self, client: &ClientId, request: CaptureRequest) -> Result<CaptureResult, CaptureError> {
        match self.limiter.check(client, self.clock.now()) {
            RateDecision::Rejected { retry_after } => {
                warn!("Rate limit exceeded, retry after {:?}", retry_after);
                record_rate_limited();
                return Err(CaptureError::RateLimited { retry_after });
            }
            RateDecision::Admitted { in_window } => {
                debug!("Admitted ({}/{} in window)", in_window, self.config.rate_limit.max_requests);
            }
        }

        let _permit = self
            .concurrency_limiter
            .acquire()
            .await
            .map_err(|_| CaptureError::CaptureFailed("service is shutting down".to_string()))?;
        let _in_flight = InFlightGuard::enter(&self.in_flight);

        let start_time = Instant::now();
        info!("Capturing {}", request.target_url);

        let result = self.run_session(&request).await;
        let duration = start_time.elapsed();

        match &result {
            Ok(capture) => info!(
                "Captured {} ({} bytes) in {}",
                request.target_url,
                capture.bytes.len(),
                format_duration(duration)
            ),
            Err(CaptureError::CaptureFailed(detail)) => error!(
                "Capture of {} failed after {}: {}",
                request.target_url,
                format_duration(duration),
                detail
            ),
            Err(e) => warn!(
                "Capture of {} failed after {}: {}",
                request.target_url,
                format_duration(duration),
                e
            ),
        }

        record_capture(request.format, result.as_ref().err().map(CaptureError::kind), duration);
        result
    }

    async fn run_session(&self, request: &CaptureRequest) -> Result<CaptureResult, CaptureError> {
        let mut session = self.launcher.open(&request.viewport).await?;

        let extracted = self.drive(session.as_mut(), request).await;

        if let Err(e) = session.close().await {
            warn!("Browser session teardown reported an error: {}", e);
        }

        Ok(CaptureResult::new(extracted?, request.format))
    }

    async fn drive(&self, session: &mut dyn BrowserSession, request: &CaptureRequest) -> Result<Vec<u8>, CaptureError> {
        session.set_viewport(&request.viewport).await?;

        let deadline = self.config.navigation_timeout;
        match timeout(deadline, session.navigate(&request.target_url, self.config.network_idle)).await {
            Ok(navigated) => navigated?,
            Err(_) => return Err(CaptureError::NavigationTimeout(deadline)),
        }

        let bytes = match request.format {
            CaptureFormat::Png => session.screenshot(RasterFormat::Png, request.full_page).await?,
            CaptureFormat::Jpeg => {
                session
                    .screenshot(
                        RasterFormat::Jpeg {
                            quality: self.config.jpeg_quality,
                        },
                        request.full_page,
                    )
                    .await?
            }
            CaptureFormat::Pdf => session.print_pdf().await?,
            CaptureFormat::Html => session.rendered_html().await?.into_bytes(),
        };

        if request.format.is_raster() {
            if let Some((width, height)) = raster_dimensions(&bytes) {
                debug!("Raster output is {}x{}", width, height);
            }
        }

        Ok(bytes)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn pool_stats(&self) -> Option<BrowserPoolStats> {
        self.launcher.pool_stats().await
    }

    pub async fn shutdown(&self) {
        info!("Shutting down capture service...");
        self.concurrency_limiter.close();

        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        self.launcher.shutdown().await;
        info!("Capture service shutdown complete");
    }
}

/// Counts a capture as in flight for as long as it is alive
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::Relaxed) + 1;
        set_in_flight(now);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let now = self.counter.fetch_sub(1, Ordering::Relaxed) - 1;
        set_in_flight(now);
    }
}
