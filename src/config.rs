//! Configuration management with serde serialization/deserialization
//!
//! This module holds every tunable of the capture service: the listener
//! address, navigation deadline, viewport defaults and bounds, rate limiting
//! and the headless browser launch settings.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Headroom between the navigation deadline and the browser's own command timeout
const COMMAND_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Main configuration structure for the capture service
///
/// Every field has a default, so a configuration file only needs to name the
/// values it changes.
///
/// # Examples
///
/// ```rust
/// use capture_service::Config;
///
/// let config = Config {
///     max_concurrent_captures: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP listener binds to (default: 0.0.0.0:3000)
    pub bind_address: SocketAddr,

    /// Deadline for a page to reach network idle (default: 30 seconds)
    pub navigation_timeout: Duration,

    /// Which lifecycle signal counts as "network idle" (default: no connections)
    pub network_idle: IdleCondition,

    /// Viewport used when a request omits width or height (default: 1280x800)
    pub default_viewport: Viewport,

    /// Bounds requested viewports are clamped into
    pub viewport_bounds: ViewportBounds,

    /// JPEG encoder quality for raster-jpeg captures (default: 80)
    pub jpeg_quality: u8,

    /// Sliding window rate limiting per client
    pub rate_limit: RateLimitConfig,

    /// Headless browser launch settings
    pub browser: BrowserSettings,

    /// Maximum number of captures running at once (default: 2x CPU count)
    ///
    /// Requests beyond this wait for a slot; they are never rejected for it.
    pub max_concurrent_captures: usize,

    /// Install the Prometheus recorder and serve `/metrics` (default: false)
    pub enable_metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 3000)),
            navigation_timeout: Duration::from_secs(30),
            network_idle: IdleCondition::default(),
            default_viewport: Viewport::default(),
            viewport_bounds: ViewportBounds::default(),
            jpeg_quality: 80,
            rate_limit: RateLimitConfig::default(),
            browser: BrowserSettings::default(),
            max_concurrent_captures: num_cpus::get() * 2,
            enable_metrics: false,
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.navigation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "navigation timeout must be greater than 0".into(),
            ));
        }

        if self.max_concurrent_captures == 0 {
            return Err(ConfigError::Invalid(
                "max concurrent captures must be greater than 0".into(),
            ));
        }

        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "rate limit must allow at least one request".into(),
            ));
        }

        if self.rate_limit.window.is_zero() {
            return Err(ConfigError::Invalid(
                "rate limit window must be greater than 0".into(),
            ));
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg quality {} outside 1..=100",
                self.jpeg_quality
            )));
        }

        let b = &self.viewport_bounds;
        if b.min_width == 0 || b.min_height == 0 || b.min_width > b.max_width || b.min_height > b.max_height {
            return Err(ConfigError::Invalid(format!(
                "viewport bounds {}-{} x {}-{} are not a valid range",
                b.min_width, b.max_width, b.min_height, b.max_height
            )));
        }

        if matches!(self.browser.session_mode, SessionMode::Pooled) && self.browser.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "browser pool size must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Browser settings with the DevTools command timeout raised past the
    /// navigation deadline
    ///
    /// `Page.navigate` does not return until the target responds, so a command
    /// timeout shorter than `navigation_timeout` would fail slow targets early.
    pub fn browser_settings(&self) -> BrowserSettings {
        let mut settings = self.browser.clone();
        settings.command_timeout = settings
            .command_timeout
            .max(self.navigation_timeout + COMMAND_TIMEOUT_MARGIN);
        settings
    }
}

/// Browser viewport used for rendering
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in CSS pixels
    pub width: u32,

    /// Viewport height in CSS pixels
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    ///
    /// Raster output is `width * device_scale_factor` pixels wide.
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
            device_scale_factor: 1.0,
        }
    }
}

/// Inclusive bounds for requested viewport dimensions
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ViewportBounds {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

impl Default for ViewportBounds {
    fn default() -> Self {
        Self {
            min_width: 320,
            max_width: 3840,
            min_height: 240,
            max_height: 2160,
        }
    }
}

impl ViewportBounds {
    pub fn clamp(&self, width: u32, height: u32) -> (u32, u32) {
        (
            width.clamp(self.min_width, self.max_width),
            height.clamp(self.min_height, self.max_height),
        )
    }
}

/// Chrome lifecycle signal used to decide that a page finished loading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleCondition {
    /// No in-flight connections for 500ms (`networkIdle`)
    #[default]
    NoConnections,
    /// At most two in-flight connections for 500ms (`networkAlmostIdle`)
    FewConnections,
}

impl IdleCondition {
    pub fn lifecycle_event(&self) -> &'static str {
        match self {
            IdleCondition::NoConnections => "networkIdle",
            IdleCondition::FewConnections => "networkAlmostIdle",
        }
    }
}

/// Sliding window rate limiting settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per client inside one window (default: 5)
    pub max_requests: usize,

    /// Length of the sliding window (default: 60 seconds)
    pub window: Duration,

    /// How often idle clients are evicted from the table (default: 60 seconds)
    pub sweep_interval: Duration,

    /// Identify clients by the first `X-Forwarded-For` hop (default: true)
    ///
    /// Disable when the service is reachable without a trusted proxy in front.
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            trust_forwarded_for: true,
        }
    }
}

/// How browser sessions are obtained for each capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Launch a fresh browser process per request and close it afterwards
    #[default]
    PerRequest,
    /// Check out a long-lived browser and isolate the request in a new context
    Pooled,
}

/// Headless browser launch settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub session_mode: SessionMode,

    /// Number of browsers kept warm in pooled mode (default: CPU count)
    pub pool_size: usize,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<PathBuf>,

    /// Keep Chrome's process sandbox enabled (default: true)
    ///
    /// Containers that run Chrome as root without user namespaces need this
    /// turned off.
    pub sandbox: bool,

    /// Custom User-Agent string (default: Chrome default)
    pub user_agent: Option<String>,

    /// How long to wait for the browser process to come up (default: 20 seconds)
    pub launch_timeout: Duration,

    /// Timeout for a single DevTools command (default: 30 seconds)
    ///
    /// [`Config::browser_settings`] raises it above the navigation timeout.
    pub command_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            session_mode: SessionMode::default(),
            pool_size: num_cpus::get(),
            chrome_path: None,
            sandbox: true,
            user_agent: None,
            launch_timeout: Duration::from_secs(20),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Generate Chrome command-line arguments for headless capture
///
/// Sandbox flags are not part of this list; they are applied through the
/// launch builder in [`create_browser_config`].
///
/// # Examples
///
/// ```rust
/// use capture_service::{BrowserSettings, Viewport, get_chrome_args};
///
/// let args = get_chrome_args(&BrowserSettings::default(), &Viewport::default());
/// assert!(args.contains(&"--window-size=1280,800".to_string()));
/// ```
pub fn get_chrome_args(settings: &BrowserSettings, viewport: &Viewport) -> Vec<String> {
    let mut args = vec![
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        format!("--window-size={},{}", viewport.width, viewport.height),
    ];

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

/// Build the chromiumoxide launch configuration
///
/// `profile_dir` must be unique per running browser; Chrome refuses to share a
/// user data directory between processes.
pub fn create_browser_config(
    settings: &BrowserSettings,
    viewport: &Viewport,
    profile_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, String> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(viewport.width, viewport.height)
        .user_data_dir(profile_dir)
        .launch_timeout(settings.launch_timeout)
        .request_timeout(settings.command_timeout)
        .args(get_chrome_args(settings, viewport));

    if !settings.sandbox {
        builder = builder.no_sandbox();
    }

    if let Some(chrome_path) = &settings.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build()
}

/// Unique scratch profile directory for one browser process
pub fn browser_profile_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "capture-service-{}-{}-{}",
        std::process::id(),
        label,
        uuid::Uuid::new_v4()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.navigation_timeout, Duration::from_secs(30));
        assert_eq!(config.default_viewport.width, 1280);
        assert_eq!(config.default_viewport.height, 800);
        assert_eq!(config.jpeg_quality, 80);
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert!(config.browser.sandbox);
        assert_eq!(config.browser.session_mode, SessionMode::PerRequest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "jpeg_quality": 60, "browser": { "sandbox": false, "session_mode": "pooled" } }"#,
        )
        .unwrap();

        assert_eq!(config.jpeg_quality, 60);
        assert!(!config.browser.sandbox);
        assert_eq!(config.browser.session_mode, SessionMode::Pooled);
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.default_viewport, Viewport::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            navigation_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.viewport_bounds.min_width = 4000;
        assert!(config.validate().is_err());

        let config = Config {
            jpeg_quality: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_viewport_bounds_clamp() {
        let bounds = ViewportBounds::default();
        assert_eq!(bounds.clamp(100, 100), (320, 240));
        assert_eq!(bounds.clamp(10_000, 10_000), (3840, 2160));
        assert_eq!(bounds.clamp(1280, 800), (1280, 800));
    }

    #[test]
    fn test_chrome_args_generation() {
        let settings = BrowserSettings {
            user_agent: Some("capture-bot/1.0".into()),
            ..Default::default()
        };
        let args = get_chrome_args(&settings, &Viewport::default());

        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args.contains(&"--window-size=1280,800".to_string()));
        assert!(args.contains(&"--user-agent=capture-bot/1.0".to_string()));
        assert!(!args.iter().any(|a| a == "--no-sandbox"));
    }

    #[test]
    fn test_command_timeout_outlasts_navigation_timeout() {
        let config = Config {
            navigation_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let settings = config.browser_settings();
        assert!(settings.command_timeout > Duration::from_secs(60));

        let defaults = Config::default().browser_settings();
        assert!(defaults.command_timeout > Config::default().navigation_timeout);

        // A larger configured value is kept
        let mut config = Config::default();
        config.browser.command_timeout = Duration::from_secs(300);
        assert_eq!(config.browser_settings().command_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_profile_dirs_are_unique() {
        assert_ne!(browser_profile_dir("a"), browser_profile_dir("a"));
    }
}
