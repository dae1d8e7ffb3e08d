//! # Capture Service
//!
//! An HTTP service that loads a web page in headless Chrome and returns it as
//! a PNG or JPEG screenshot, an A4 PDF, or the rendered HTML.
//!
//! Every request passes a per-client sliding window rate limit (5 requests
//! per 60 seconds by default) before any browser work starts. Each capture
//! runs in its own browser process, or in its own incognito context inside a
//! pooled browser, and the session is closed on every exit path.
//!
//! ## Endpoint
//!
//! ```text
//! GET /api/capture-content?url=https://example.com&format=png&width=1280&height=800&fullPage=true
//! ```
//!
//! | Param | Default | Notes |
//! |-------|---------|-------|
//! | `url` | required | absolute http(s) URL |
//! | `format` | `png` | `png`, `jpeg`, `pdf` or `html`; anything else is `png` |
//! | `width` / `height` | `1280` / `800` | clamped to 320-3840 x 240-2160 |
//! | `fullPage` | `false` | only the literal `true` enables it |
//!
//! Failures come back as `{"error": ..., "kind": ...}` with status 400
//! (`invalid_request`), 429 (`rate_limited`, with `Retry-After`), 502
//! (`capture_failed`) or 504 (`navigation_timeout`).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_service::{CaptureService, CaptureRequest, ClientId, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let service = CaptureService::new(config.clone()).await?;
//!
//!     let request = CaptureRequest::new("https://example.com", &config)?;
//!     let capture = service.capture(&ClientId::Unidentified, request).await?;
//!     println!("Captured {} bytes", capture.bytes.len());
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # HTTP service on port 3000
//! capture-service serve --port 3000
//!
//! # One-off capture
//! capture-service capture --url https://example.com --format pdf --output page.pdf
//!
//! # Containers running Chrome as root
//! capture-service --no-sandbox serve
//! ```

/// Configuration and settings for the capture service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Capture request parsing and output formats
pub mod request;

/// Per-client sliding window rate limiting
pub mod rate_limiter;

/// Headless browser sessions
pub mod session;

/// Browser pool management for pooled session mode
pub mod browser_pool;

/// Capture orchestration
pub mod capture_service;

/// HTTP routes and server lifecycle
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Metrics recording and Prometheus export
pub mod metrics;

/// Service health reporting
pub mod health;

/// Utility functions and helpers
pub mod utils;


pub use browser_pool::*;
pub use capture_service::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use crate::metrics::*;
pub use rate_limiter::*;
pub use request::*;
pub use server::{router, AppState};
pub use session::*;
pub use utils::*;
