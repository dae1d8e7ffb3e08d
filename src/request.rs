//! Capture request parsing and output formats

use crate::{validate_url, CaptureError, Config, Viewport};
use serde::Deserialize;
use url::Url;

/// Output formats a capture can produce
///
/// Unrecognised format names fall back to [`CaptureFormat::Png`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CaptureFormat {
    #[default]
    Png,
    Jpeg,
    Pdf,
    Html,
}

impl CaptureFormat {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("jpeg") => CaptureFormat::Jpeg,
            Some("pdf") => CaptureFormat::Pdf,
            Some("html") => CaptureFormat::Html,
            _ => CaptureFormat::Png,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            CaptureFormat::Png => "image/png",
            CaptureFormat::Jpeg => "image/jpeg",
            CaptureFormat::Pdf => "application/pdf",
            CaptureFormat::Html => "text/html",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CaptureFormat::Png => "png",
            CaptureFormat::Jpeg => "jpeg",
            CaptureFormat::Pdf => "pdf",
            CaptureFormat::Html => "html",
        }
    }

    pub fn is_raster(&self) -> bool {
        matches!(self, CaptureFormat::Png | CaptureFormat::Jpeg)
    }
}

impl std::fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Raw query parameters as they arrive over HTTP
///
/// Everything is optional text; [`CaptureRequest::from_query`] applies
/// defaults and validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureQuery {
    pub url: Option<String>,
    pub format: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    #[serde(rename = "fullPage")]
    pub full_page: Option<String>,
}

/// A validated capture request
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub target_url: Url,
    pub format: CaptureFormat,
    pub viewport: Viewport,
    /// Only meaningful for raster formats
    pub full_page: bool,
}

impl CaptureRequest {
    /// Build a request with default options for `url`
    pub fn new(url: &str, config: &Config) -> Result<Self, CaptureError> {
        Self::from_query(
            CaptureQuery {
                url: Some(url.to_string()),
                ..Default::default()
            },
            config,
        )
    }

    pub fn from_query(query: CaptureQuery, config: &Config) -> Result<Self, CaptureError> {
        let raw_url = query
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CaptureError::InvalidRequest("URL is required".to_string()))?;

        let target_url = validate_url(raw_url)
            .map_err(|e| CaptureError::InvalidRequest(format!("invalid URL {raw_url:?}: {e}")))?;

        let defaults = config.default_viewport;
        let width = parse_dimension(query.width.as_deref(), defaults.width);
        let height = parse_dimension(query.height.as_deref(), defaults.height);
        let (width, height) = config.viewport_bounds.clamp(width, height);

        Ok(Self {
            target_url,
            format: CaptureFormat::parse(query.format.as_deref()),
            viewport: Viewport {
                width,
                height,
                ..defaults
            },
            full_page: query.full_page.as_deref() == Some("true"),
        })
    }
}

/// Read the leading integer of a dimension, so `"800px"` and `"800.5"` are 800
///
/// No leading digits means the default applies. Negative values come out as
/// zero and oversized ones as `u32::MAX`; the bounds clamp both afterwards.
fn parse_dimension(value: Option<&str>, fallback: u32) -> u32 {
    let Some(value) = value.map(str::trim_start) else {
        return fallback;
    };

    let (negative, rest) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };

    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if end == 0 {
        return fallback;
    }
    if negative {
        return 0;
    }

    rest[..end].parse::<u32>().unwrap_or(u32::MAX)
}

/// Output of a successful capture, handed straight to the transport
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub suggested_filename: String,
}

impl CaptureResult {
    pub fn new(bytes: Vec<u8>, format: CaptureFormat) -> Self {
        Self {
            bytes,
            mime_type: format.mime_type(),
            suggested_filename: format!("capture.{}", format.extension()),
        }
    }

    pub fn content_disposition(&self) -> String {
        format!("attachment; filename={}", self.suggested_filename)
    }
}
