use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq)]
pub enum UrlError {
    #[error("{0}")]
    Parse(#[from] url::ParseError),

    #[error("unsupported scheme {0:?}, expected http or https")]
    UnsupportedScheme(String),
}

/// Parse an absolute http(s) URL
pub fn validate_url(url: &str) -> Result<Url, UrlError> {
    let parsed = Url::parse(url)?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(UrlError::UnsupportedScheme(other.to_string())),
    }

    Ok(parsed)
}

/// Pixel dimensions of an encoded raster image, read from its header
pub fn raster_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Resident set size of this process, Linux only
pub fn resident_memory_bytes() -> Option<usize> {
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    content
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageOutputFormat, Rgb};

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com/path?query=value").is_ok());
        assert!(matches!(
            validate_url("ftp://example.com"),
            Err(UrlError::UnsupportedScheme(_))
        ));
        assert!(matches!(validate_url("invalid-url"), Err(UrlError::Parse(_))));
        assert!(validate_url("").is_err());
        assert!(matches!(validate_url("http://"), Err(UrlError::Parse(_))));
    }

    #[test]
    fn test_raster_dimensions() {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::new(37, 21);
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
            .unwrap();

        assert_eq!(raster_dimensions(&png), Some((37, 21)));
        assert_eq!(raster_dimensions(b"<html></html>"), None);
    }
}
