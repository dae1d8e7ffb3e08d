//! Captures against a real headless Chrome
//!
//! Run with `cargo test --features browser_tests`. Chrome must be installed;
//! set `CHROME` to point at a specific executable.

#![cfg(feature = "browser_tests")]

use axum::response::Html;
use axum::routing::get;
use axum::Router;
use capture_service::{
    raster_dimensions, CaptureError, CaptureQuery, CaptureService, ClientId, Config, SessionMode,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const SCRIPTED_PAGE: &str = r#"<!doctype html>
<html>
  <head><title>fixture</title></head>
  <body style="margin:0">
    <div style="height:3000px;background:linear-gradient(#fff,#000)">tall</div>
    <script>
      const p = document.createElement('p');
      p.id = 'late';
      p.textContent = 'added by script';
      document.body.appendChild(p);
    </script>
  </body>
</html>"#;

async fn fixture_server() -> SocketAddr {
    let app = Router::new()
        .route("/page", get(|| async { Html(SCRIPTED_PAGE) }))
        .route(
            "/hang",
            get(|| async {
                std::future::pending::<()>().await;
                Html("never")
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config(mode: SessionMode) -> Config {
    let mut config = Config::default();
    config.browser.sandbox = false;
    config.browser.session_mode = mode;
    config.browser.pool_size = 2;
    config.browser.chrome_path = std::env::var_os("CHROME").map(PathBuf::from);
    config.rate_limit.max_requests = 100;
    config
}

fn query(addr: SocketAddr, path: &str, format: &str) -> CaptureQuery {
    CaptureQuery {
        url: Some(format!("http://{addr}{path}")),
        format: Some(format.to_string()),
        width: Some("800".into()),
        height: Some("600".into()),
        full_page: None,
    }
}

#[tokio::test]
async fn test_raster_matches_viewport() {
    let addr = fixture_server().await;
    let service = CaptureService::new(config(SessionMode::PerRequest)).await.unwrap();

    let png = service
        .capture_query(&ClientId::Unidentified, query(addr, "/page", "png"))
        .await
        .unwrap();
    assert_eq!(png.mime_type, "image/png");
    assert_eq!(raster_dimensions(&png.bytes), Some((800, 600)));

    let jpeg = service
        .capture_query(&ClientId::Unidentified, query(addr, "/page", "jpeg"))
        .await
        .unwrap();
    assert_eq!(raster_dimensions(&jpeg.bytes), Some((800, 600)));

    let full = service
        .capture_query(
            &ClientId::Unidentified,
            CaptureQuery {
                full_page: Some("true".into()),
                ..query(addr, "/page", "png")
            },
        )
        .await
        .unwrap();
    let (_, height) = raster_dimensions(&full.bytes).unwrap();
    assert!(height >= 3000);

    service.shutdown().await;
}

#[tokio::test]
async fn test_html_and_pdf_outputs() {
    let addr = fixture_server().await;
    let service = CaptureService::new(config(SessionMode::PerRequest)).await.unwrap();

    let html = service
        .capture_query(&ClientId::Unidentified, query(addr, "/page", "html"))
        .await
        .unwrap();
    let markup = String::from_utf8(html.bytes).unwrap();
    assert!(markup.contains(r#"<p id="late">added by script</p>"#));

    let pdf = service
        .capture_query(&ClientId::Unidentified, query(addr, "/page", "pdf"))
        .await
        .unwrap();
    assert!(pdf.bytes.starts_with(b"%PDF"));

    service.shutdown().await;
}

async fn capture_hanging_target(deadline: Duration) -> (CaptureError, Duration) {
    let addr = fixture_server().await;
    let mut config = config(SessionMode::PerRequest);
    config.navigation_timeout = deadline;
    let service = CaptureService::new(config).await.unwrap();

    let started = Instant::now();
    let err = service
        .capture_query(&ClientId::Unidentified, query(addr, "/hang", "png"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    service.shutdown().await;
    (err, elapsed)
}

#[tokio::test]
async fn test_unresponsive_target_times_out() {
    let deadline = Duration::from_secs(3);
    let (err, elapsed) = capture_hanging_target(deadline).await;

    assert!(matches!(err, CaptureError::NavigationTimeout(_)), "{err:?}");
    assert!(elapsed >= deadline, "gave up after {elapsed:?}");
    // Browser launch and teardown on top of the deadline
    assert!(elapsed < deadline + Duration::from_secs(10), "took {elapsed:?}");
}

#[tokio::test]
async fn test_deadline_longer_than_default_command_timeout() {
    let deadline = Duration::from_secs(35);
    let (err, elapsed) = capture_hanging_target(deadline).await;

    assert!(matches!(err, CaptureError::NavigationTimeout(_)), "{err:?}");
    assert!(elapsed >= deadline, "gave up after {elapsed:?}");
    assert!(elapsed < deadline + Duration::from_secs(10), "took {elapsed:?}");
}

#[tokio::test]
async fn test_pooled_mode_reuses_browsers() {
    let addr = fixture_server().await;
    let service = CaptureService::new(config(SessionMode::Pooled)).await.unwrap();

    for _ in 0..4 {
        let png = service
            .capture_query(&ClientId::Unidentified, query(addr, "/page", "png"))
            .await
            .unwrap();
        assert_eq!(raster_dimensions(&png.bytes), Some((800, 600)));
    }

    // Returns happen on a background task
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = service.pool_stats().await.unwrap();
    assert_eq!(stats.total_instances, 2);
    assert_eq!(stats.total_captures, 4);
    assert_eq!(stats.available_instances, 2);

    service.shutdown().await;
}
