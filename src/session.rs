//! Headless browser sessions
//!
//! A session is one page in a browser that belongs to a single capture. The
//! orchestrator only talks to the [`BrowserSession`] and [`SessionLauncher`]
//! traits; [`ChromeLauncher`] launches a dedicated Chrome per request and
//! [`crate::PooledLauncher`] hands out isolated contexts in pooled browsers.
//!
//! Sessions are closed explicitly by the orchestrator. A session that is
//! dropped without being closed (cancelled request, panic) tears itself down
//! on a background task.

use crate::{
    browser_profile_dir, create_browser_config, BrowserHandle, BrowserPoolStats, BrowserSettings,
    IdleCondition, SessionError, Viewport,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventLifecycleEvent, NavigateParams, PrintToPdfParams,
    SetLifecycleEventsEnabledParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// A4 paper size in inches
const A4_WIDTH_IN: f64 = 8.27;
const A4_HEIGHT_IN: f64 = 11.69;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Png,
    Jpeg { quality: u8 },
}

/// One page owned by a single capture
#[async_trait]
pub trait BrowserSession: Send {
    async fn set_viewport(&mut self, viewport: &Viewport) -> Result<(), SessionError>;

    /// Load `url` and resolve once the page reports `idle`
    ///
    /// Has no deadline of its own; the caller bounds it.
    async fn navigate(&mut self, url: &Url, idle: IdleCondition) -> Result<(), SessionError>;

    async fn screenshot(&mut self, format: RasterFormat, full_page: bool) -> Result<Vec<u8>, SessionError>;

    /// Render to an A4 document with backgrounds printed
    async fn print_pdf(&mut self) -> Result<Vec<u8>, SessionError>;

    /// Serialized DOM after scripts ran
    async fn rendered_html(&mut self) -> Result<String, SessionError>;

    /// Release the page and its browser resources; idempotent
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Produces a fresh, isolated session for each capture
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn open(&self, viewport: &Viewport) -> Result<Box<dyn BrowserSession>, SessionError>;

    async fn pool_stats(&self) -> Option<BrowserPoolStats> {
        None
    }

    async fn shutdown(&self) {}
}

/// Launches a dedicated headless Chrome for every session
pub struct ChromeLauncher {
    settings: BrowserSettings,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn open(&self, viewport: &Viewport) -> Result<Box<dyn BrowserSession>, SessionError> {
        let profile_dir = browser_profile_dir("session");
        let (browser, handler) = launch_browser(&self.settings, viewport, profile_dir.clone()).await?;

        let mut owner = SessionOwner::Dedicated {
            browser,
            handler,
            profile_dir,
        };

        let page = match owner.new_page().await {
            Ok(page) => page,
            Err(e) => {
                owner.release().await;
                return Err(e);
            }
        };

        Ok(Box::new(ChromeSession::new(page, owner)))
    }
}

/// Launch Chrome and spawn the task that drives its DevTools connection
pub(crate) async fn launch_browser(
    settings: &BrowserSettings,
    viewport: &Viewport,
    profile_dir: PathBuf,
) -> Result<(Browser, JoinHandle<()>), SessionError> {
    tokio::fs::create_dir_all(&profile_dir).await?;

    let config = create_browser_config(settings, viewport, &profile_dir).map_err(SessionError::LaunchFailed)?;

    let (browser, mut handler) = match Browser::launch(config).await {
        Ok(launched) => launched,
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&profile_dir).await;
            return Err(SessionError::LaunchFailed(e.to_string()));
        }
    };

    // The handler stream must be polled for any CDP command to complete
    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("Browser handler error: {}", e);
            }
        }
        debug!("Browser handler stream ended");
    });

    Ok((browser, handler_task))
}

/// What has to be released when a session ends
pub(crate) enum SessionOwner {
    Dedicated {
        browser: Browser,
        handler: JoinHandle<()>,
        profile_dir: PathBuf,
    },
    Pooled {
        handle: BrowserHandle,
        context_id: BrowserContextId,
    },
}

impl SessionOwner {
    pub(crate) async fn new_page(&mut self) -> Result<Page, SessionError> {
        match self {
            SessionOwner::Dedicated { browser, .. } => Ok(browser.new_page("about:blank").await?),
            SessionOwner::Pooled { handle, context_id } => handle.new_page_in_context(context_id.clone()).await,
        }
    }

    pub(crate) async fn release(self) {
        match self {
            SessionOwner::Dedicated {
                mut browser,
                handler,
                profile_dir,
            } => {
                if let Err(e) = browser.close().await {
                    warn!("Browser close failed, killing process: {}", e);
                    let _ = browser.kill().await;
                }
                let _ = browser.wait().await;
                handler.abort();

                if let Err(e) = tokio::fs::remove_dir_all(&profile_dir).await {
                    debug!("Could not remove profile dir {}: {}", profile_dir.display(), e);
                }
            }
            SessionOwner::Pooled { handle, context_id } => {
                if let Err(e) = handle.dispose_context(context_id).await {
                    warn!("Failed to dispose browser context on instance {}: {}", handle.instance_id, e);
                    handle.mark_failed().await;
                }
                // Dropping the handle returns the browser to the pool
            }
        }
    }
}

/// Chrome-backed [`BrowserSession`]
pub struct ChromeSession {
    page: Page,
    owner: Option<SessionOwner>,
}

impl ChromeSession {
    pub(crate) fn new(page: Page, owner: SessionOwner) -> Self {
        Self {
            page,
            owner: Some(owner),
        }
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn set_viewport(&mut self, viewport: &Viewport) -> Result<(), SessionError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(false)
            .build()
            .map_err(SessionError::Page)?;

        self.page.execute(params).await?;
        Ok(())
    }

    async fn navigate(&mut self, url: &Url, idle: IdleCondition) -> Result<(), SessionError> {
        self.page.execute(SetLifecycleEventsEnabledParams::new(true)).await?;

        // Subscribe before navigating so the idle event cannot be missed
        let mut lifecycle = self.page.event_listener::<EventLifecycleEvent>().await?;

        let navigation = self.page.execute(NavigateParams::new(url.as_str())).await?.result;
        if let Some(error_text) = navigation.error_text {
            return Err(SessionError::Navigation(error_text));
        }

        let wanted = idle.lifecycle_event();
        while let Some(event) = lifecycle.next().await {
            let same_load = navigation
                .loader_id
                .as_ref()
                .map_or(true, |loader| *loader == event.loader_id);

            if same_load && event.name == wanted && event.frame_id == navigation.frame_id {
                debug!("{} reached {}", url, wanted);
                return Ok(());
            }
        }

        Err(SessionError::Closed)
    }

    async fn screenshot(&mut self, format: RasterFormat, full_page: bool) -> Result<Vec<u8>, SessionError> {
        let params = match format {
            RasterFormat::Png => ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(full_page)
                .build(),
            RasterFormat::Jpeg { quality } => ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Jpeg)
                .quality(i64::from(quality))
                .full_page(full_page)
                .build(),
        };

        self.page
            .screenshot(params)
            .await
            .map_err(|e| SessionError::Extraction(e.to_string()))
    }

    async fn print_pdf(&mut self) -> Result<Vec<u8>, SessionError> {
        let params = PrintToPdfParams::builder()
            .print_background(true)
            .paper_width(A4_WIDTH_IN)
            .paper_height(A4_HEIGHT_IN)
            .build();

        self.page
            .pdf(params)
            .await
            .map_err(|e| SessionError::Extraction(e.to_string()))
    }

    async fn rendered_html(&mut self) -> Result<String, SessionError> {
        self.page
            .content()
            .await
            .map_err(|e| SessionError::Extraction(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let Some(owner) = self.owner.take() else {
            return Ok(());
        };

        let page_closed = self.page.clone().close().await;
        owner.release().await;
        page_closed.map_err(SessionError::from)
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };

        let page = self.page.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Browser session dropped without close, tearing down in background");
                runtime.spawn(async move {
                    let _ = page.close().await;
                    owner.release().await;
                });
            }
            Err(_) => warn!("Browser session dropped outside a runtime; process may leak"),
        }
    }
}
