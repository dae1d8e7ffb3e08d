//! Browser pool management for pooled session mode
//!
//! Keeps a fixed set of headless Chrome instances warm. A capture checks out
//! one instance exclusively, runs inside a fresh incognito browser context so
//! no cookies or storage survive between captures, and the instance goes
//! back to the pool when the [`BrowserHandle`] is dropped.

use crate::session::{launch_browser, SessionOwner};
use crate::{
    browser_profile_dir, BrowserSession, BrowserSettings, ChromeSession, SessionError, SessionLauncher,
    Viewport,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::page::Page;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Current status of a browser instance in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Ready to be checked out
    Healthy,
    /// Checked out by a capture
    Busy,
    /// Being replaced by a fresh process
    Restarting,
    /// Needs replacement before its next use
    Failed,
}

/// A single pooled Chrome process
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    /// Drives the DevTools connection; finished means the browser is gone
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    pub last_used: Instant,
    pub capture_count: usize,
    pub status: InstanceStatus,
    pub failure_count: usize,
}

impl BrowserInstance {
    fn new(id: usize, browser: Browser, handler: JoinHandle<()>, profile_dir: PathBuf) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            profile_dir,
            last_used: Instant::now(),
            capture_count: 0,
            status: InstanceStatus::Healthy,
            failure_count: 0,
        }
    }

    fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.capture_count += 1;
        self.status = InstanceStatus::Busy;
    }

    fn is_usable(&self) -> bool {
        matches!(self.status, InstanceStatus::Healthy) && !self.handler.is_finished()
    }

    async fn shutdown(self) {
        {
            let mut browser = self.browser.lock().await;
            if browser.close().await.is_err() {
                let _ = browser.kill().await;
            }
            let _ = browser.wait().await;
        }
        self.handler.abort();
        let _ = tokio::fs::remove_dir_all(&self.profile_dir).await;
    }
}

/// Exclusive checkout of one pooled browser
///
/// Dropping the handle returns the instance to the pool.
pub struct BrowserHandle {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: BrowserPool,
    permit: Option<OwnedSemaphorePermit>,
}

impl BrowserHandle {
    /// Open an incognito context isolated from every other capture
    pub async fn open_context(&self) -> Result<BrowserContextId, SessionError> {
        let mut browser = self.browser.lock().await;
        Ok(browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await?)
    }

    pub async fn new_page_in_context(&self, context_id: BrowserContextId) -> Result<Page, SessionError> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id)
            .build()
            .map_err(SessionError::Page)?;

        let browser = self.browser.lock().await;
        Ok(browser.new_page(params).await?)
    }

    pub async fn dispose_context(&self, context_id: BrowserContextId) -> Result<(), SessionError> {
        let browser = self.browser.lock().await;
        browser.dispose_browser_context(context_id).await?;
        Ok(())
    }

    pub async fn mark_failed(&self) {
        self.pool.mark_failed(self.instance_id).await;
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let instance_id = self.instance_id;
        // Released only after the instance is back in the queue
        let permit = self.permit.take();

        tokio::spawn(async move {
            pool.return_browser(instance_id).await;
            drop(permit);
        });
    }
}

pub struct BrowserPool {
    instances: Arc<Mutex<Vec<BrowserInstance>>>,
    available: Arc<Mutex<VecDeque<usize>>>,
    semaphore: Arc<Semaphore>,
    settings: BrowserSettings,
    viewport: Viewport,
    is_shutting_down: Arc<AtomicBool>,
}

impl BrowserPool {
    pub async fn new(settings: BrowserSettings, viewport: Viewport) -> Result<Self, SessionError> {
        let pool = Self {
            instances: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(Mutex::new(VecDeque::new())),
            semaphore: Arc::new(Semaphore::new(settings.pool_size)),
            settings,
            viewport,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        };

        pool.initialize_instances().await?;
        pool.start_health_check_task();

        Ok(pool)
    }

    async fn initialize_instances(&self) -> Result<(), SessionError> {
        let mut instances = self.instances.lock().await;
        let mut available = self.available.lock().await;

        for i in 0..self.settings.pool_size {
            match self.create_browser_instance(i).await {
                Ok(instance) => {
                    instances.push(instance);
                    available.push_back(i);
                    info!("Browser instance {} created successfully", i);
                }
                Err(e) => {
                    error!("Failed to create browser instance {}: {}", i, e);
                    for instance in instances.drain(..) {
                        instance.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        info!("Browser pool initialized with {} instances", instances.len());
        Ok(())
    }

    async fn create_browser_instance(&self, id: usize) -> Result<BrowserInstance, SessionError> {
        let profile_dir = browser_profile_dir(&format!("pool-{id}"));
        let (browser, handler) = launch_browser(&self.settings, &self.viewport, profile_dir.clone()).await?;
        Ok(BrowserInstance::new(id, browser, handler, profile_dir))
    }

    pub async fn get_browser(&self) -> Result<BrowserHandle, SessionError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(SessionError::Unavailable);
        }

        let permit = self.semaphore.clone().acquire_owned().await?;

        for attempt in 0..self.settings.pool_size.max(1) {
            let instance_id = self
                .available
                .lock()
                .await
                .pop_front()
                .ok_or(SessionError::Unavailable)?;

            let usable = {
                let instances = self.instances.lock().await;
                instances
                    .get(instance_id)
                    .map(BrowserInstance::is_usable)
                    .unwrap_or(false)
            };

            if !usable {
                warn!(
                    "Browser instance {} unhealthy (attempt {}), restarting",
                    instance_id,
                    attempt + 1
                );
                if let Err(e) = self.restart_instance(instance_id).await {
                    error!("Failed to restart browser instance {}: {}", instance_id, e);
                    self.available.lock().await.push_back(instance_id);
                    continue;
                }
            }

            let mut instances = self.instances.lock().await;
            if let Some(instance) = instances.get_mut(instance_id) {
                instance.mark_used();
                return Ok(BrowserHandle {
                    browser: instance.browser.clone(),
                    instance_id,
                    pool: self.clone(),
                    permit: Some(permit),
                });
            }
        }

        Err(SessionError::Unavailable)
    }

    pub async fn return_browser(&self, instance_id: usize) {
        let mut instances = self.instances.lock().await;
        let mut available = self.available.lock().await;

        if let Some(instance) = instances.get_mut(instance_id) {
            if instance.status == InstanceStatus::Busy {
                instance.status = InstanceStatus::Healthy;
            }
            available.push_back(instance_id);
        }
    }

    pub async fn mark_failed(&self, instance_id: usize) {
        if let Some(instance) = self.instances.lock().await.get_mut(instance_id) {
            instance.failure_count += 1;
            instance.status = InstanceStatus::Failed;
        }
    }

    /// Replace an instance with a freshly launched browser
    ///
    /// The new process is launched without holding the instance lock.
    pub async fn restart_instance(&self, instance_id: usize) -> Result<(), SessionError> {
        {
            let mut instances = self.instances.lock().await;
            let instance = instances.get_mut(instance_id).ok_or(SessionError::Unavailable)?;
            instance.status = InstanceStatus::Restarting;
        }

        match self.create_browser_instance(instance_id).await {
            Ok(fresh) => {
                let stale = {
                    let mut instances = self.instances.lock().await;
                    match instances.get_mut(instance_id) {
                        Some(slot) => std::mem::replace(slot, fresh),
                        // Pool was drained by shutdown meanwhile
                        None => fresh,
                    }
                };
                stale.shutdown().await;
                info!("Browser instance {} restarted successfully", instance_id);
                metrics::increment_counter!("browser_restarts_total");
                Ok(())
            }
            Err(e) => {
                if let Some(instance) = self.instances.lock().await.get_mut(instance_id) {
                    instance.status = InstanceStatus::Failed;
                    instance.failure_count += 1;
                }
                Err(e)
            }
        }
    }

    fn start_health_check_task(&self) {
        let pool = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));

            while !pool.is_shutting_down.load(Ordering::Relaxed) {
                interval.tick().await;
                pool.restart_crashed_instances().await;
            }
        });
    }

    /// Restart idle instances whose browser died or was marked failed
    async fn restart_crashed_instances(&self) {
        let to_restart: Vec<usize> = {
            let instances = self.instances.lock().await;
            let available = self.available.lock().await;

            instances
                .iter()
                .filter(|i| available.contains(&i.id))
                .filter(|i| i.status == InstanceStatus::Failed || i.handler.is_finished())
                .map(|i| i.id)
                .collect()
        };

        for instance_id in to_restart {
            // Checkouts wait on the semaphore while this permit is held, so
            // they never find the queue empty mid-restart
            let Ok(_permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("No idle permit for browser instance {}, leaving restart to checkout", instance_id);
                continue;
            };

            // Take it out of rotation while restarting
            let taken = {
                let mut available = self.available.lock().await;
                let before = available.len();
                available.retain(|&id| id != instance_id);
                available.len() != before
            };
            if !taken {
                continue;
            }

            warn!("Browser instance {} crashed or failed, restarting", instance_id);
            if let Err(e) = self.restart_instance(instance_id).await {
                error!("Failed to restart browser instance {} during health check: {}", instance_id, e);
            }
            self.available.lock().await.push_back(instance_id);
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        // Give in-flight captures a moment to return their instances
        for _ in 0..10 {
            if self.available.lock().await.len() >= self.settings.pool_size {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        let drained: Vec<BrowserInstance> = self.instances.lock().await.drain(..).collect();
        for instance in drained {
            instance.shutdown().await;
        }

        info!("Browser pool shutdown complete");
    }

    pub async fn get_stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;
        let available = self.available.lock().await;

        let mut stats = BrowserPoolStats {
            total_instances: instances.len(),
            available_instances: available.len(),
            ..Default::default()
        };

        for instance in instances.iter() {
            stats.total_captures += instance.capture_count;
            match instance.status {
                InstanceStatus::Healthy => stats.healthy_instances += 1,
                InstanceStatus::Busy => stats.busy_instances += 1,
                InstanceStatus::Failed => stats.failed_instances += 1,
                InstanceStatus::Restarting => {}
            }
        }

        stats
    }
}

impl Clone for BrowserPool {
    fn clone(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            available: self.available.clone(),
            semaphore: self.semaphore.clone(),
            settings: self.settings.clone(),
            viewport: self.viewport,
            is_shutting_down: self.is_shutting_down.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BrowserPoolStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub available_instances: usize,
    pub total_captures: usize,
}

/// [`SessionLauncher`] backed by a [`BrowserPool`]
pub struct PooledLauncher {
    pool: Arc<BrowserPool>,
}

impl PooledLauncher {
    pub async fn new(settings: BrowserSettings, viewport: Viewport) -> Result<Self, SessionError> {
        Ok(Self {
            pool: Arc::new(BrowserPool::new(settings, viewport).await?),
        })
    }
}

#[async_trait]
impl SessionLauncher for PooledLauncher {
    async fn open(&self, _viewport: &Viewport) -> Result<Box<dyn BrowserSession>, SessionError> {
        let handle = self.pool.get_browser().await?;

        let context_id = match handle.open_context().await {
            Ok(id) => id,
            Err(e) => {
                handle.mark_failed().await;
                return Err(e);
            }
        };

        let mut owner = SessionOwner::Pooled { handle, context_id };
        let page = match owner.new_page().await {
            Ok(page) => page,
            Err(e) => {
                owner.release().await;
                return Err(e);
            }
        };

        Ok(Box::new(ChromeSession::new(page, owner)))
    }

    async fn pool_stats(&self) -> Option<BrowserPoolStats> {
        Some(self.pool.get_stats().await)
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
