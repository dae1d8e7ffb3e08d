//! Sliding window rate limiting per client
//!
//! Each client keeps the timestamps of its admitted requests inside the
//! window. A request is admitted while fewer than `max_requests` timestamps
//! remain after pruning; rejected requests are not recorded.
//!
//! The table is a sharded [`DashMap`]. The prune-check-append sequence for one
//! client runs while holding that client's entry, so concurrent requests from
//! the same client can never both observe the last free slot.

use crate::RateLimitConfig;
use axum::http::HeaderMap;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Source of "now" for rate limiting decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Identity a request is rate limited under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientId {
    Ip(IpAddr),
    /// Forwarded value that is not a bare IP address (e.g. an obfuscated node)
    Opaque(String),
    /// Neither a forwarded header nor a peer address was available
    Unidentified,
}

impl ClientId {
    /// Derive the client identity for a request
    ///
    /// Uses the first hop of `X-Forwarded-For` when trusted and present,
    /// otherwise the transport peer address.
    pub fn from_request(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> Self {
        if trust_forwarded_for {
            let first_hop = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());

            if let Some(hop) = first_hop {
                return match hop.parse::<IpAddr>() {
                    Ok(ip) => ClientId::Ip(ip),
                    Err(_) => ClientId::Opaque(hop.to_string()),
                };
            }
        }

        match peer {
            Some(addr) => ClientId::Ip(addr.ip()),
            None => ClientId::Unidentified,
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::Ip(ip) => write!(f, "{ip}"),
            ClientId::Opaque(value) => write!(f, "{value}"),
            ClientId::Unidentified => f.write_str("unidentified"),
        }
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// `in_window` counts the admitted request itself
    Admitted { in_window: usize },
    /// The oldest request in the window expires after `retry_after`
    Rejected { retry_after: Duration },
}

impl RateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, RateDecision::Admitted { .. })
    }
}

pub struct RateLimiter {
    clients: DashMap<ClientId, VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        info!(
            "Creating rate limiter: {} requests per {:?}",
            config.max_requests, config.window
        );

        Self {
            clients: DashMap::new(),
            max_requests: config.max_requests,
            window: config.window,
        }
    }

    /// Admit or reject one request from `client` at `now`
    pub fn admit(&self, client: &ClientId, now: Instant) -> bool {
        self.check(client, now).is_admitted()
    }

    pub fn check(&self, client: &ClientId, now: Instant) -> RateDecision {
        let mut entry = self.clients.entry(client.clone()).or_default();
        let timestamps = entry.value_mut();

        // Keep timestamps >= now - window
        timestamps.retain(|&t| now.saturating_duration_since(t) <= self.window);

        if timestamps.len() >= self.max_requests {
            let oldest = timestamps.iter().min().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));

            debug!(
                "Rejecting {}: {} requests in window, retry after {:?}",
                client,
                timestamps.len(),
                retry_after
            );
            return RateDecision::Rejected { retry_after };
        }

        timestamps.push_back(now);
        let in_window = timestamps.len();
        debug!("Admitted {}: {} requests in window", client, in_window);

        RateDecision::Admitted { in_window }
    }

    /// Requests from `client` still inside the window at `now`
    pub fn occupancy(&self, client: &ClientId, now: Instant) -> usize {
        self.clients
            .get(client)
            .map(|timestamps| {
                timestamps
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) <= self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop clients with no request inside the window; returns how many went
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.clients.len();

        self.clients.retain(|_, timestamps| {
            timestamps.retain(|&t| now.saturating_duration_since(t) <= self.window);
            !timestamps.is_empty()
        });

        before.saturating_sub(self.clients.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Periodically evict idle clients so the table stays bounded by recent activity
    pub fn start_sweeper(self: Arc<Self>, interval: Duration, clock: Arc<dyn Clock>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting rate limiter sweeper (interval: {:?})", interval);
            let mut timer = tokio::time::interval(interval);
            // First tick fires immediately
            timer.tick().await;

            loop {
                timer.tick().await;
                let removed = self.sweep(clock.now());
                if removed > 0 {
                    debug!("Evicted {} idle clients from rate limiter", removed);
                }
                metrics::gauge!("rate_limiter_tracked_clients", self.tracked_clients() as f64);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limiter() -> RateLimiter {
        RateLimiter::new(&RateLimitConfig::default())
    }

    fn client(last: u8) -> ClientId {
        ClientId::Ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)))
    }

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let limiter = limiter();
        let start = Instant::now();
        let c = client(1);

        for i in 0..5 {
            assert!(limiter.admit(&c, start + Duration::from_secs(i)), "request {i}");
        }
        assert!(!limiter.admit(&c, start + Duration::from_secs(5)));
        assert_eq!(limiter.occupancy(&c, start + Duration::from_secs(5)), 5);
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let limiter = limiter();
        let start = Instant::now();
        let c = client(2);

        for _ in 0..5 {
            assert!(limiter.admit(&c, start));
        }
        for i in 1..10 {
            assert!(!limiter.admit(&c, start + Duration::from_secs(i)));
        }

        // Only the five admitted timestamps need to expire
        assert!(limiter.admit(&c, start + Duration::from_secs(61)));
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter();
        let start = Instant::now();
        let c = client(3);

        for i in 0..5 {
            assert!(limiter.admit(&c, start + Duration::from_secs(i * 10)));
        }
        // Timestamp at exactly now - window still counts
        assert!(!limiter.admit(&c, start + Duration::from_secs(60)));
        // First request (t=0) has left the window
        assert!(limiter.admit(&c, start + Duration::from_secs(61)));
        assert!(!limiter.admit(&c, start + Duration::from_secs(62)));
    }

    #[test]
    fn test_retry_after_tracks_oldest_request() {
        let limiter = limiter();
        let start = Instant::now();
        let c = client(4);

        for i in 0..5 {
            limiter.admit(&c, start + Duration::from_secs(i));
        }

        assert_eq!(
            limiter.check(&c, start + Duration::from_secs(20)),
            RateDecision::Rejected {
                retry_after: Duration::from_secs(40)
            }
        );
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.admit(&client(5), now));
        }
        assert!(!limiter.admit(&client(5), now));
        assert!(limiter.admit(&client(6), now));
        assert!(limiter.admit(&ClientId::Unidentified, now));
    }

    #[test]
    fn test_unidentified_clients_share_a_limited_bucket() {
        let limiter = limiter();
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.admit(&ClientId::Unidentified, now));
        }
        assert!(!limiter.admit(&ClientId::Unidentified, now));
    }

    #[test]
    fn test_sweep_evicts_idle_clients() {
        let limiter = limiter();
        let start = Instant::now();

        limiter.admit(&client(7), start);
        limiter.admit(&client(8), start + Duration::from_secs(30));
        assert_eq!(limiter.tracked_clients(), 2);

        assert_eq!(limiter.sweep(start + Duration::from_secs(75)), 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.occupancy(&client(8), start + Duration::from_secs(75)), 1);

        assert_eq!(limiter.sweep(start + Duration::from_secs(200)), 1);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_quota() {
        for _ in 0..50 {
            let limiter = Arc::new(limiter());
            let now = Instant::now();
            let c = client(9);

            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let limiter = limiter.clone();
                    let c = c.clone();
                    std::thread::spawn(move || limiter.admit(&c, now))
                })
                .collect();

            let admitted = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&ok| ok)
                .count();

            assert_eq!(admitted, 5);
        }
    }

    #[test]
    fn test_client_identity_prefers_forwarded_header() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());

        assert_eq!(
            ClientId::from_request(&headers, Some(peer), true),
            ClientId::Ip("203.0.113.7".parse().unwrap())
        );
        assert_eq!(
            ClientId::from_request(&headers, Some(peer), false),
            ClientId::Ip(peer.ip())
        );
    }

    #[test]
    fn test_client_identity_fallbacks() {
        let mut headers = HeaderMap::new();
        assert_eq!(ClientId::from_request(&headers, None, true), ClientId::Unidentified);

        headers.insert("x-forwarded-for", "_hidden".parse().unwrap());
        assert_eq!(
            ClientId::from_request(&headers, None, true),
            ClientId::Opaque("_hidden".to_string())
        );

        headers.insert("x-forwarded-for", " ".parse().unwrap());
        assert_eq!(ClientId::from_request(&headers, None, true), ClientId::Unidentified);
    }
}
