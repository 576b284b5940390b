//! Per-address rate limiting for the upgrade endpoints.
//!
//! Token bucket per remote IP. A denied request is answered with HTTP 429
//! before the WebSocket upgrade happens. Stale buckets are swept on a timer
//! so long-lived relays do not accumulate one entry per client ever seen.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

const DEFAULT_RATE: u32 = 10;
const DEFAULT_BURST: u32 = 30;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_ENTRY_EXPIRY: Duration = Duration::from_secs(600);

/// Token bucket state for a single client address.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    max_tokens: f64,
}

impl TokenBucket {
    fn new(rate: u32, burst: u32) -> Self {
        TokenBucket {
            tokens: burst as f64,
            last_refill: Instant::now(),
            rate: rate as f64,
            max_tokens: burst as f64,
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Upgrade attempts per second per address.
    pub rate: u32,
    /// Burst size (max tokens in a bucket).
    pub burst: u32,
    pub enabled: bool,
    pub cleanup_interval: Duration,
    pub entry_expiry: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            rate: DEFAULT_RATE,
            burst: DEFAULT_BURST,
            enabled: true,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            entry_expiry: DEFAULT_ENTRY_EXPIRY,
        }
    }
}

#[derive(Debug)]
struct ClientEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<IpAddr, ClientEntry>>,
    config: RateLimitConfig,
    last_cleanup: RwLock<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            buckets: RwLock::new(HashMap::new()),
            config,
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Admit or deny one upgrade attempt from the given address.
    pub fn allow(&self, client_ip: IpAddr) -> bool {
        if !self.config.enabled {
            return true;
        }

        self.maybe_cleanup();

        let mut buckets = self.buckets.write();
        let entry = buckets.entry(client_ip).or_insert_with(|| ClientEntry {
            bucket: TokenBucket::new(self.config.rate, self.config.burst),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.bucket.try_consume()
    }

    fn maybe_cleanup(&self) {
        {
            let mut last_cleanup = self.last_cleanup.write();
            if last_cleanup.elapsed() < self.config.cleanup_interval {
                return;
            }
            *last_cleanup = Instant::now();
        }

        let mut buckets = self.buckets.write();
        let expiry = self.config.entry_expiry;
        buckets.retain(|_, entry| entry.last_seen.elapsed() < expiry);
        debug!(remaining = buckets.len(), "rate limiter cleanup");
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }
}
