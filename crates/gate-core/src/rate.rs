use crate::client_ip::{resolve_client_ip, InboundRequest, UNKNOWN_IP};
use crate::store::CounterStore;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const KEY_PREFIX: &str = "rate:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOptions {
    /// Requests allowed per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window: u64,
    pub trust_proxy: bool,
    /// Upper bound on each store round trip.
    pub timeout_ms: u64,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            window: 60,
            trust_proxy: false,
            timeout_ms: 2000,
        }
    }
}

impl RateLimitOptions {
    pub fn new(limit: u32, window: u64) -> Self {
        Self {
            limit,
            window,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.limit == 0 {
            bail!("rate limit must be greater than zero");
        }
        if self.window == 0 {
            bail!("rate window must be at least one second");
        }
        if i64::try_from(self.window).is_err() {
            bail!("rate window of {}s is too large", self.window);
        }
        if self.timeout_ms == 0 {
            bail!("rate timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the current window closes.
    pub reset_in: u64,
    pub ip: String,
    pub message: String,
    pub error: bool,
}

impl RateLimitOutcome {
    fn unresolved() -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_in: 0,
            ip: UNKNOWN_IP.to_string(),
            message: "IP is undefined, cannot apply rate limiting".into(),
            error: true,
        }
    }

    fn store_unavailable(ip: String) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_in: 0,
            ip,
            message: "Redis not connected, rate limiting unavailable".into(),
            error: true,
        }
    }
}

/// Fixed-window counter per client IP.
///
/// The window starts at the first request after the previous one expired;
/// later requests in the same window never push the expiry back.
/// Increment, expire and ttl are separate store calls, so two instances
/// sharing a store may both observe the first hit of a window. That is
/// accepted for fixed-window counting. A counter found without an expiry
/// (its first EXPIRE was lost) gets one on the spot, so a key can never
/// outlive its window for good.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    options: RateLimitOptions,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, options: RateLimitOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    /// Counts the request against its client IP. Always fails closed: an
    /// unresolvable IP or an unreachable store denies with `error` set.
    pub async fn check(&self, req: &InboundRequest) -> RateLimitOutcome {
        let Some(ip) = resolve_client_ip(req, self.options.trust_proxy) else {
            warn!("no client ip on request, denying");
            return RateLimitOutcome::unresolved();
        };

        let (count, ttl) = match self.count(&ip).await {
            Ok(v) => v,
            Err(err) => {
                let err = format!("{err:#}");
                warn!(%ip, %err, "counter store unavailable");
                return RateLimitOutcome::store_unavailable(ip);
            }
        };

        let reset_in = u64::try_from(ttl).unwrap_or_else(|_| {
            warn!(%ip, ttl, "counter has no expiry");
            0
        });

        if count > u64::from(self.options.limit) {
            info!(%ip, count, limit = self.options.limit, "rate limit exceeded");
            return RateLimitOutcome {
                allowed: false,
                remaining: 0,
                reset_in,
                ip,
                message: format!("Rate limit exceeded. Try again in {reset_in} seconds."),
                error: false,
            };
        }

        debug!(%ip, count, reset_in, "request allowed");
        RateLimitOutcome {
            allowed: true,
            remaining: self.options.limit - count as u32,
            reset_in,
            ip,
            message: "Request allowed.".into(),
            error: false,
        }
    }

    async fn count(&self, ip: &str) -> anyhow::Result<(u64, i64)> {
        let key = format!("{KEY_PREFIX}{ip}");
        let window = self.options.window;
        self.step("PING", self.store.ping()).await?;
        let count = self.step("INCR", self.store.incr(&key)).await?;
        if count == 1 {
            self.step("EXPIRE", self.store.expire(&key, window)).await?;
        }
        let mut ttl = self.step("TTL", self.store.ttl(&key)).await?;
        if ttl == -1 {
            warn!(%key, count, "counter has no expiry, re-arming window");
            self.step("EXPIRE", self.store.expire(&key, window)).await?;
            ttl = i64::try_from(window).unwrap_or(i64::MAX);
        }
        Ok((count, ttl))
    }

    async fn step<T>(
        &self,
        name: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let timeout = Duration::from_millis(self.options.timeout_ms);
        match tokio::time::timeout(timeout, call).await {
            Ok(res) => res.with_context(|| format!("store {name}")),
            Err(_) => bail!("store {name} did not answer within {timeout:?}"),
        }
    }
}
