//! Per node type rate limiting, shared by every run of a runtime.

use crate::registry::NodeRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration, Instant};
use wfcore::RateLimit;

/// Limiters for every registered type that declares a [`RateLimit`].
///
/// Built once from the frozen registry, so lookups take no lock.
#[derive(Default)]
pub struct RateLimiters {
    limiters: HashMap<String, Arc<RateLimiter>>,
}

impl RateLimiters {
    pub fn from_registry(registry: &NodeRegistry) -> Self {
        let mut limiters = HashMap::new();
        for type_name in registry.list_node_types() {
            let Ok(description) = registry.describe(&type_name) else {
                continue;
            };
            if let Some(limit) = description.rate_limit {
                tracing::debug!("Rate limiting {}: {:?}", type_name, limit);
                limiters.insert(type_name, Arc::new(RateLimiter::new(limit)));
            }
        }
        Self { limiters }
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(type_name).cloned()
    }
}

/// Concurrency cap plus a token bucket refilled `per_second` times a second.
pub struct RateLimiter {
    concurrency: Option<Arc<Semaphore>>,
    bucket: Option<Mutex<TokenBucket>>,
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: u32) -> Self {
        let capacity = f64::from(per_second);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Take a token, or report how long until one is available.
    fn try_take(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec))
        }
    }
}

/// Held while a node executes; releases the concurrency slot on drop.
pub struct RatePermit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            concurrency: limit
                .max_concurrent
                .map(|max| Arc::new(Semaphore::new(max.max(1)))),
            bucket: limit
                .per_second
                .filter(|per_second| *per_second > 0)
                .map(|per_second| Mutex::new(TokenBucket::new(per_second))),
        }
    }

    /// Wait for a concurrency slot and a rate token.
    ///
    /// Dropping the future gives up the wait without consuming anything, so
    /// callers race it against their cancellation token.
    pub async fn acquire(&self) -> RatePermit {
        let slot = match &self.concurrency {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        if let Some(bucket) = &self.bucket {
            loop {
                let wait = bucket.lock().await.try_take();
                match wait {
                    None => break,
                    Some(delay) => sleep(delay).await,
                }
            }
        }

        RatePermit { _slot: slot }
    }

    /// Free concurrency slots, when a cap is configured.
    pub fn available_slots(&self) -> Option<usize> {
        self.concurrency
            .as_ref()
            .map(|semaphore| semaphore.available_permits())
    }
}
