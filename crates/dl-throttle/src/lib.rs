//! Per-key request throttling with bounded memory.
//!
//! Request rates are tracked per key in an LRU cache so a flood of
//! never-seen-before keys cannot grow memory without bound. Each cached
//! value is a token bucket; inserting new buckets is itself limited by a
//! global admission bucket, which bounds how fast the cache can be
//! invalidated.

mod bucket;

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Instant;

use lru::LruCache;
use thiserror::Error;
use tracing::info;

use bucket::TokenBucket;

#[derive(Error, Debug)]
pub enum ThrottleError {
    #[error("invalid throttle cache capacity {0}")]
    InvalidCapacity(i64),
    #[error("request rate too high for {key} (max: {max} req/sec)")]
    RatePerKeyExceeded { key: String, max: i64 },
    #[error("cache admission too fast (max: {max} new keys/sec)")]
    AdmissionExceeded { max: i64 },
}

struct Inner {
    cache: LruCache<String, TokenBucket>,
    admission: Option<TokenBucket>,
    max_rate_per_item: i64,
    cache_rate: i64,
}

/// Two-tier throttle. `None` inner means throttling is disabled and every
/// request passes without keeping any state.
pub struct Throttle {
    inner: Option<Mutex<Inner>>,
}

impl Throttle {
    /// `capacity` bounds the number of tracked keys; `cache_rate` limits
    /// how many new keys may enter per second (non-positive = unlimited);
    /// `max_rate_per_item` is the per-key request rate (non-positive
    /// disables throttling entirely).
    pub fn new(
        capacity: i64,
        cache_rate: i64,
        max_rate_per_item: i64,
    ) -> Result<Self, ThrottleError> {
        if max_rate_per_item <= 0 {
            info!("no throttling will be done");
            return Ok(Self { inner: None });
        }

        let capacity = usize::try_from(capacity)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or(ThrottleError::InvalidCapacity(capacity))?;

        let admission = if cache_rate <= 0 {
            info!("no cache admission limiting will be done");
            None
        } else {
            Some(TokenBucket::new(
                cache_rate as f64,
                cache_rate as f64,
                Instant::now(),
            ))
        };

        Ok(Self {
            inner: Some(Mutex::new(Inner {
                cache: LruCache::new(capacity),
                admission,
                max_rate_per_item,
                cache_rate,
            })),
        })
    }

    /// Whether a request under `key` is within the configured rates.
    pub fn ok(&self, key: &str) -> Result<(), ThrottleError> {
        self.ok_at(key, Instant::now())
    }

    fn ok_at(&self, key: &str, now: Instant) -> Result<(), ThrottleError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(bucket) = inner.cache.get_mut(key) {
            if bucket.allow(now) {
                return Ok(());
            }
            return Err(ThrottleError::RatePerKeyExceeded {
                key: key.to_string(),
                max: inner.max_rate_per_item,
            });
        }

        // New key: pass the admission limiter before allocating a bucket.
        let admitted = match &mut inner.admission {
            Some(admission) => admission.allow(now),
            None => true,
        };
        if !admitted {
            return Err(ThrottleError::AdmissionExceeded {
                max: inner.cache_rate,
            });
        }

        let rate = inner.max_rate_per_item as f64;
        let mut bucket = TokenBucket::new(rate, rate, now);
        // fresh buckets start full, so the admitting request always fits
        bucket.allow(now);
        inner.cache.put(key.to_string(), bucket);
        Ok(())
    }

    /// Change the per-key rate at runtime. Existing buckets keep their old
    /// rate until they are naturally displaced from the cache.
    pub fn set_rate(&self, max_rate_per_item: i64) {
        if let Some(inner) = &self.inner {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.max_rate_per_item = max_rate_per_item;
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.lock().unwrap_or_else(|e| e.into_inner()).cache.len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.is_none()
    }
}
