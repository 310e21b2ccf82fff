//! Price/policy snapshots taken at confirmation time.
//!
//! The engine never computes prices. Upstream pricing sits behind
//! [`PriceSource`]; [`PricingSnapshotter`] copies its answer and the tutor's
//! current policy into an immutable [`BookingTerms`] that is stored on the
//! booking and never recomputed.

use std::sync::Arc;

use ulid::Ulid;

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::engine::EngineError;
use crate::model::{BookingTerms, Money, Ms, Span, TutorProfile};

/// Upstream price for one session of a tutor.
pub trait PriceSource: Send + Sync {
    fn quote(&self, tutor: &TutorProfile, span: &Span) -> Result<Money, EngineError>;
}

/// The tutor's own configured base price.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProfilePricing;

impl PriceSource for ProfilePricing {
    fn quote(&self, tutor: &TutorProfile, _span: &Span) -> Result<Money, EngineError> {
        Ok(tutor.base_price.clone())
    }
}

/// Memoizes quotes per tutor for a bounded time.
pub struct CachedPriceSource {
    inner: Arc<dyn PriceSource>,
    cache: TtlCache<Ulid, Money>,
}

impl CachedPriceSource {
    pub fn new(inner: Arc<dyn PriceSource>, ttl_ms: Ms, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl_ms, clock),
        }
    }

    pub fn invalidate(&self, tutor_id: Ulid) {
        self.cache.invalidate(&tutor_id);
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }
}

impl PriceSource for CachedPriceSource {
    fn quote(&self, tutor: &TutorProfile, span: &Span) -> Result<Money, EngineError> {
        self.cache
            .get_or_try_insert_with(tutor.id, || self.inner.quote(tutor, span))
    }
}

pub struct PricingSnapshotter {
    source: Arc<dyn PriceSource>,
    /// Set when `source` is cached, so tutor updates can drop stale quotes.
    cached: Option<Arc<CachedPriceSource>>,
}

impl PricingSnapshotter {
    pub fn new(source: Arc<dyn PriceSource>) -> Self {
        Self {
            source,
            cached: None,
        }
    }

    /// Wrap `source` in a TTL cache.
    pub fn cached(source: Arc<dyn PriceSource>, ttl_ms: Ms, clock: Arc<dyn Clock>) -> Self {
        let cached = Arc::new(CachedPriceSource::new(source, ttl_ms, clock));
        Self {
            source: cached.clone(),
            cached: Some(cached),
        }
    }

    pub fn snapshot(
        &self,
        tutor: &TutorProfile,
        span: &Span,
        now: Ms,
    ) -> Result<BookingTerms, EngineError> {
        let price = self.source.quote(tutor, span)?;
        if price.amount_minor < 0 {
            return Err(EngineError::validation("upstream price is negative"));
        }
        Ok(BookingTerms {
            price,
            policy: tutor.policy.clone(),
            captured_at: now,
        })
    }

    /// Called whenever a tutor's configuration changes.
    pub fn invalidate(&self, tutor_id: Ulid) {
        if let Some(cached) = &self.cached {
            cached.invalidate(tutor_id);
        }
    }

    /// Reclaim expired quotes. Zero when quotes are not cached.
    pub fn purge_expired(&self) -> usize {
        self.cached.as_ref().map_or(0, |cached| cached.purge_expired())
    }
}
