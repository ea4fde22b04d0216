//! JWT-SVID caching with half-lifetime staleness and single-flight refresh.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::bundle::jwt::{JwtBundle, JwtBundleSet};
use crate::bundle::BundleSource;
use crate::jwt_source::{JwtSource, JwtSourceBuilder};
use crate::prelude::*;
use crate::source::SourceUpdates;
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::jwt::JwtSvid;
use crate::workload_api::error::{ResourceKind, WorkloadApiError};

/// Time source for cache staleness decisions.
///
/// The default [`SystemClock`] reads the system time; tests inject a manual
/// clock through [`JwtSourceBuilder::clock`].
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> OffsetDateTime;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A [`JwtSource`] with a cache in front of its JWT-SVID fetches.
///
/// Tokens are cached per (subject, audience set) and served from memory
/// until they pass half of their lifetime, counted from the `iat` claim (or
/// the fetch time when the token carries none) to the `exp` claim. A stale
/// or missing entry is refreshed through the underlying source with
/// single-flight semantics: concurrent callers for the same key trigger one
/// Workload API call, the rest wait and reuse its result. Refreshes for
/// different keys also serialize on the same lock; cache hits never touch
/// it.
///
/// Bundle reads and lifecycle are the underlying [`JwtSource`]'s.
#[derive(Clone)]
pub struct CachedJwtSource {
    inner: Arc<CachedInner>,
}

struct CachedInner {
    source: JwtSource,
    cache: RwLock<HashMap<CacheKey, CacheEntry>>,
    // Single-flight for the miss/stale path. Coarse on purpose: one
    // refresh at a time for the whole source.
    refresh: Mutex<()>,
    clock: Arc<dyn Clock>,
    #[cfg(test)]
    fetch_override: Option<TestFetcher>,
}

#[cfg(test)]
type TestFetcher = Arc<
    dyn Fn(
            Option<SpiffeId>,
            Vec<String>,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<Output = Result<Vec<Arc<JwtSvid>>, WorkloadApiError>>
                    + Send,
            >,
        > + Send
        + Sync,
>;

impl fmt::Debug for CachedJwtSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedJwtSource")
            .field("source", &self.inner.source)
            .field("cached_keys", &self.inner.read_cache().len())
            .finish_non_exhaustive()
    }
}

/// Audiences are held as a sorted set: the key is order-independent and
/// case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    subject: Option<SpiffeId>,
    audiences: BTreeSet<String>,
}

struct CacheEntry {
    svids: Vec<Arc<JwtSvid>>,
    stale_after: OffsetDateTime,
    expires_at: OffsetDateTime,
}

impl CacheEntry {
    /// Computes the staleness bounds as minima over the batch, so one
    /// short-lived token forces a refresh of the whole entry. `fetched_at`
    /// stands in for a missing `iat` claim.
    fn new(svids: Vec<Arc<JwtSvid>>, fetched_at: OffsetDateTime) -> Self {
        let mut stale_after: Option<OffsetDateTime> = None;
        let mut expires_at: Option<OffsetDateTime> = None;

        for svid in &svids {
            let expiry = svid.expiry();
            let issued = svid.issued_at().unwrap_or(fetched_at);
            let half_life = issued + (expiry - issued) / 2;

            stale_after = Some(stale_after.map_or(half_life, |current| current.min(half_life)));
            expires_at = Some(expires_at.map_or(expiry, |current| current.min(expiry)));
        }

        Self {
            svids,
            stale_after: stale_after.unwrap_or(fetched_at),
            expires_at: expires_at.unwrap_or(fetched_at),
        }
    }

    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        now < self.stale_after && now < self.expires_at
    }
}

impl CachedInner {
    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached tokens for `key` when the entry exists and has
    /// not gone stale.
    fn lookup_fresh(&self, key: &CacheKey) -> Option<Vec<Arc<JwtSvid>>> {
        let now = self.clock.now();
        let cache = self.read_cache();
        let entry = cache.get(key)?;
        entry.is_fresh(now).then(|| entry.svids.clone())
    }

    /// Fetches tokens for `key` and stores them. Caller holds the refresh
    /// lock.
    async fn refresh_entry(&self, key: &CacheKey) -> Result<Vec<Arc<JwtSvid>>, WorkloadApiError> {
        let audiences: Vec<String> = key.audiences.iter().cloned().collect();
        let svids = self.fetch_fresh(key.subject.clone(), audiences).await?;
        if svids.is_empty() {
            return Err(WorkloadApiError::EmptyResponse(ResourceKind::JwtSvid));
        }

        debug!(
            "jwt cache: refreshed {} token(s) for {} audience(s)",
            svids.len(),
            key.audiences.len()
        );
        let entry = CacheEntry::new(svids.clone(), self.clock.now());
        self.write_cache().insert(key.clone(), entry);
        Ok(svids)
    }

    async fn fetch_fresh(
        &self,
        subject: Option<SpiffeId>,
        audiences: Vec<String>,
    ) -> Result<Vec<Arc<JwtSvid>>, WorkloadApiError> {
        #[cfg(test)]
        if let Some(fetch) = &self.fetch_override {
            return fetch(subject, audiences).await;
        }

        self.source
            .fetch_jwt_svids(&audiences, subject.as_ref())
            .await
    }
}

impl CachedJwtSource {
    /// Builds a cached source connected via `SPIFFE_ENDPOINT_SOCKET`, with
    /// default settings. See [`CachedJwtSource::builder`] to customize.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the first JWT bundle set cannot
    /// be obtained.
    pub async fn new() -> Result<Self, WorkloadApiError> {
        Self::builder().build_cached().await
    }

    /// Returns a builder; finish it with [`JwtSourceBuilder::build_cached`].
    #[must_use]
    pub fn builder() -> JwtSourceBuilder {
        JwtSourceBuilder::new()
    }

    pub(crate) fn wrap(source: JwtSource, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CachedInner {
                source,
                cache: RwLock::new(HashMap::new()),
                refresh: Mutex::new(()),
                clock,
                #[cfg(test)]
                fetch_override: None,
            }),
        }
    }

    /// Fetches the default JWT-SVID for the given audience, serving it from
    /// the cache while the cached token stays within half of its lifetime.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the source is closed or the
    /// refresh fetch fails.
    pub async fn fetch_jwt_svid<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<Arc<JwtSvid>, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let svids = self.fetch_jwt_svids(audience, spiffe_id).await?;
        svids
            .into_iter()
            .next()
            .ok_or(WorkloadApiError::EmptyResponse(ResourceKind::JwtSvid))
    }

    /// Fetches all JWT-SVIDs for the given audience, cached as one entry
    /// under the (subject, audience set) key.
    ///
    /// On a miss or a stale entry the refresh goes through the underlying
    /// [`JwtSource`] with at most one fetch in flight: concurrent callers
    /// wait and re-check the cache instead of fetching again.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the source is closed or the
    /// refresh fetch fails. An empty fetch result is
    /// [`WorkloadApiError::EmptyResponse`] and is never cached.
    pub async fn fetch_jwt_svids<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<Vec<Arc<JwtSvid>>, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.inner.source.assert_open()?;

        let key = CacheKey {
            subject: spiffe_id.cloned(),
            audiences: audience
                .into_iter()
                .map(|audience| audience.as_ref().to_owned())
                .collect(),
        };

        if let Some(svids) = self.inner.lookup_fresh(&key) {
            return Ok(svids);
        }

        // Miss or stale: serialize the refresh, then re-check — another
        // caller may have refreshed this key while we waited.
        let _guard = self.inner.refresh.lock().await;
        if let Some(svids) = self.inner.lookup_fresh(&key) {
            return Ok(svids);
        }

        self.inner.source.assert_open()?;
        self.inner.refresh_entry(&key).await
    }

    /// Returns the latest set of JWT trust bundles.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Closed`] once the source is closed.
    pub fn bundle_set(&self) -> Result<Arc<JwtBundleSet>, WorkloadApiError> {
        self.inner.source.bundle_set()
    }

    /// Returns the current bundle for `trust_domain`, or `Ok(None)` when the
    /// latest bundle set carries none for it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Closed`] once the source is closed.
    pub fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<JwtBundle>>, WorkloadApiError> {
        self.inner.source.bundle_for_trust_domain(trust_domain)
    }

    /// Subscribes to bundle update notifications.
    #[must_use]
    pub fn updates(&self) -> SourceUpdates {
        self.inner.source.updates()
    }

    /// Whether the source has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.source.is_closed()
    }

    /// Closes the underlying source and drops every cached token.
    pub async fn close(&self) {
        self.inner.source.close().await;
        self.inner.write_cache().clear();
    }

    #[cfg(test)]
    fn new_for_test(source: JwtSource, clock: Arc<dyn Clock>, fetch: TestFetcher) -> Self {
        Self {
            inner: Arc::new(CachedInner {
                source,
                cache: RwLock::new(HashMap::new()),
                refresh: Mutex::new(()),
                clock,
                fetch_override: Some(fetch),
            }),
        }
    }
}

impl BundleSource for CachedJwtSource {
    type Item = JwtBundle;
    type Error = WorkloadApiError;

    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<JwtBundle>>, WorkloadApiError> {
        CachedJwtSource::bundle_for_trust_domain(self, trust_domain)
    }
}
