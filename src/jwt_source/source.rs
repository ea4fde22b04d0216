//! The live JWT bundle source with on-demand JWT-SVID fetching.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bundle::jwt::{JwtBundle, JwtBundleSet};
use crate::bundle::BundleSource;
use crate::jwt_source::JwtSourceBuilder;
use crate::prelude::*;
use crate::retry::BackoffPolicy;
use crate::source::{await_initial_update, ClientFactory, SourceUpdates, UpdateNotifier};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::jwt::JwtSvid;
use crate::workload_api::client::WorkloadApiClient;
use crate::workload_api::error::{ResourceKind, WorkloadApiError};
use crate::workload_api::watch::{run_watch, Watcher};

/// A continually updated view of the workload's JWT trust bundles, plus
/// on-demand JWT-SVID fetching.
///
/// The source owns a background watch that keeps the JWT bundle set current;
/// construction blocks until the first bundle set arrives. JWT-SVIDs are not
/// streamed: [`JwtSource::fetch_jwt_svid`] performs a one-shot Workload API
/// call through a lazily created client that is kept for reuse and replaced
/// once per fetch when a call fails with a retryable error.
///
/// Clones are cheap handles on the same state. The background watch stops
/// when [`JwtSource::close`] is called on any handle or when the last handle
/// is dropped.
#[derive(Clone, Debug)]
pub struct JwtSource {
    inner: Arc<Inner>,
}

struct Inner {
    bundles: ArcSwapOption<JwtBundleSet>,
    make_client: ClientFactory,
    // One-shot fetches reuse this client; creation and replacement are
    // serialized by client_lock.
    cached_client: ArcSwapOption<WorkloadApiClient>,
    client_lock: Mutex<()>,
    notifier: UpdateNotifier,
    closed: AtomicBool,
    cancel: CancellationToken,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field(
                "trust_domains",
                &self.bundles.load().as_ref().map(|set| set.len()),
            )
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn new(make_client: ClientFactory) -> Self {
        Self {
            bundles: ArcSwapOption::empty(),
            make_client,
            cached_client: ArcSwapOption::empty(),
            client_lock: Mutex::new(()),
            notifier: UpdateNotifier::new(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            watch_task: Mutex::new(None),
        }
    }

    fn assert_open(&self) -> Result<(), WorkloadApiError> {
        if self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return Err(WorkloadApiError::Closed);
        }
        Ok(())
    }

    fn apply_update(&self, bundles: JwtBundleSet) {
        debug!(
            "jwt source: bundle set updated ({} trust domain(s))",
            bundles.len()
        );
        self.bundles.store(Some(Arc::new(bundles)));
        self.notifier.notify();
    }

    /// Returns the client used for one-shot fetches, creating it on first
    /// use. Concurrent first uses share one creation.
    async fn client(&self) -> Result<Arc<WorkloadApiClient>, WorkloadApiError> {
        if let Some(client) = self.cached_client.load_full() {
            return Ok(client);
        }

        let _guard = self.client_lock.lock().await;
        if let Some(client) = self.cached_client.load_full() {
            return Ok(client);
        }

        let client = Arc::new((self.make_client)().await?);
        self.cached_client.store(Some(Arc::clone(&client)));
        Ok(client)
    }

    /// Replaces `failed` with a freshly connected client. When another
    /// caller already replaced it, the current client is returned instead
    /// of connecting again.
    async fn recreate_client(
        &self,
        failed: &Arc<WorkloadApiClient>,
    ) -> Result<Arc<WorkloadApiClient>, WorkloadApiError> {
        let _guard = self.client_lock.lock().await;
        if let Some(current) = self.cached_client.load_full() {
            if !Arc::ptr_eq(&current, failed) {
                return Ok(current);
            }
        }

        debug!("jwt source: reconnecting the fetch client");
        let client = Arc::new((self.make_client)().await?);
        self.cached_client.store(Some(Arc::clone(&client)));
        Ok(client)
    }
}

/// Feeds bundle watch updates into the shared state.
struct BundleWatcher {
    inner: Weak<Inner>,
    init: Option<oneshot::Sender<Result<(), WorkloadApiError>>>,
}

impl Watcher<JwtBundleSet> for BundleWatcher {
    fn on_update(&mut self, update: JwtBundleSet) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        inner.apply_update(update);
        if let Some(init) = self.init.take() {
            let _ = init.send(Ok(()));
        }
    }

    fn on_error(&mut self, error: WorkloadApiError) {
        match self.init.take() {
            Some(init) => {
                let _ = init.send(Err(error));
            }
            None => {
                error!("jwt bundles watch stopped; serving the last known bundles: {error}");
            }
        }
    }
}

impl JwtSource {
    /// Builds a source connected via `SPIFFE_ENDPOINT_SOCKET`, with default
    /// settings. See [`JwtSource::builder`] to customize.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the first JWT bundle set cannot
    /// be obtained.
    pub async fn new() -> Result<Self, WorkloadApiError> {
        Self::builder().build().await
    }

    /// Returns a builder for configuring endpoint, backoff, and the init
    /// timeout.
    #[must_use]
    pub fn builder() -> JwtSourceBuilder {
        JwtSourceBuilder::new()
    }

    pub(crate) async fn build_with(
        make_client: ClientFactory,
        backoff: BackoffPolicy,
        init_timeout: Option<Duration>,
    ) -> Result<Self, WorkloadApiError> {
        let factory = Arc::clone(&make_client);
        let inner = Arc::new(Inner::new(make_client));

        let (init_tx, init_rx) = oneshot::channel();
        let watcher = BundleWatcher {
            inner: Arc::downgrade(&inner),
            init: Some(init_tx),
        };
        let open = move || {
            let factory = Arc::clone(&factory);
            async move {
                let client = factory().await?;
                client.stream_jwt_bundles().await
            }
        };

        let task = tokio::spawn(run_watch(
            ResourceKind::JwtBundles,
            backoff,
            inner.cancel.clone(),
            open,
            watcher,
        ));
        *inner.watch_task.lock().await = Some(task);

        let source = Self { inner };
        if let Err(error) =
            await_initial_update(init_rx, init_timeout, ResourceKind::JwtBundles).await
        {
            source.close().await;
            return Err(error);
        }
        Ok(source)
    }

    /// Fetches a JWT-SVID for the given audience, targeting `spiffe_id` or,
    /// when `None`, the default identity.
    ///
    /// The call goes through the source's cached client; on a retryable
    /// failure the client is replaced and the fetch retried once.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the source is closed, the
    /// Workload API cannot be reached, or the response is invalid.
    pub async fn fetch_jwt_svid<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<Arc<JwtSvid>, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let audiences = collect_audiences(audience);
        let svid = self
            .fetch_with_retry(|client| {
                let audiences = audiences.clone();
                let spiffe_id = spiffe_id.cloned();
                async move { client.fetch_jwt_svid(&audiences, spiffe_id.as_ref()).await }
            })
            .await?;
        Ok(Arc::new(svid))
    }

    /// Fetches all JWT-SVIDs for the given audience, deduplicated by hint,
    /// with the same retry-once client handling as
    /// [`JwtSource::fetch_jwt_svid`].
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the source is closed, the
    /// Workload API cannot be reached, or the response is invalid.
    pub async fn fetch_jwt_svids<I>(
        &self,
        audience: I,
        spiffe_id: Option<&SpiffeId>,
    ) -> Result<Vec<Arc<JwtSvid>>, WorkloadApiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let audiences = collect_audiences(audience);
        let svids = self
            .fetch_with_retry(|client| {
                let audiences = audiences.clone();
                let spiffe_id = spiffe_id.cloned();
                async move {
                    client
                        .fetch_all_jwt_svids(&audiences, spiffe_id.as_ref())
                        .await
                }
            })
            .await?;
        Ok(svids.into_iter().map(Arc::new).collect())
    }

    /// Runs one fetch through the cached client; on a retryable error the
    /// client is replaced and the fetch runs once more.
    async fn fetch_with_retry<T, F, Fut>(&self, fetch: F) -> Result<T, WorkloadApiError>
    where
        F: Fn(Arc<WorkloadApiClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T, WorkloadApiError>>,
    {
        self.inner.assert_open()?;
        let client = self.inner.client().await?;

        match fetch(Arc::clone(&client)).await {
            Ok(value) => Ok(value),
            Err(error) if error.is_retryable() => {
                debug!("jwt source: fetch failed, retrying once with a fresh client: {error}");
                self.inner.assert_open()?;
                let client = self.inner.recreate_client(&client).await?;
                fetch(client).await
            }
            Err(error) => Err(error),
        }
    }

    /// Returns the latest set of JWT trust bundles.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Closed`] once the source is closed.
    pub fn bundle_set(&self) -> Result<Arc<JwtBundleSet>, WorkloadApiError> {
        self.inner.assert_open()?;
        self.inner
            .bundles
            .load_full()
            .ok_or(WorkloadApiError::Closed)
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
        Ok(self.bundle_set()?.get(trust_domain))
    }

    /// Subscribes to update notifications: each received bundle set bumps a
    /// sequence number the subscriber can await.
    #[must_use]
    pub fn updates(&self) -> SourceUpdates {
        self.inner.notifier.subscribe()
    }

    /// Whether [`JwtSource::close`] has been called on any handle.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn assert_open(&self) -> Result<(), WorkloadApiError> {
        self.inner.assert_open()
    }

    /// Closes the source: stops the background watch, waits for it to
    /// finish, and closes the cached fetch client. Subsequent reads and
    /// fetches fail with [`WorkloadApiError::Closed`].
    ///
    /// Only the first call does the work; concurrent and repeated calls
    /// return without side effects.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let task = self.inner.watch_task.lock().await.take();
        if let Some(task) = task {
            if task.await.is_err() {
                warn!("jwt source: watch task panicked during close");
            }
        }

        if let Some(client) = self.inner.cached_client.swap(None) {
            client.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(bundles: JwtBundleSet, make_client: ClientFactory) -> Self {
        let source = Self {
            inner: Arc::new(Inner::new(make_client)),
        };
        source.inner.apply_update(bundles);
        source
    }
}

fn collect_audiences<I>(audience: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    audience
        .into_iter()
        .map(|audience| audience.as_ref().to_owned())
        .collect()
}

impl BundleSource for JwtSource {
    type Item = JwtBundle;
    type Error = WorkloadApiError;

    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<JwtBundle>>, WorkloadApiError> {
        JwtSource::bundle_for_trust_domain(self, trust_domain)
    }
}
