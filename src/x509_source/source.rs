//! The live X.509 identity source backed by a supervised watch.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bundle::x509::{X509Bundle, X509BundleSet};
use crate::bundle::BundleSource;
use crate::prelude::*;
use crate::retry::BackoffPolicy;
use crate::source::{await_initial_update, ClientFactory, SourceUpdates, UpdateNotifier};
use crate::spiffe_id::TrustDomain;
use crate::svid::x509::X509Svid;
use crate::svid::SvidSource;
use crate::workload_api::error::{ResourceKind, WorkloadApiError};
use crate::workload_api::watch::{run_watch, Watcher};
use crate::workload_api::x509_context::X509Context;
use crate::x509_source::{SvidPicker, X509SourceBuilder};

/// A continually updated view of the workload's X.509 materials.
///
/// The source owns a background watch on the Workload API. Construction
/// blocks until the first X.509 context arrives, so a built source always
/// has an SVID and bundles to serve; after that, every read returns the most
/// recently received material without touching the network. The watch
/// reconnects on failure and keeps the last known context in the meantime.
///
/// Clones are cheap handles on the same state. The background watch stops
/// when [`X509Source::close`] is called on any handle or when the last
/// handle is dropped.
#[derive(Clone, Debug)]
pub struct X509Source {
    inner: Arc<Inner>,
}

/// The context of the latest accepted update, with the SVID its picker
/// chose. Swapped atomically so `svid()` and `bundle_set()` never disagree.
struct State {
    context: Arc<X509Context>,
    svid: Arc<X509Svid>,
}

struct Inner {
    state: ArcSwapOption<State>,
    picker: Option<Box<dyn SvidPicker>>,
    notifier: UpdateNotifier,
    closed: AtomicBool,
    cancel: CancellationToken,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load();
        f.debug_struct("Inner")
            .field("svid", &state.as_ref().map(|state| state.svid.spiffe_id()))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: stop the watch even without an explicit close.
        self.cancel.cancel();
    }
}

impl Inner {
    fn new(picker: Option<Box<dyn SvidPicker>>) -> Self {
        Self {
            state: ArcSwapOption::empty(),
            picker,
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

    /// Applies one received context. Returns `false` without touching the
    /// state when the picker selects none of its SVIDs.
    fn apply_update(&self, context: X509Context) -> bool {
        let Some(svid) = self.pick_svid(context.svids()) else {
            return false;
        };

        debug!(
            "x509 source: context with {} svid(s); serving {}",
            context.svids().len(),
            svid.spiffe_id()
        );
        self.state.store(Some(Arc::new(State {
            context: Arc::new(context),
            svid,
        })));
        self.notifier.notify();
        true
    }

    fn pick_svid(&self, svids: &[Arc<X509Svid>]) -> Option<Arc<X509Svid>> {
        match &self.picker {
            Some(picker) => svids.get(picker.pick_svid(svids)?).cloned(),
            None => svids.first().cloned(),
        }
    }
}

/// Feeds watch updates into the shared state.
///
/// Holds the state weakly: the watch task must not keep the source alive
/// after every user handle is gone.
struct ContextWatcher {
    inner: Weak<Inner>,
    init: Option<oneshot::Sender<Result<(), WorkloadApiError>>>,
}

impl Watcher<X509Context> for ContextWatcher {
    fn on_update(&mut self, update: X509Context) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        if inner.apply_update(update) {
            if let Some(init) = self.init.take() {
                let _ = init.send(Ok(()));
            }
        } else {
            warn!("ignoring x509 context update: the svid picker selected no svid");
        }
    }

    fn on_error(&mut self, error: WorkloadApiError) {
        match self.init.take() {
            Some(init) => {
                let _ = init.send(Err(error));
            }
            None => {
                error!("x509 context watch stopped; serving the last known context: {error}");
            }
        }
    }
}

impl X509Source {
    /// Builds a source connected via `SPIFFE_ENDPOINT_SOCKET`, with default
    /// settings. See [`X509Source::builder`] to customize.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the first X.509 context cannot be
    /// obtained.
    pub async fn new() -> Result<Self, WorkloadApiError> {
        Self::builder().build().await
    }

    /// Returns a builder for configuring endpoint, backoff, SVID selection
    /// and the init timeout.
    #[must_use]
    pub fn builder() -> X509SourceBuilder {
        X509SourceBuilder::new()
    }

    pub(crate) async fn build_with(
        make_client: ClientFactory,
        picker: Option<Box<dyn SvidPicker>>,
        backoff: BackoffPolicy,
        init_timeout: Option<Duration>,
    ) -> Result<Self, WorkloadApiError> {
        let inner = Arc::new(Inner::new(picker));

        let (init_tx, init_rx) = oneshot::channel();
        let watcher = ContextWatcher {
            inner: Arc::downgrade(&inner),
            init: Some(init_tx),
        };
        let open = move || {
            let make_client = Arc::clone(&make_client);
            async move {
                let client = make_client().await?;
                client.stream_x509_contexts().await
            }
        };

        let task = tokio::spawn(run_watch(
            ResourceKind::X509Context,
            backoff,
            inner.cancel.clone(),
            open,
            watcher,
        ));
        *inner.watch_task.lock().await = Some(task);

        let source = Self { inner };
        if let Err(error) =
            await_initial_update(init_rx, init_timeout, ResourceKind::X509Context).await
        {
            source.close().await;
            return Err(error);
        }
        Ok(source)
    }

    /// Returns the SVID currently served by this source: the picker's choice
    /// from the latest context, or its default SVID without a picker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Closed`] once the source is closed.
    pub fn svid(&self) -> Result<Arc<X509Svid>, WorkloadApiError> {
        self.inner.assert_open()?;
        self.inner
            .state
            .load()
            .as_ref()
            .map(|state| Arc::clone(&state.svid))
            .ok_or(WorkloadApiError::Closed)
    }

    /// Returns the latest X.509 context: all SVIDs plus the bundle set they
    /// arrived with.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Closed`] once the source is closed.
    pub fn x509_context(&self) -> Result<Arc<X509Context>, WorkloadApiError> {
        self.inner.assert_open()?;
        self.inner
            .state
            .load()
            .as_ref()
            .map(|state| Arc::clone(&state.context))
            .ok_or(WorkloadApiError::Closed)
    }

    /// Returns the latest set of X.509 trust bundles.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Closed`] once the source is closed.
    pub fn bundle_set(&self) -> Result<Arc<X509BundleSet>, WorkloadApiError> {
        Ok(Arc::clone(self.x509_context()?.bundle_set()))
    }

    /// Returns the current bundle for `trust_domain`, or `Ok(None)` when the
    /// latest context carries none for it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Closed`] once the source is closed.
    pub fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<X509Bundle>>, WorkloadApiError> {
        Ok(self.bundle_set()?.get(trust_domain))
    }

    /// Subscribes to update notifications: each accepted context bumps a
    /// sequence number the subscriber can await.
    #[must_use]
    pub fn updates(&self) -> SourceUpdates {
        self.inner.notifier.subscribe()
    }

    /// Whether [`X509Source::close`] has been called on any handle.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes the source: stops the background watch and waits for it to
    /// finish. Subsequent reads fail with [`WorkloadApiError::Closed`].
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
                warn!("x509 source: watch task panicked during close");
            }
        }
    }

    #[cfg(test)]
    fn new_for_test(context: X509Context, picker: Option<Box<dyn SvidPicker>>) -> Self {
        let source = Self {
            inner: Arc::new(Inner::new(picker)),
        };
        assert!(source.inner.apply_update(context));
        source
    }
}

impl SvidSource for X509Source {
    type Item = X509Svid;
    type Error = WorkloadApiError;

    fn svid(&self) -> Result<Arc<X509Svid>, WorkloadApiError> {
        X509Source::svid(self)
    }
}

impl BundleSource for X509Source {
    type Item = X509Bundle;
    type Error = WorkloadApiError;

    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<X509Bundle>>, WorkloadApiError> {
        X509Source::bundle_for_trust_domain(self, trust_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_certs::{ca_der, CertChain};
    use std::sync::atomic::AtomicUsize;

    struct HintPicker(&'static str);

    impl SvidPicker for HintPicker {
        fn pick_svid(&self, svids: &[Arc<X509Svid>]) -> Option<usize> {
            svids.iter().position(|svid| svid.hint() == Some(self.0))
        }
    }

    struct FixedIndexPicker(usize);

    impl SvidPicker for FixedIndexPicker {
        fn pick_svid(&self, _svids: &[Arc<X509Svid>]) -> Option<usize> {
            Some(self.0)
        }
    }

    fn svid(id: &str, hint: Option<&str>) -> Arc<X509Svid> {
        let chain = CertChain::single(id);
        let svid = X509Svid::parse_from_der_with_hint(
            &chain.chain_der(),
            &chain.key_der(),
            hint.map(Arc::from),
        )
        .unwrap();
        Arc::new(svid)
    }

    fn context(svids: Vec<Arc<X509Svid>>) -> X509Context {
        let trust_domain = TrustDomain::new("example.org").unwrap();
        let mut bundles = X509BundleSet::new();
        bundles.add_bundle(X509Bundle::parse_from_der(trust_domain, &ca_der()).unwrap());
        X509Context::new(svids, bundles)
    }

    #[test]
    fn serves_the_default_svid_without_a_picker() {
        let first = svid("spiffe://example.org/first", None);
        let second = svid("spiffe://example.org/second", None);
        let source = X509Source::new_for_test(context(vec![first.clone(), second]), None);

        assert_eq!(source.svid().unwrap().spiffe_id(), first.spiffe_id());
        assert_eq!(source.x509_context().unwrap().svids().len(), 2);
    }

    #[test]
    fn the_picker_chooses_which_svid_is_served() {
        let plain = svid("spiffe://example.org/api", None);
        let hinted = svid("spiffe://example.org/backend", Some("backend"));
        let source = X509Source::new_for_test(
            context(vec![plain, hinted.clone()]),
            Some(Box::new(HintPicker("backend"))),
        );

        assert_eq!(source.svid().unwrap().spiffe_id(), hinted.spiffe_id());
    }

    #[test]
    fn a_rejected_update_keeps_the_previous_context() {
        let hinted = svid("spiffe://example.org/backend", Some("backend"));
        let source = X509Source::new_for_test(
            context(vec![hinted.clone()]),
            Some(Box::new(HintPicker("backend"))),
        );
        let updates = source.updates();
        let seen = updates.last();

        // No SVID carries the hint: the picker matches nothing.
        let unhinted = context(vec![svid("spiffe://example.org/other", None)]);
        assert!(!source.inner.apply_update(unhinted));

        assert_eq!(source.svid().unwrap().spiffe_id(), hinted.spiffe_id());
        assert_eq!(updates.last(), seen);
    }

    #[test]
    fn an_out_of_range_pick_is_rejected() {
        let inner = Inner::new(Some(Box::new(FixedIndexPicker(5))));
        let rejected = context(vec![svid("spiffe://example.org/only", None)]);

        assert!(!inner.apply_update(rejected));
        assert!(inner.state.load().is_none());
    }

    #[test]
    fn bundles_are_queryable_per_trust_domain() {
        let source =
            X509Source::new_for_test(context(vec![svid("spiffe://example.org/api", None)]), None);

        let own = TrustDomain::new("example.org").unwrap();
        let other = TrustDomain::new("other.org").unwrap();
        assert!(source.bundle_for_trust_domain(&own).unwrap().is_some());
        assert!(source.bundle_for_trust_domain(&other).unwrap().is_none());
    }

    #[tokio::test]
    async fn accepted_updates_wake_subscribers() {
        let source =
            X509Source::new_for_test(context(vec![svid("spiffe://example.org/api", None)]), None);
        let mut updates = source.updates();
        let seen = updates.last();

        let renewed = context(vec![svid("spiffe://example.org/api", None)]);
        assert!(source.inner.apply_update(renewed));

        assert_eq!(updates.changed().await.unwrap(), seen + 1);
    }

    #[tokio::test]
    async fn concurrent_close_runs_the_shutdown_once() {
        let source =
            X509Source::new_for_test(context(vec![svid("spiffe://example.org/api", None)]), None);

        let cancellations = Arc::new(AtomicUsize::new(0));
        let cancel = source.inner.cancel.clone();
        let counter = Arc::clone(&cancellations);
        let task = tokio::spawn(async move {
            cancel.cancelled().await;
            counter.fetch_add(1, Ordering::SeqCst);
        });
        *source.inner.watch_task.lock().await = Some(task);

        let first = source.clone();
        let second = source.clone();
        tokio::join!(first.close(), second.close());

        assert_eq!(cancellations.load(Ordering::SeqCst), 1);
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn reads_after_close_fail_with_closed() {
        let source =
            X509Source::new_for_test(context(vec![svid("spiffe://example.org/api", None)]), None);
        source.close().await;

        assert!(matches!(source.svid(), Err(WorkloadApiError::Closed)));
        assert!(matches!(
            source.x509_context(),
            Err(WorkloadApiError::Closed)
        ));
        assert!(matches!(source.bundle_set(), Err(WorkloadApiError::Closed)));
        let td = TrustDomain::new("example.org").unwrap();
        assert!(matches!(
            source.bundle_for_trust_domain(&td),
            Err(WorkloadApiError::Closed)
        ));
    }

    #[test]
    fn dropping_the_last_handle_cancels_the_watch() {
        let source =
            X509Source::new_for_test(context(vec![svid("spiffe://example.org/api", None)]), None);
        let cancel = source.inner.cancel.clone();

        drop(source);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn build_surfaces_a_fatal_connect_error() {
        let make_client: ClientFactory = Arc::new(|| {
            Box::pin(async {
                Err(WorkloadApiError::from(tonic::Status::invalid_argument(
                    "malformed request",
                )))
            })
        });

        let err = X509Source::build_with(make_client, None, BackoffPolicy::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkloadApiError::Rpc(_)));
    }

    #[tokio::test]
    async fn build_times_out_waiting_for_the_first_context() {
        let make_client: ClientFactory = Arc::new(|| {
            Box::pin(std::future::pending::<
                Result<crate::workload_api::client::WorkloadApiClient, WorkloadApiError>,
            >())
        });

        let err = X509Source::build_with(
            make_client,
            None,
            BackoffPolicy::new(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            WorkloadApiError::InitTimeout(ResourceKind::X509Context)
        ));
    }
}
