//! Supervised watches: long-lived Workload API streams that reconnect with
//! jittered exponential backoff.
//!
//! A watch owns a background task that opens a stream, forwards every parsed
//! update to its [`Watcher`], and reopens the stream whenever it fails or
//! ends. Retryable failures are paced by a [`BackoffPolicy`]; the backoff
//! resets after a delivered update, not after a mere reconnect. A fatal
//! failure or an exhausted retry budget stops the watch after exactly one
//! [`Watcher::on_error`] call.
//!
//! While the agent answers "no identity issued" the watch polls gently,
//! one second doubling to ten, without consuming retry budget; registering
//! the workload ends that state.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;

use crate::bundle::jwt::JwtBundleSet;
use crate::bundle::x509::X509BundleSet;
use crate::prelude::*;
use crate::retry::{BackoffPolicy, RetryHandler};
use crate::workload_api::client::WorkloadApiClient;
use crate::workload_api::error::{ResourceKind, WorkloadApiError};
use crate::workload_api::x509_context::X509Context;

/// Receives the updates and the terminal error of one watch.
///
/// `on_update` is called for every successfully parsed update, in order.
/// `on_error` is called at most once, when the watch stops on a fatal error
/// or an exhausted retry budget; transient failures are retried internally
/// and never surface here. A cancelled watch stops without either call.
pub trait Watcher<T>: Send + 'static {
    /// Handles a fresh update.
    fn on_update(&mut self, update: T);

    /// Handles the terminal error of the watch.
    fn on_error(&mut self, error: WorkloadApiError);
}

/// Handle on a running watch.
///
/// Dropping the handle detaches the watch: it keeps running until it stops
/// on its own or the client that started it is closed.
#[derive(Debug)]
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Signals the watch to stop. The background task exits promptly; use
    /// [`WatchHandle::join`] to wait for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the background task to exit. Call [`WatchHandle::cancel`]
    /// first to stop a healthy watch.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

impl WorkloadApiClient {
    /// Watches X.509 context updates, reconnecting with backoff per
    /// `policy`.
    ///
    /// Runs until cancelled, until the client is closed, or until the watch
    /// gives up and reports through [`Watcher::on_error`].
    pub fn watch_x509_contexts<W>(&self, watcher: W, policy: BackoffPolicy) -> WatchHandle
    where
        W: Watcher<X509Context>,
    {
        let client = self.clone();
        self.spawn_watch(ResourceKind::X509Context, policy, watcher, move || {
            let client = client.clone();
            async move { client.stream_x509_contexts().await }
        })
    }

    /// Watches X.509 bundle set updates, reconnecting with backoff per
    /// `policy`.
    pub fn watch_x509_bundles<W>(&self, watcher: W, policy: BackoffPolicy) -> WatchHandle
    where
        W: Watcher<X509BundleSet>,
    {
        let client = self.clone();
        self.spawn_watch(ResourceKind::X509Bundles, policy, watcher, move || {
            let client = client.clone();
            async move { client.stream_x509_bundles().await }
        })
    }

    /// Watches JWT bundle set updates, reconnecting with backoff per
    /// `policy`.
    pub fn watch_jwt_bundles<W>(&self, watcher: W, policy: BackoffPolicy) -> WatchHandle
    where
        W: Watcher<JwtBundleSet>,
    {
        let client = self.clone();
        self.spawn_watch(ResourceKind::JwtBundles, policy, watcher, move || {
            let client = client.clone();
            async move { client.stream_jwt_bundles().await }
        })
    }

    fn spawn_watch<T, S, F, Fut, W>(
        &self,
        kind: ResourceKind,
        policy: BackoffPolicy,
        watcher: W,
        open: F,
    ) -> WatchHandle
    where
        T: Send + 'static,
        S: Stream<Item = Result<T, WorkloadApiError>> + Send + Unpin + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, WorkloadApiError>> + Send + 'static,
        W: Watcher<T>,
    {
        // A child token: cancellable on its own, and cancelled along with
        // every other watch when the client closes.
        let cancel = self.cancel_token().child_token();
        let task = tokio::spawn(run_watch(kind, policy, cancel.clone(), open, watcher));
        WatchHandle { cancel, task }
    }
}

/// The reconnect loop shared by client watches and the identity sources.
pub(crate) async fn run_watch<T, S, F, Fut, W>(
    kind: ResourceKind,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    open: F,
    mut watcher: W,
) where
    T: Send + 'static,
    S: Stream<Item = Result<T, WorkloadApiError>> + Send + Unpin + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<S, WorkloadApiError>> + Send + 'static,
    W: Watcher<T>,
{
    let mut state = WatchState {
        watch_id: fastrand::u64(..),
        kind,
        retry: RetryHandler::new(policy),
        no_identity: NoIdentityDelay::new(),
        tracker: ErrorTracker::default(),
        cancel,
    };

    debug!("watch {}: starting {} watch", state.watch_id, state.kind);

    'watch: loop {
        let opened = tokio::select! {
            biased;
            () = state.cancel.cancelled() => break 'watch,
            opened = open() => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => match state.pause_before_retry(error, ErrorKey::Connect).await {
                RetryStep::Reconnect => continue 'watch,
                RetryStep::GiveUp(terminal) => {
                    watcher.on_error(terminal);
                    break 'watch;
                }
                RetryStep::Cancelled => break 'watch,
            },
        };

        // Drain the session until it fails, ends, or the watch is cancelled.
        loop {
            let item = tokio::select! {
                biased;
                () = state.cancel.cancelled() => break 'watch,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(update)) => {
                    watcher.on_update(update);
                    state.note_update();
                }
                Some(Err(error)) => {
                    match state.pause_before_retry(error, ErrorKey::Stream).await {
                        RetryStep::Reconnect => continue 'watch,
                        RetryStep::GiveUp(terminal) => {
                            watcher.on_error(terminal);
                            break 'watch;
                        }
                        RetryStep::Cancelled => break 'watch,
                    }
                }
                None => match state.pause_after_stream_end().await {
                    RetryStep::Reconnect => continue 'watch,
                    RetryStep::GiveUp(terminal) => {
                        watcher.on_error(terminal);
                        break 'watch;
                    }
                    RetryStep::Cancelled => break 'watch,
                },
            }
        }
    }

    debug!("watch {}: {} watch stopped", state.watch_id, state.kind);
}

/// What the watch does after a failure pause.
enum RetryStep {
    /// The delay elapsed; reopen the stream.
    Reconnect,
    /// Fatal error or no budget left; the watch must stop.
    GiveUp(WorkloadApiError),
    /// Cancelled while waiting.
    Cancelled,
}

/// Which phase an error belongs to, for repeat-suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKey {
    Connect,
    Stream,
    NoIdentity,
}

struct WatchState {
    watch_id: u64,
    kind: ResourceKind,
    retry: RetryHandler,
    no_identity: NoIdentityDelay,
    tracker: ErrorTracker,
    cancel: CancellationToken,
}

impl WatchState {
    /// Classifies a failure and, for retryable ones, waits out the
    /// appropriate delay.
    async fn pause_before_retry(&mut self, error: WorkloadApiError, key: ErrorKey) -> RetryStep {
        if !error.is_retryable() {
            error!(
                "watch {}: {} watch failed: {error}",
                self.watch_id, self.kind
            );
            return RetryStep::GiveUp(error);
        }

        // "No identity issued" means the agent is healthy but has no
        // registration for this workload. Poll gently and leave the retry
        // budget untouched; the condition clears on registration.
        if matches!(error, WorkloadApiError::NoIdentityIssued) {
            let delay = self.no_identity.next();
            if self.tracker.record(ErrorKey::NoIdentity) {
                warn!(
                    "watch {}: no identity issued for this workload yet; retrying in {delay:?}",
                    self.watch_id
                );
            } else {
                debug!(
                    "watch {}: still no identity issued; retrying in {delay:?}",
                    self.watch_id
                );
            }
            return self.sleep(delay).await;
        }

        if !self.retry.should_retry() {
            error!(
                "watch {}: giving up on the {} watch after {} failed attempts: {error}",
                self.watch_id,
                self.kind,
                self.retry.retry_count()
            );
            return RetryStep::GiveUp(WorkloadApiError::RetriesExhausted(self.kind));
        }

        let delay = jittered(self.retry.next_wait());
        if self.tracker.record(key) {
            warn!(
                "watch {}: {} watch error: {error}; retrying in {delay:?}",
                self.watch_id, self.kind
            );
        } else {
            debug!(
                "watch {}: {} watch error repeats: {error}; retrying in {delay:?}",
                self.watch_id, self.kind
            );
        }
        self.sleep(delay).await
    }

    /// A cleanly closed stream is a disconnect like any other: it consumes
    /// retry budget until an update resets it.
    async fn pause_after_stream_end(&mut self) -> RetryStep {
        if !self.retry.should_retry() {
            error!(
                "watch {}: giving up on the {} watch: the stream keeps ending without updates",
                self.watch_id, self.kind
            );
            return RetryStep::GiveUp(WorkloadApiError::RetriesExhausted(self.kind));
        }

        let delay = jittered(self.retry.next_wait());
        debug!(
            "watch {}: {} stream ended; reconnecting in {delay:?}",
            self.watch_id, self.kind
        );
        self.sleep(delay).await
    }

    fn note_update(&mut self) {
        self.retry.reset();
        self.no_identity.reset();
        self.tracker.reset();
    }

    async fn sleep(&self, delay: Duration) -> RetryStep {
        if sleep_or_cancel(&self.cancel, delay).await {
            RetryStep::Cancelled
        } else {
            RetryStep::Reconnect
        }
    }
}

/// How many consecutive repeats of one error kind log at WARN before the
/// watch drops to DEBUG.
const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Tracks consecutive repeats of the same error kind so a flapping agent
/// produces a few WARN lines and then quieter DEBUG lines until the error
/// changes or an update gets through.
#[derive(Debug, Default)]
struct ErrorTracker {
    last: Option<ErrorKey>,
    consecutive: u32,
}

impl ErrorTracker {
    /// Records an error occurrence; returns whether it should log at WARN.
    fn record(&mut self, key: ErrorKey) -> bool {
        if self.last == Some(key) {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.last = Some(key);
            self.consecutive = 1;
        }
        self.consecutive <= MAX_CONSECUTIVE_SAME_ERROR
    }

    fn reset(&mut self) {
        self.last = None;
        self.consecutive = 0;
    }
}

const NO_IDENTITY_INITIAL_DELAY: Duration = Duration::from_secs(1);
const NO_IDENTITY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Delay state for "no identity issued" responses: one second, doubling to
/// a ten second ceiling, reset by any delivered update.
#[derive(Debug)]
struct NoIdentityDelay {
    current: Duration,
}

impl NoIdentityDelay {
    const fn new() -> Self {
        Self {
            current: NO_IDENTITY_INITIAL_DELAY,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(NO_IDENTITY_MAX_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.current = NO_IDENTITY_INITIAL_DELAY;
    }
}

/// Adds up to 10% random jitter so synchronized workloads do not reconnect
/// in lockstep.
fn jittered(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    delay.saturating_add(Duration::from_millis(fastrand::u64(0..=millis / 10)))
}

/// Sleeps for `delay` unless cancelled first; returns whether the wait was
/// cancelled.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct RecordingWatcher {
        updates: mpsc::UnboundedSender<u64>,
        errors: mpsc::UnboundedSender<WorkloadApiError>,
    }

    impl RecordingWatcher {
        fn new() -> (
            Self,
            mpsc::UnboundedReceiver<u64>,
            mpsc::UnboundedReceiver<WorkloadApiError>,
        ) {
            let (updates_tx, updates_rx) = mpsc::unbounded_channel();
            let (errors_tx, errors_rx) = mpsc::unbounded_channel();
            (
                Self {
                    updates: updates_tx,
                    errors: errors_tx,
                },
                updates_rx,
                errors_rx,
            )
        }
    }

    impl Watcher<u64> for RecordingWatcher {
        fn on_update(&mut self, update: u64) {
            let _ = self.updates.send(update);
        }

        fn on_error(&mut self, error: WorkloadApiError) {
            let _ = self.errors.send(error);
        }
    }

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
    }

    fn unavailable() -> WorkloadApiError {
        WorkloadApiError::from(tonic::Status::unavailable("agent restarting"))
    }

    #[tokio::test]
    async fn fatal_stream_error_stops_the_watch_after_one_report() {
        let sessions = Arc::new(AtomicUsize::new(0));
        let opener_sessions = Arc::clone(&sessions);
        let (watcher, mut updates, mut errors) = RecordingWatcher::new();

        run_watch(
            ResourceKind::X509Context,
            fast_policy(),
            CancellationToken::new(),
            move || {
                opener_sessions.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(tokio_stream::iter(vec![
                        Ok(1),
                        Err(WorkloadApiError::from(tonic::Status::invalid_argument(
                            "bad request",
                        ))),
                    ]))
                }
            },
            watcher,
        )
        .await;

        assert_eq!(sessions.load(Ordering::SeqCst), 1);
        assert_eq!(updates.try_recv().ok(), Some(1));
        assert!(matches!(errors.try_recv(), Ok(WorkloadApiError::Rpc(_))));
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn retryable_connect_errors_reconnect_until_an_update_arrives() {
        let sessions = Arc::new(AtomicUsize::new(0));
        let opener_sessions = Arc::clone(&sessions);
        let (watcher, mut updates, mut errors) = RecordingWatcher::new();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_watch(
            ResourceKind::JwtBundles,
            fast_policy(),
            cancel.clone(),
            move || {
                let session = opener_sessions.fetch_add(1, Ordering::SeqCst);
                async move {
                    if session < 2 {
                        return Err(unavailable());
                    }
                    Ok(tokio_stream::iter(vec![Ok::<u64, WorkloadApiError>(7)]))
                }
            },
            watcher,
        ));

        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap();
        assert_eq!(update, Some(7));

        cancel.cancel();
        task.await.unwrap();

        assert!(sessions.load(Ordering::SeqCst) >= 3);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn budget_exhaustion_reports_retries_exhausted() {
        let sessions = Arc::new(AtomicUsize::new(0));
        let opener_sessions = Arc::clone(&sessions);
        let (watcher, _updates, mut errors) = RecordingWatcher::new();

        run_watch(
            ResourceKind::X509Bundles,
            fast_policy().with_max_retries(2),
            CancellationToken::new(),
            move || {
                opener_sessions.fetch_add(1, Ordering::SeqCst);
                async move { Err::<tokio_stream::Iter<std::vec::IntoIter<Result<u64, WorkloadApiError>>>, _>(unavailable()) }
            },
            watcher,
        )
        .await;

        // The first attempt plus two retries.
        assert_eq!(sessions.load(Ordering::SeqCst), 3);
        assert!(matches!(
            errors.try_recv(),
            Ok(WorkloadApiError::RetriesExhausted(
                ResourceKind::X509Bundles
            ))
        ));
    }

    #[tokio::test]
    async fn stream_end_consumes_budget_and_reconnects() {
        let sessions = Arc::new(AtomicUsize::new(0));
        let opener_sessions = Arc::clone(&sessions);
        let (watcher, mut updates, mut errors) = RecordingWatcher::new();

        run_watch(
            ResourceKind::X509Context,
            fast_policy().with_max_retries(1),
            CancellationToken::new(),
            move || {
                opener_sessions.fetch_add(1, Ordering::SeqCst);
                async move { Ok(tokio_stream::iter(Vec::<Result<u64, WorkloadApiError>>::new())) }
            },
            watcher,
        )
        .await;

        assert_eq!(sessions.load(Ordering::SeqCst), 2);
        assert!(updates.try_recv().is_err());
        assert!(matches!(
            errors.try_recv(),
            Ok(WorkloadApiError::RetriesExhausted(ResourceKind::X509Context))
        ));
    }

    #[tokio::test]
    async fn updates_reset_the_retry_budget() {
        let sessions = Arc::new(AtomicUsize::new(0));
        let opener_sessions = Arc::clone(&sessions);
        let (watcher, mut updates, mut errors) = RecordingWatcher::new();

        run_watch(
            ResourceKind::X509Context,
            fast_policy().with_max_retries(1),
            CancellationToken::new(),
            move || {
                let session = opener_sessions.fetch_add(1, Ordering::SeqCst);
                async move {
                    let items: Vec<Result<u64, WorkloadApiError>> = match session {
                        0 => vec![Ok(1)],
                        1 => vec![Ok(2)],
                        _ => Vec::new(),
                    };
                    Ok(tokio_stream::iter(items))
                }
            },
            watcher,
        )
        .await;

        // Each update restores the budget, so sessions 0 and 1 both get to
        // reconnect; the empty session 2 exhausts it.
        assert_eq!(sessions.load(Ordering::SeqCst), 3);
        assert_eq!(updates.try_recv().ok(), Some(1));
        assert_eq!(updates.try_recv().ok(), Some(2));
        assert!(matches!(
            errors.try_recv(),
            Ok(WorkloadApiError::RetriesExhausted(_))
        ));
    }

    #[tokio::test]
    async fn no_identity_does_not_consume_the_retry_budget() {
        let sessions = Arc::new(AtomicUsize::new(0));
        let opener_sessions = Arc::clone(&sessions);
        let (watcher, mut updates, mut errors) = RecordingWatcher::new();
        let cancel = CancellationToken::new();

        // A budget of zero fails the watch on any ordinary retryable error,
        // so surviving the no-identity response proves it is budget-free.
        let task = tokio::spawn(run_watch(
            ResourceKind::X509Context,
            fast_policy().with_max_retries(0),
            cancel.clone(),
            move || {
                let session = opener_sessions.fetch_add(1, Ordering::SeqCst);
                async move {
                    if session == 0 {
                        return Err(WorkloadApiError::NoIdentityIssued);
                    }
                    Ok(tokio_stream::iter(vec![Ok::<u64, WorkloadApiError>(9)]))
                }
            },
            watcher,
        ));

        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap();
        assert_eq!(update, Some(9));

        cancel.cancel();
        task.await.unwrap();
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_watch_stops_silently() {
        let (watcher, _updates, mut errors) = RecordingWatcher::new();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_watch(
            ResourceKind::JwtBundles,
            fast_policy(),
            cancel.clone(),
            move || async move { Ok(tokio_stream::pending::<Result<u64, WorkloadApiError>>()) },
            watcher,
        ));

        let handle = WatchHandle {
            cancel,
            task,
        };
        handle.cancel();
        handle.join().await;

        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn error_tracker_warns_for_the_first_three_repeats() {
        let mut tracker = ErrorTracker::default();

        assert!(tracker.record(ErrorKey::Connect));
        assert!(tracker.record(ErrorKey::Connect));
        assert!(tracker.record(ErrorKey::Connect));
        assert!(!tracker.record(ErrorKey::Connect));

        // A different kind starts a fresh run.
        assert!(tracker.record(ErrorKey::Stream));

        tracker.reset();
        assert!(tracker.record(ErrorKey::Stream));
    }

    #[test]
    fn no_identity_delay_doubles_to_the_ceiling() {
        let mut delay = NoIdentityDelay::new();

        assert_eq!(delay.next(), Duration::from_secs(1));
        assert_eq!(delay.next(), Duration::from_secs(2));
        assert_eq!(delay.next(), Duration::from_secs(4));
        assert_eq!(delay.next(), Duration::from_secs(8));
        assert_eq!(delay.next(), Duration::from_secs(10));
        assert_eq!(delay.next(), Duration::from_secs(10));

        delay.reset();
        assert_eq!(delay.next(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let delayed = jittered(base);
            assert!(delayed >= base);
            assert!(delayed <= base + Duration::from_millis(100));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
