//! Plumbing shared by the background-refreshed identity sources.
//!
//! Both [`crate::X509Source`] and [`crate::JwtSource`] are built around the
//! same mechanics: a [`ClientFactory`] that (re)connects the Workload API
//! client, an [`UpdateNotifier`] that wakes subscribers after every stored
//! update, and a bounded wait for the first update during construction.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::address::Address;
use crate::prelude::*;
use crate::workload_api::client::WorkloadApiClient;
use crate::workload_api::error::{ResourceKind, WorkloadApiError};

/// Future returned by a [`ClientFactory`].
pub type ClientFuture =
    Pin<Box<dyn Future<Output = Result<WorkloadApiClient, WorkloadApiError>> + Send>>;

/// Connects a [`WorkloadApiClient`] on demand.
///
/// Sources call their factory once at startup and again whenever they decide
/// the current client is beyond saving, so the factory must be reusable.
pub type ClientFactory = Arc<dyn Fn() -> ClientFuture + Send + Sync>;

/// Builds the default factory: connect to `address` when given, otherwise to
/// the endpoint named by `SPIFFE_ENDPOINT_SOCKET`.
pub(crate) fn client_factory_for(address: Option<Address>) -> ClientFactory {
    Arc::new(move || {
        let address = address.clone();
        Box::pin(async move {
            match address {
                Some(address) => WorkloadApiClient::connect(&address).await,
                None => WorkloadApiClient::connect_env().await,
            }
        })
    })
}

/// Environment variable bounding how long building a source waits for its
/// initial update, in whole seconds. `0` or unset waits indefinitely.
pub const INIT_TIMEOUT_ENV: &str = "SPIFFE_SOURCE_INIT_TIMEOUT";

/// Reads [`INIT_TIMEOUT_ENV`]; malformed values are logged and ignored.
pub(crate) fn init_timeout_from_env() -> Option<Duration> {
    let raw = std::env::var(INIT_TIMEOUT_ENV).ok()?;
    match parse_init_timeout(&raw) {
        Ok(timeout) => timeout,
        Err(()) => {
            warn!("ignoring invalid {INIT_TIMEOUT_ENV} value {raw:?}: expected whole seconds");
            None
        }
    }
}

fn parse_init_timeout(raw: &str) -> Result<Option<Duration>, ()> {
    let secs = raw.trim().parse::<u64>().map_err(|_| ())?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

/// Waits for the supervisor to signal its first stored update.
///
/// A dropped sender means the supervisor died before signalling, which only
/// happens when the source is torn down mid-build.
pub(crate) async fn await_initial_update(
    rx: oneshot::Receiver<Result<(), WorkloadApiError>>,
    timeout: Option<Duration>,
    kind: ResourceKind,
) -> Result<(), WorkloadApiError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, rx).await {
            Ok(signal) => signal.unwrap_or(Err(WorkloadApiError::Closed)),
            Err(_) => Err(WorkloadApiError::InitTimeout(kind)),
        },
        None => rx.await.unwrap_or(Err(WorkloadApiError::Closed)),
    }
}

/// Sender half of a source's update notifications.
///
/// Every stored update bumps a monotonically increasing sequence number and
/// wakes all [`SourceUpdates`] subscribers.
#[derive(Debug)]
pub(crate) struct UpdateNotifier {
    seq: AtomicU64,
    tx: watch::Sender<u64>,
}

impl UpdateNotifier {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            seq: AtomicU64::new(0),
            tx,
        }
    }

    /// Bumps the sequence number and wakes every subscriber.
    pub(crate) fn notify(&self) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.tx.send_replace(seq);
    }

    pub(crate) fn subscribe(&self) -> SourceUpdates {
        SourceUpdates {
            rx: self.tx.subscribe(),
        }
    }
}

/// A subscription to a source's update notifications.
///
/// Each stored update bumps a sequence number; [`SourceUpdates::changed`]
/// resolves whenever the number moves past the last one this subscription
/// observed. Notifications coalesce: a burst of updates may wake a waiting
/// subscriber once, with the latest number.
#[derive(Debug, Clone)]
pub struct SourceUpdates {
    rx: watch::Receiver<u64>,
}

impl SourceUpdates {
    /// Waits for the next update and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadApiError::Closed`] once the source is gone.
    pub async fn changed(&mut self) -> Result<u64, WorkloadApiError> {
        self.rx
            .changed()
            .await
            .map_err(|_| WorkloadApiError::Closed)?;
        Ok(*self.rx.borrow_and_update())
    }

    /// The sequence number of the most recent update, `0` before the first.
    #[must_use]
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }
}
