//! Workload API client for fetching SPIFFE X.509 and JWT material.
//!
//! `WorkloadApiClient` provides one-shot RPCs (fetch SVIDs/bundles), raw streaming RPCs, and
//! supervised watches (see [`crate::workload_api::watch`]) that survive reconnects. Higher-level
//! types like [`crate::X509Source`] and [`crate::JwtSource`] build on the watches and present an
//! always-up-to-date view of the material.
//!
//! A single workload may be issued **multiple SVIDs** by the Workload API. When this happens, the
//! agent may attach an optional **hint** to each SVID to help distinguish identities. Hints are
//! **not part of the cryptographic material** and have no security meaning. List responses are
//! deduplicated by hint: the first SVID carrying each non-empty hint is kept, SVIDs without a
//! hint always stay.

mod header;
mod jwt;
mod x509;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use crate::address::Address;
use crate::prelude::*;
use crate::transport;
use crate::workload_api::client::header::MetadataAdder;
use crate::workload_api::error::{ResourceKind, WorkloadApiError};
use crate::workload_api::pb::workload::spiffe_workload_api_client::SpiffeWorkloadApiClient;

/// Client for the SPIFFE Workload API.
///
/// Provides one-shot calls, raw streams, and supervised watches for X.509 and JWT SVIDs and
/// bundles. Clones share one connection and one lifecycle: [`WorkloadApiClient::close`] on any
/// clone stops the watches started from every clone, and further calls on any clone fail with
/// [`WorkloadApiError::Closed`].
#[derive(Debug, Clone)]
pub struct WorkloadApiClient {
    address: Address,
    client: SpiffeWorkloadApiClient<InterceptedService<Channel, MetadataAdder>>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WorkloadApiClient {
    /// Returns the Workload API address this client connects to.
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// Connects to the Workload API at a parsed [`Address`].
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the endpoint cannot be reached or
    /// the gRPC connection fails.
    pub async fn connect(address: &Address) -> Result<Self, WorkloadApiError> {
        let channel = transport::connect(address).await?;
        Ok(Self::new_with_channel(address.clone(), channel))
    }

    /// Connects to the Workload API using the given endpoint string.
    ///
    /// Examples:
    /// - `unix:/tmp/spire-agent/public/api.sock` or `unix:///tmp/spire-agent/public/api.sock`
    /// - `tcp:127.0.0.1:8081` or `tcp://127.0.0.1:8081`
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the endpoint string is invalid, the
    /// endpoint cannot be reached, or the gRPC connection fails.
    pub async fn connect_to(endpoint: impl AsRef<str>) -> Result<Self, WorkloadApiError> {
        let address: Address = endpoint.as_ref().parse()?;
        Self::connect(&address).await
    }

    /// Connects to the Workload API using the `SPIFFE_ENDPOINT_SOCKET`
    /// environment variable.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] if the variable is unset or invalid,
    /// the endpoint cannot be reached, or the gRPC connection fails.
    pub async fn connect_env() -> Result<Self, WorkloadApiError> {
        let address = Address::from_env()?;
        Self::connect(&address).await
    }

    /// Creates a client from an existing gRPC channel.
    ///
    /// This is primarily intended for tests or advanced transport
    /// customization. The channel must already be configured to reach the
    /// actual SPIFFE endpoint; `address` is kept for diagnostics only.
    ///
    /// For normal usage, see [`WorkloadApiClient::connect`] or
    /// [`WorkloadApiClient::connect_env`].
    pub fn new_with_channel(address: Address, channel: Channel) -> Self {
        Self {
            address,
            client: SpiffeWorkloadApiClient::with_interceptor(channel, MetadataAdder {}),
            closed: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Closes the client.
    ///
    /// All watches started from this client (or its clones) stop, and
    /// subsequent calls fail with [`WorkloadApiError::Closed`]. Calling
    /// `close` again is a no-op; only the first call has any effect.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing workload api client for {}", self.address);
            self.cancel.cancel();
        }
    }

    /// Whether [`WorkloadApiClient::close`] has been called on this client
    /// or any of its clones.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl WorkloadApiClient {
    /// Fails with [`WorkloadApiError::Closed`] once the client is closed.
    pub(super) fn assert_open(&self) -> Result<(), WorkloadApiError> {
        if self.is_closed() {
            return Err(WorkloadApiError::Closed);
        }
        Ok(())
    }

    /// The token child watches observe; cancelled by `close`.
    pub(super) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A cloned handle on the gRPC stub, ready for a mutable call.
    pub(super) fn stub(
        &self,
    ) -> SpiffeWorkloadApiClient<InterceptedService<Channel, MetadataAdder>> {
        self.client.clone()
    }

    /// Extracts the first message from a streaming gRPC response.
    ///
    /// Returns [`WorkloadApiError::EmptyResponse`] if the stream ends without
    /// yielding a message.
    pub(super) async fn first_message<T>(
        mut stream: tonic::Streaming<T>,
        kind: ResourceKind,
    ) -> Result<T, WorkloadApiError> {
        stream
            .message()
            .await?
            .ok_or(WorkloadApiError::EmptyResponse(kind))
    }
}

/// Drops list entries whose non-empty hint was already seen, keeping the
/// first occurrence of each hint. Entries with an empty hint always stay.
fn dedup_by_hint<T>(items: &mut Vec<T>, hint_of: impl Fn(&T) -> &str) {
    let before = items.len();
    let mut seen = HashSet::new();
    items.retain(|item| {
        let hint = hint_of(item);
        hint.is_empty() || seen.insert(hint.to_owned())
    });

    let dropped = before - items.len();
    if dropped > 0 {
        warn!("ignoring {dropped} svid(s) with a duplicate hint");
    }
}
