//! All the X.509 materials for a workload: its SVIDs plus the trust bundles
//! needed to validate peers.

use std::sync::Arc;

use crate::bundle::x509::X509BundleSet;
use crate::svid::x509::X509Svid;

/// Represents all X.509 materials fetched from the Workload API.
///
/// An `X509Context` pairs the X.509 SVIDs issued to a workload with the trust
/// bundles of its own and any federated trust domains. Both parts come from
/// the same Workload API response, so they are mutually consistent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct X509Context {
    svids: Vec<Arc<X509Svid>>,
    bundle_set: Arc<X509BundleSet>,
}

impl X509Context {
    /// Creates a new [`X509Context`] from SVIDs and a bundle set.
    ///
    /// The provided SVIDs are collected in order; the bundle set is shared
    /// via `Arc`.
    #[must_use]
    pub fn new(
        svids: impl IntoIterator<Item = Arc<X509Svid>>,
        bundle_set: impl Into<Arc<X509BundleSet>>,
    ) -> Self {
        Self {
            svids: svids.into_iter().collect(),
            bundle_set: bundle_set.into(),
        }
    }

    /// Returns the default [`X509Svid`], if present.
    ///
    /// By Workload API convention the default identity is listed first in
    /// the response.
    pub fn default_svid(&self) -> Option<&Arc<X509Svid>> {
        self.svids.first()
    }

    /// Returns all X.509 SVIDs in this context, in Workload API order.
    pub fn svids(&self) -> &[Arc<X509Svid>] {
        self.svids.as_slice()
    }

    /// Returns the set of X.509 bundles associated with this context.
    pub fn bundle_set(&self) -> &Arc<X509BundleSet> {
        &self.bundle_set
    }
}
