//! Trust bundle types: X.509 authorities and JWT authorities, keyed by
//! trust domain.

use std::error::Error;
use std::sync::Arc;

use crate::spiffe_id::TrustDomain;

pub mod jwt;
pub mod x509;

/// A source of trust bundles queryable by [`TrustDomain`].
pub trait BundleSource {
    /// The bundle type this source provides.
    type Item: Send + Sync + 'static;

    /// The error the source can fail with.
    type Error: Error + Send + Sync + 'static;

    /// Returns the bundle for the given trust domain, or `Ok(None)` when the
    /// source holds none.
    ///
    /// # Errors
    ///
    /// Returns `Err(Self::Error)` if the underlying source cannot be queried.
    fn bundle_for_trust_domain(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<Self::Item>>, Self::Error>;
}
