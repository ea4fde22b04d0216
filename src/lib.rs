#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Client bindings for the
//! [SPIFFE Workload API](https://github.com/spiffe/spiffe/blob/main/standards/SPIFFE_Workload_API.md).
//!
//! Workloads use this crate to obtain and keep current their SPIFFE-issued
//! identities: X.509 SVIDs with their trust bundles, and JWT SVIDs with the
//! JWKS bundles to validate them.
//!
//! Most workloads want one of the live sources:
//!
//! - [`X509Source`] watches the Workload API and always holds the current
//!   X.509 SVID and trust bundles, replacing them atomically on rotation.
//! - [`JwtSource`] watches JWT bundles and mints JWT SVIDs on demand;
//!   [`CachedJwtSource`] adds a per-audience cache that refreshes tokens
//!   once they pass half of their lifetime.
//!
//! [`WorkloadApiClient`] underneath them exposes the raw one-shot RPCs and
//! streams, plus supervised watches with reconnection and backoff.
//!
//! ## X.509 identity
//!
//! ```no_run
//! use workload_identity::{TrustDomain, X509Source};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Connects via SPIFFE_ENDPOINT_SOCKET and waits for the first context.
//! let source = X509Source::new().await?;
//!
//! let svid = source.svid()?;
//! println!("serving as {}", svid.spiffe_id());
//!
//! let td = TrustDomain::new("example.org")?;
//! let bundle = source
//!     .bundle_for_trust_domain(&td)?
//!     .ok_or("missing bundle")?;
//! println!("{} trusted authorities", bundle.authorities().len());
//!
//! source.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## JWT identity
//!
//! ```no_run
//! use workload_identity::CachedJwtSource;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = CachedJwtSource::new().await?;
//!
//! // Served from the cache until the token passes half of its lifetime.
//! let svid = source.fetch_jwt_svid(["service-a"], None).await?;
//! println!("bearer {}", svid.token());
//!
//! source.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate features
//!
//! - **`logging`** (default): emit diagnostics through the `log` facade.
//! - **`tracing`**: emit diagnostics through `tracing` instead; takes
//!   precedence over `logging` when both are enabled.
//! - **`integration-tests`**: enable tests that require a running SPIFFE
//!   Workload API (e.g. a local SPIRE agent).

pub mod address;
pub mod bundle;
pub mod cert;
pub mod jwt_source;
mod observability;
mod prelude;
pub mod retry;
pub mod source;
pub mod spiffe_id;
pub mod svid;
pub mod transport;
pub mod workload_api;
pub mod x509_source;

#[cfg(test)]
pub(crate) mod test_certs;

pub use crate::{
    address::{Address, AddressError, ENDPOINT_SOCKET_ENV},
    bundle::jwt::{JwtAuthority, JwtBundle, JwtBundleError, JwtBundleSet},
    bundle::x509::{X509Bundle, X509BundleError, X509BundleSet},
    bundle::BundleSource,
    spiffe_id::{SpiffeId, SpiffeIdError, TrustDomain},
    svid::jwt::{JwtSvid, JwtSvidError},
    svid::x509::{X509Svid, X509SvidError},
    svid::SvidSource,
};

pub use crate::jwt_source::{CachedJwtSource, Clock, JwtSource, JwtSourceBuilder, SystemClock};
pub use crate::retry::{BackoffPolicy, RetryHandler};
pub use crate::source::{ClientFactory, ClientFuture, SourceUpdates, INIT_TIMEOUT_ENV};
pub use crate::transport::TransportError;
pub use crate::workload_api::{
    Classification, ResourceKind, WatchHandle, Watcher, WorkloadApiClient, WorkloadApiError,
    X509Context,
};
pub use crate::x509_source::{SvidPicker, X509Source, X509SourceBuilder};
