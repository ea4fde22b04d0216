//! Error taxonomy for Workload API operations.
//!
//! One error type covers the client, the watch engine, and the sources.
//! Every value classifies itself as retryable or fatal through
//! [`WorkloadApiError::classification`]; the watch engine consults that
//! classification instead of matching variants.

use std::fmt;

use thiserror::Error;

use crate::address::AddressError;
use crate::bundle::jwt::JwtBundleError;
use crate::bundle::x509::X509BundleError;
use crate::spiffe_id::{SpiffeId, SpiffeIdError};
use crate::svid::jwt::JwtSvidError;
use crate::svid::x509::X509SvidError;
use crate::transport::TransportError;

/// The resource a Workload API operation fetches or watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// X.509 SVIDs together with their trust bundles.
    X509Context,
    /// X.509 trust bundles.
    X509Bundles,
    /// JWT-SVIDs.
    JwtSvid,
    /// JWT trust bundles.
    JwtBundles,
}

impl ResourceKind {
    /// Stable lowercase name, usable as a log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X509Context => "x509 context",
            Self::X509Bundles => "x509 bundles",
            Self::JwtSvid => "jwt svid",
            Self::JwtBundles => "jwt bundles",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the operation that failed may be usefully retried.
///
/// Watches retry `Retryable` errors with backoff and surface `Fatal` ones
/// through their watcher; one-shot calls surface everything immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transient; trying again later may succeed.
    Retryable,
    /// Permanent for this request; retrying would repeat the failure.
    Fatal,
}

/// Errors produced by Workload API operations and the sources built on them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkloadApiError {
    /// The endpoint address is missing from the environment or invalid.
    #[error("invalid workload api endpoint: {0}")]
    Address(#[from] AddressError),

    /// The gRPC channel could not be established.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server failed or aborted an RPC.
    #[error("workload api call failed: {0}")]
    Rpc(tonic::Status),

    /// The Workload API has no identity for this workload yet, for example
    /// because its selectors match no registration entry.
    #[error("no identity issued")]
    NoIdentityIssued,

    /// The Workload API denied the request for other permission reasons.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A response carried no entries for the requested resource.
    #[error("the workload api returned no {0}")]
    EmptyResponse(ResourceKind),

    /// The SPIFFE ID asserted by a response does not match the one embedded
    /// in the returned certificate.
    ///
    /// This means the server attached the wrong key material to an identity
    /// label; it is never retried.
    #[error("workload api asserted spiffe id {asserted} but the leaf certificate carries {found}")]
    IdentityMismatch {
        /// The SPIFFE ID the response claimed the SVID was issued for.
        asserted: SpiffeId,
        /// The SPIFFE ID found in the leaf certificate's URI SAN.
        found: SpiffeId,
    },

    /// No SVID in the response carried the requested hint.
    #[error("no svid found with hint: {0}")]
    HintNotFound(String),

    /// Failed to parse an X.509 SVID from a response.
    #[error("failed to parse x509 svid: {0}")]
    X509Svid(#[from] X509SvidError),

    /// Failed to parse a JWT-SVID from a response.
    #[error("failed to parse jwt svid: {0}")]
    JwtSvid(#[from] JwtSvidError),

    /// Failed to parse an X.509 bundle from a response.
    #[error("failed to parse x509 bundle: {0}")]
    X509Bundle(#[from] X509BundleError),

    /// Failed to parse a JWT bundle from a response.
    #[error("failed to parse jwt bundle: {0}")]
    JwtBundle(#[from] JwtBundleError),

    /// Failed to parse a SPIFFE ID carried by a response.
    #[error("failed to parse spiffe id: {0}")]
    SpiffeId(#[from] SpiffeIdError),

    /// The client or source has been closed; no further calls are accepted.
    #[error("closed")]
    Closed,

    /// Initial synchronization did not deliver an update in time.
    #[error("timed out waiting for the initial {0} update")]
    InitTimeout(ResourceKind),

    /// A watch exhausted its retry budget and stopped.
    #[error("giving up watching {0}: retry budget exhausted")]
    RetriesExhausted(ResourceKind),
}

impl WorkloadApiError {
    /// Classifies this error for the watch engine.
    ///
    /// Transport and RPC failures are transient, except `InvalidArgument`:
    /// the server has rejected the request as malformed and will reject it
    /// again. `NoIdentityIssued` and other permission denials clear once the
    /// workload is registered. Everything else — validation, protocol,
    /// configuration, lifecycle — is permanent.
    pub fn classification(&self) -> Classification {
        match self {
            Self::Transport(_) | Self::NoIdentityIssued | Self::PermissionDenied(_) => {
                Classification::Retryable
            }
            Self::Rpc(status) if status.code() == tonic::Code::InvalidArgument => {
                Classification::Fatal
            }
            Self::Rpc(_) => Classification::Retryable,
            _ => Classification::Fatal,
        }
    }

    /// Whether a watch may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.classification() == Classification::Retryable
    }
}

impl From<tonic::Status> for WorkloadApiError {
    fn from(status: tonic::Status) -> Self {
        if status.code() == tonic::Code::PermissionDenied {
            let message = status.message();

            if message.contains("no identity issued") {
                return Self::NoIdentityIssued;
            }

            return Self::PermissionDenied(message.to_owned());
        }

        Self::Rpc(status)
    }
}
