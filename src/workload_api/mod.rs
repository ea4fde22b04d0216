//! A client to interact with the SPIFFE Workload API to fetch X.509 and JWT materials.
//!
//! Higher-level types like [`crate::X509Source`] and [`crate::JwtSource`] provide automatic caching
//! and reconnection. [`crate::WorkloadApiClient`] provides direct access to one-shot RPCs, raw
//! streams, and supervised [`watch`]es.

// Generated protobuf bindings, built from `src/proto/workload.proto`.
#[allow(
    unreachable_pub,
    unused_qualifications,
    unused_results,
    clippy::derive_partial_eq_without_eq,
    clippy::doc_markdown,
    clippy::empty_structs_with_brackets
)]
pub(crate) mod pb {
    pub(crate) mod workload {
        include!(concat!(env!("OUT_DIR"), "/workload.rs"));
    }
}

pub mod client;
pub mod error;
pub mod watch;
pub mod x509_context;

pub use client::WorkloadApiClient;
pub use error::{Classification, ResourceKind, WorkloadApiError};
pub use watch::{WatchHandle, Watcher};
pub use x509_context::X509Context;
