//! X.509 identity source: a live, concurrently-readable view of the
//! workload's X.509 SVIDs and trust bundles.
//!
//! [`X509Source`] starts a supervised Workload API watch at construction,
//! blocks until the first context arrives (bounded by an optional init
//! timeout), and from then on atomically replaces its state on every
//! rotation. Reads never touch the network. If multiple SVIDs are issued,
//! an optional [`SvidPicker`] selects the one served by
//! [`X509Source::svid`]; without one the Workload API default (first in the
//! list) is used.
//!
//! # Example
//!
//! ```no_run
//! use workload_identity::{BundleSource as _, TrustDomain, X509Source};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let source = X509Source::new().await?;
//!
//! let svid = source.svid()?;
//! println!("serving as {}", svid.spiffe_id());
//!
//! let td = TrustDomain::new("example.org")?;
//! let bundle = source
//!     .bundle_for_trust_domain(&td)?
//!     .ok_or("missing bundle")?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::svid::X509Svid;

mod builder;
mod source;

pub use builder::X509SourceBuilder;
pub use source::X509Source;

/// Strategy for selecting the served X.509 SVID when several are issued.
///
/// The picker runs once per received context, not per read: its choice is
/// stored and [`X509Source::svid`] returns it until the next rotation.
/// Returning `None` (or an out-of-range index) rejects the whole update and
/// the source keeps its previous state.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use workload_identity::x509_source::SvidPicker;
/// use workload_identity::X509Svid;
///
/// #[derive(Debug)]
/// struct HintPicker {
///     hint: String,
/// }
///
/// impl SvidPicker for HintPicker {
///     fn pick_svid(&self, svids: &[Arc<X509Svid>]) -> Option<usize> {
///         svids
///             .iter()
///             .position(|svid| svid.hint() == Some(self.hint.as_str()))
///     }
/// }
/// ```
pub trait SvidPicker: Send + Sync + 'static {
    /// Selects an SVID from the slice by returning its index.
    fn pick_svid(&self, svids: &[Arc<X509Svid>]) -> Option<usize>;
}
