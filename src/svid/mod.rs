//! X.509-SVID and JWT-SVID types.

use std::error::Error;
use std::sync::Arc;

pub mod jwt;
pub mod x509;

pub use jwt::{JwtSvid, JwtSvidError};
pub use x509::{X509Svid, X509SvidError};

/// A source of SVIDs, such as an [`crate::X509Source`] kept current by a
/// background watch.
///
/// Returns `Arc` values so implementations can hand out their internally
/// cached documents without cloning them or leaking borrow lifetimes.
pub trait SvidSource {
    /// The SVID type provided by the source.
    type Item: Send + Sync + 'static;

    /// The error type returned by the source.
    type Error: Error + Send + Sync + 'static;

    /// Returns the current SVID.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` if no SVID can be served, for example because
    /// the source is closed.
    fn svid(&self) -> Result<Arc<Self::Item>, Self::Error>;
}
