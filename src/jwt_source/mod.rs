//! JWT identity sources: live JWT trust bundles plus on-demand (and
//! optionally cached) JWT-SVID fetching.
//!
//! Unlike X.509 SVIDs, which the Workload API streams continuously, JWT-SVIDs
//! are minted on demand for a specific audience. [`JwtSource`] therefore
//! combines two mechanisms: a supervised watch keeps the JWT trust bundles
//! current for token validation, while [`JwtSource::fetch_jwt_svid`] performs
//! a one-shot fetch each time it is called. [`CachedJwtSource`] adds a cache
//! in front of those fetches, serving each (subject, audience set) pair from
//! memory until the token passes half of its lifetime.
//!
//! # Example
//!
//! ```no_run
//! use workload_identity::{BundleSource as _, JwtSource, TrustDomain};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let source = JwtSource::new().await?;
//!
//! let svid = source.fetch_jwt_svid(&["service-a"], None).await?;
//! println!("token for {}", svid.spiffe_id());
//!
//! let td = TrustDomain::new("example.org")?;
//! let bundle = source
//!     .bundle_for_trust_domain(&td)?
//!     .ok_or("missing bundle")?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod cached;
mod source;

pub use builder::JwtSourceBuilder;
pub use cached::{CachedJwtSource, Clock, SystemClock};
pub use source::JwtSource;
