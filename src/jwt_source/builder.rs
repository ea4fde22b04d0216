use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::jwt_source::{CachedJwtSource, Clock, JwtSource, SystemClock};
use crate::retry::BackoffPolicy;
use crate::source::{client_factory_for, init_timeout_from_env, ClientFactory};
use crate::workload_api::error::WorkloadApiError;

/// Builder for [`JwtSource`] and [`CachedJwtSource`].
///
/// All settings have working defaults: the endpoint comes from
/// `SPIFFE_ENDPOINT_SOCKET`, reconnects use the default [`BackoffPolicy`],
/// and the init timeout is read from `SPIFFE_SOURCE_INIT_TIMEOUT` when set.
///
/// # Example
///
/// ```no_run
/// use workload_identity::JwtSource;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let source = JwtSource::builder()
///     .address("unix:///tmp/spire-agent/public/api.sock".parse()?)
///     .build()
///     .await?;
/// # drop(source);
/// # Ok(())
/// # }
/// ```
pub struct JwtSourceBuilder {
    address: Option<Address>,
    make_client: Option<ClientFactory>,
    backoff: BackoffPolicy,
    init_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for JwtSourceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtSourceBuilder")
            .field("address", &self.address)
            .field(
                "make_client",
                &self.make_client.as_ref().map(|_| "<ClientFactory>"),
            )
            .field("backoff", &self.backoff)
            .field("init_timeout", &self.init_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for JwtSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl JwtSourceBuilder {
    /// Creates a builder with the defaults described on the type.
    #[must_use]
    pub fn new() -> Self {
        Self {
            address: None,
            make_client: None,
            backoff: BackoffPolicy::new(),
            init_timeout: init_timeout_from_env(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Connects to `address` instead of the endpoint named by
    /// `SPIFFE_ENDPOINT_SOCKET`.
    #[must_use]
    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Supplies the factory used to (re)connect the Workload API client,
    /// replacing the address-based default. Takes precedence over
    /// [`JwtSourceBuilder::address`].
    #[must_use]
    pub fn client_factory(mut self, factory: ClientFactory) -> Self {
        self.make_client = Some(factory);
        self
    }

    /// Sets the reconnect backoff policy for the background bundle watch.
    #[must_use]
    pub const fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bounds how long building waits for the first bundle set. `None` waits
    /// indefinitely.
    #[must_use]
    pub const fn init_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Sets the clock the cache uses for staleness decisions. Only
    /// [`JwtSourceBuilder::build_cached`] consults it.
    #[must_use]
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Builds the source: starts the background bundle watch and waits for
    /// the initial bundle set.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the watch fails terminally before
    /// the first bundle set arrives, or [`WorkloadApiError::InitTimeout`]
    /// when the init timeout elapses first. The partially built source is
    /// closed before the error propagates.
    pub async fn build(self) -> Result<JwtSource, WorkloadApiError> {
        let make_client = self
            .make_client
            .unwrap_or_else(|| client_factory_for(self.address));
        JwtSource::build_with(make_client, self.backoff, self.init_timeout).await
    }

    /// Like [`JwtSourceBuilder::build`], wrapping the source in a JWT-SVID
    /// cache with half-lifetime staleness and single-flight refresh.
    ///
    /// # Errors
    ///
    /// See [`JwtSourceBuilder::build`].
    pub async fn build_cached(self) -> Result<CachedJwtSource, WorkloadApiError> {
        let clock = Arc::clone(&self.clock);
        let source = self.build().await?;
        Ok(CachedJwtSource::wrap(source, clock))
    }
}
