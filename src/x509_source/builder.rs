use std::fmt;
use std::time::Duration;

use crate::address::Address;
use crate::retry::BackoffPolicy;
use crate::source::{client_factory_for, init_timeout_from_env, ClientFactory};
use crate::workload_api::error::WorkloadApiError;
use crate::x509_source::{SvidPicker, X509Source};

/// Builder for [`X509Source`].
///
/// All settings have working defaults: the endpoint comes from
/// `SPIFFE_ENDPOINT_SOCKET`, reconnects use the default [`BackoffPolicy`]
/// (one second doubling to sixty, unlimited retries), and the init timeout
/// is read from `SPIFFE_SOURCE_INIT_TIMEOUT` when set.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use workload_identity::{BackoffPolicy, X509Source};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let source = X509Source::builder()
///     .address("unix:///tmp/spire-agent/public/api.sock".parse()?)
///     .backoff(BackoffPolicy::new().with_max_delay(Duration::from_secs(30)))
///     .init_timeout(Some(Duration::from_secs(15)))
///     .build()
///     .await?;
/// # drop(source);
/// # Ok(())
/// # }
/// ```
pub struct X509SourceBuilder {
    address: Option<Address>,
    make_client: Option<ClientFactory>,
    picker: Option<Box<dyn SvidPicker>>,
    backoff: BackoffPolicy,
    init_timeout: Option<Duration>,
}

impl fmt::Debug for X509SourceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509SourceBuilder")
            .field("address", &self.address)
            .field(
                "make_client",
                &self.make_client.as_ref().map(|_| "<ClientFactory>"),
            )
            .field("picker", &self.picker.as_ref().map(|_| "<SvidPicker>"))
            .field("backoff", &self.backoff)
            .field("init_timeout", &self.init_timeout)
            .finish()
    }
}

impl Default for X509SourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl X509SourceBuilder {
    /// Creates a builder with the defaults described on the type.
    #[must_use]
    pub fn new() -> Self {
        Self {
            address: None,
            make_client: None,
            picker: None,
            backoff: BackoffPolicy::new(),
            init_timeout: init_timeout_from_env(),
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
    /// [`X509SourceBuilder::address`].
    #[must_use]
    pub fn client_factory(mut self, factory: ClientFactory) -> Self {
        self.make_client = Some(factory);
        self
    }

    /// Installs a custom SVID selection strategy.
    #[must_use]
    pub fn picker<P>(mut self, picker: P) -> Self
    where
        P: SvidPicker,
    {
        self.picker = Some(Box::new(picker));
        self
    }

    /// Sets the reconnect backoff policy for the background watch.
    #[must_use]
    pub const fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bounds how long [`X509SourceBuilder::build`] waits for the first
    /// context. `None` waits indefinitely.
    #[must_use]
    pub const fn init_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Builds the source: starts the background watch and waits for the
    /// initial X.509 context.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkloadApiError`] when the watch fails terminally before
    /// the first context arrives, or [`WorkloadApiError::InitTimeout`] when
    /// the init timeout elapses first. The partially built source is closed
    /// before the error propagates.
    pub async fn build(self) -> Result<X509Source, WorkloadApiError> {
        let make_client = self
            .make_client
            .unwrap_or_else(|| client_factory_for(self.address));
        X509Source::build_with(make_client, self.picker, self.backoff, self.init_timeout).await
    }
}
