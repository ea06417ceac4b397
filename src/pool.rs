//! Lazily-built, shareable connection pools.
//!
//! A [`Pool`] owns one `reqwest::Client` (and therefore one set of pooled
//! connections). The client is built on first use, exactly once; callers
//! that race on first use wait for the winner instead of building their own.
//! Several [`RestClient`](crate::RestClient)s can point at the same pool to
//! reuse connections towards a downstream tier.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use reqwest::redirect;
use tokio::sync::OnceCell;

use crate::{RestError, Result};

pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 2;
pub const DEFAULT_POOL_NAME: &str = "pool_default";

/// Settings of the client that triggers transport construction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TransportSettings {
    /// `None` disables the dial deadline.
    pub connect_timeout: Option<Duration>,
}

/// Builder the transport is made from.
enum Preset {
    Default,
    Custom(reqwest::ClientBuilder),
    /// The caller's builder failed to build. `build` consumes it, so the
    /// failure is replayed instead of falling back to the defaults.
    Failed(String),
}

/// Named holder of one shared transport.
///
/// Wrap it in an `Arc` and hand it to several clients with
/// [`RestClient::with_pool`](crate::RestClient::with_pool) to share
/// connections between them.
pub struct Pool {
    name: String,
    max_idle_per_host: usize,
    proxy: Option<String>,
    preset: Mutex<Preset>,
    transport: OnceCell<reqwest::Client>,
    builds: AtomicUsize,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("max_idle_per_host", &self.max_idle_per_host)
            .field("proxy", &self.proxy)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_NAME)
    }
}

impl Pool {
    /// Creates an unbuilt pool reporting `name` in `X-Rest-Pool-Name`.
    ///
    /// Nothing is allocated until the first request goes through it.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use restpipe::{Pool, RestClient};
    ///
    /// let pool = Arc::new(Pool::new("pool_billing").with_max_idle_per_host(8));
    /// let invoices = RestClient::new("http://billing.internal").with_pool(Arc::clone(&pool));
    /// let payments = RestClient::new("http://billing.internal").with_pool(pool);
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            proxy: None,
            preset: Mutex::new(Preset::Default),
            transport: OnceCell::new(),
            builds: AtomicUsize::new(0),
        }
    }

    /// Caps idle keep-alive connections per host.
    pub fn with_max_idle_per_host(mut self, max_idle: usize) -> Self {
        self.max_idle_per_host = max_idle;
        self
    }

    /// Routes every request of this pool through `proxy`. An unparsable
    /// proxy URL is ignored and the environment proxy settings apply.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Uses a caller-tuned builder for the transport.
    ///
    /// Only the dial timeout is adjusted on it when the transport is
    /// materialised; redirects are always disabled at the transport level
    /// because the request loop handles them. Idle-per-host and proxy
    /// settings of the pool are not applied to it.
    ///
    /// If the builder fails to build, every request through this pool fails
    /// with [`RestError::Construction`]; the pool never falls back to a
    /// default transport.
    pub fn with_transport(self, builder: reqwest::ClientBuilder) -> Self {
        *self.preset.lock().unwrap_or_else(PoisonError::into_inner) = Preset::Custom(builder);
        self
    }

    /// Name sent in `X-Rest-Pool-Name`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Idle keep-alive connections kept per host by the default transport.
    pub fn max_idle_per_host(&self) -> usize {
        self.max_idle_per_host
    }

    /// Proxy URL as configured, even when it was ignored for being invalid.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// `true` once a transport was successfully built.
    pub fn is_initialized(&self) -> bool {
        self.transport.initialized()
    }

    /// Number of times a transport was built. Stays at one for the pool's
    /// whole lifetime once a request went through.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Returns the shared transport, building it on first use.
    pub(crate) async fn transport(&self, settings: TransportSettings) -> Result<&reqwest::Client> {
        self.transport
            .get_or_try_init(|| async { self.build(settings) })
            .await
    }

    fn build(&self, settings: TransportSettings) -> Result<reqwest::Client> {
        let mut preset = self.preset.lock().unwrap_or_else(PoisonError::into_inner);

        let (mut builder, custom) = match std::mem::replace(&mut *preset, Preset::Default) {
            Preset::Default => (self.default_builder(), false),
            Preset::Custom(builder) => (builder, true),
            Preset::Failed(message) => {
                *preset = Preset::Failed(message.clone());
                return Err(RestError::Construction(message));
            }
        };
        if let Some(timeout) = settings.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        let client = match builder.redirect(redirect::Policy::none()).build() {
            Ok(client) => client,
            Err(err) => {
                let message = format!("pool '{}': transport cannot be built: {err}", self.name);
                if custom {
                    *preset = Preset::Failed(message.clone());
                }

                #[cfg(feature = "tracing")]
                tracing::error!(pool = %self.name, "{message}");

                return Err(RestError::Construction(message));
            }
        };

        self.builds.fetch_add(1, Ordering::SeqCst);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            pool = %self.name,
            max_idle_per_host = self.max_idle_per_host,
            "transport initialised"
        );

        Ok(client)
    }

    fn default_builder(&self) -> reqwest::ClientBuilder {
        let mut builder =
            reqwest::Client::builder().pool_max_idle_per_host(self.max_idle_per_host);

        if let Some(proxy) = self.proxy.as_deref() {
            match reqwest::Proxy::all(proxy) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(pool = %self.name, proxy, "ignoring invalid proxy url: {_err}");
                }
            }
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{Pool, TransportSettings, DEFAULT_MAX_IDLE_PER_HOST};
    use crate::RestError;

    fn settings() -> TransportSettings {
        TransportSettings {
            connect_timeout: Some(Duration::from_millis(1500)),
        }
    }

    #[test]
    fn defaults() {
        let pool = Pool::default();
        assert_eq!(pool.name(), "pool_default");
        assert_eq!(pool.max_idle_per_host(), DEFAULT_MAX_IDLE_PER_HOST);
        assert!(!pool.is_initialized());
        assert_eq!(pool.build_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_first_use_builds_once() {
        let pool = Arc::new(Pool::new("pool_orders").with_max_idle_per_host(8));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    pool.transport(settings()).await.map(|_| ())
                })
            })
            .collect();
        for task in tasks {
            task.await
                .expect("task must not panic")
                .expect("transport must build");
        }

        assert!(pool.is_initialized());
        assert_eq!(pool.build_count(), 1);
    }

    #[tokio::test]
    async fn preset_builder_is_consumed_once() {
        let pool = Pool::new("pool_custom")
            .with_transport(reqwest::Client::builder().user_agent("preset/1.0"));

        pool.transport(settings()).await.expect("first build");
        pool.transport(TransportSettings {
            connect_timeout: None,
        })
        .await
        .expect("cached transport");

        assert_eq!(pool.build_count(), 1);
    }

    #[tokio::test]
    async fn failed_preset_never_falls_back_to_defaults() {
        let pool = Pool::new("pool_tls").with_transport(
            reqwest::Client::builder().max_tls_version(reqwest::tls::Version::TLS_1_0),
        );

        let first = pool.transport(settings()).await.map(|_| ());
        assert!(
            matches!(first, Err(RestError::Construction(_))),
            "unexpected first build: {first:?}"
        );
        let second = pool.transport(settings()).await.map(|_| ());
        assert!(
            matches!(second, Err(RestError::Construction(_))),
            "unexpected second build: {second:?}"
        );

        assert!(!pool.is_initialized());
        assert_eq!(pool.build_count(), 0);
    }

    #[tokio::test]
    async fn invalid_proxy_is_ignored() {
        let pool = Pool::new("pool_proxy").with_proxy("::not a url::");
        pool.transport(settings())
            .await
            .expect("invalid proxy falls back to environment settings");
        assert_eq!(pool.proxy(), Some("::not a url::"));
    }
}
