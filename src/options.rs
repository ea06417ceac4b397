use std::{fmt, time::Duration};

use serde::Deserialize;

use crate::{
    limiter::{DEFAULT_RETRY_PERIOD, DEFAULT_RETRY_RATE},
    pool::DEFAULT_MAX_IDLE_PER_HOST,
    ContentType, RestError, Result,
};

pub const DEFAULT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_USER_AGENT: &str = concat!("restpipe/", env!("CARGO_PKG_VERSION"));

/// Configures a [`RestClient`](crate::RestClient).
///
/// Every field is optional when deserialized; missing fields take the
/// defaults below.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Prefix prepended verbatim to every request URL.
    pub base_url: String,
    /// Whole-request deadline in milliseconds. `0` means the default.
    pub timeout_ms: u64,
    /// Dial deadline in milliseconds. `0` means the default.
    pub connect_timeout_ms: u64,
    /// Disables both deadlines; a silent server then blocks the call forever.
    pub disable_timeout: bool,
    /// Idle connections kept per host by the client's own pool.
    pub max_idle_per_host: usize,
    /// Proxy for the client's own pool.
    pub proxy: Option<String>,
    /// Name reported in `X-Rest-Pool-Name` for the client's own pool.
    pub pool_name: Option<String>,
    /// Body encoding and `Accept`/`Content-Type` headers.
    pub content_type: ContentType,
    /// Follow 3xx responses instead of failing with `RedirectBlocked`.
    pub follow_redirect: bool,
    /// Inflate gzip-encoded response bodies.
    pub uncompress_response: bool,
    pub user_agent: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    /// No retries when absent.
    pub retry: Option<RetryOptions>,
    /// Budget shared by all retries of the client's own limiter.
    pub retry_budget: RetryBudgetOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disable_timeout: false,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            proxy: None,
            pool_name: None,
            content_type: ContentType::Json,
            follow_redirect: false,
            uncompress_response: false,
            user_agent: None,
            basic_auth: None,
            retry: None,
            retry_budget: RetryBudgetOptions::default(),
        }
    }
}

impl ClientOptions {
    /// Reads options from `RESTPIPE_*` environment variables.
    ///
    /// Recognised: `RESTPIPE_BASE_URL`, `RESTPIPE_TIMEOUT_MS`,
    /// `RESTPIPE_CONNECT_TIMEOUT_MS`, `RESTPIPE_DISABLE_TIMEOUT`,
    /// `RESTPIPE_USER_AGENT`, `RESTPIPE_MAX_RETRIES`, `RESTPIPE_RETRY_DELAY_MS`.
    /// Unset variables keep their defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>>
        where
            T::Err: fmt::Display,
        {
            value
                .map(|raw| {
                    raw.trim().parse::<T>().map_err(|err| {
                        RestError::Construction(format!("invalid {key} '{raw}': {err}"))
                    })
                })
                .transpose()
        }

        let mut options = Self::default();
        if let Some(base_url) = lookup("RESTPIPE_BASE_URL") {
            options.base_url = base_url;
        }
        if let Some(timeout) = parse("RESTPIPE_TIMEOUT_MS", lookup("RESTPIPE_TIMEOUT_MS"))? {
            options.timeout_ms = timeout;
        }
        if let Some(timeout) = parse(
            "RESTPIPE_CONNECT_TIMEOUT_MS",
            lookup("RESTPIPE_CONNECT_TIMEOUT_MS"),
        )? {
            options.connect_timeout_ms = timeout;
        }
        if let Some(disable) = parse(
            "RESTPIPE_DISABLE_TIMEOUT",
            lookup("RESTPIPE_DISABLE_TIMEOUT"),
        )? {
            options.disable_timeout = disable;
        }
        options.user_agent = lookup("RESTPIPE_USER_AGENT").or(options.user_agent);

        let max_retries = parse("RESTPIPE_MAX_RETRIES", lookup("RESTPIPE_MAX_RETRIES"))?;
        let delay_ms = parse("RESTPIPE_RETRY_DELAY_MS", lookup("RESTPIPE_RETRY_DELAY_MS"))?;
        if max_retries.is_some() || delay_ms.is_some() {
            options.retry = Some(RetryOptions {
                max_retries: max_retries.unwrap_or_default(),
                delay_ms: delay_ms.unwrap_or_default(),
                methods: Vec::new(),
            });
        }
        Ok(options)
    }

    /// Effective request deadline; `None` when timeouts are disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        match (self.disable_timeout, self.timeout_ms) {
            (true, _) => None,
            (false, 0) => Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            (false, millis) => Some(Duration::from_millis(millis)),
        }
    }

    /// Effective dial deadline; `None` when timeouts are disabled.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match (self.disable_timeout, self.connect_timeout_ms) {
            (true, _) => None,
            (false, 0) => Some(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)),
            (false, millis) => Some(Duration::from_millis(millis)),
        }
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }
}

/// Credentials sent as `Authorization: Basic ...`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Retry settings as written in configuration. Signed so that invalid
/// negative values can be reported instead of silently wrapping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_retries: i64,
    pub delay_ms: i64,
    /// Verbs allowed to retry; empty means GET, HEAD, PUT, DELETE, OPTIONS.
    pub methods: Vec<String>,
}

/// Size of the retry budget: `rate` retries per `period_ms`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryBudgetOptions {
    pub rate: u64,
    pub period_ms: u64,
}

impl Default for RetryBudgetOptions {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RETRY_RATE,
            period_ms: DEFAULT_RETRY_PERIOD.as_millis() as u64,
        }
    }
}
