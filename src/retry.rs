//! Pluggable retry decisions.
//!
//! The request loop asks a [`RetryPolicy`] after every attempt whether the
//! attempt should be repeated and how long to wait first. [`SimpleRetry`] is
//! the stock implementation: fixed delay, bounded retry count, idempotent
//! verbs only.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use reqwest::{header::HeaderMap, Method, StatusCode, Url};

use crate::{RestError, Result};

/// Verbs retried when a policy is built without an explicit allow-list.
pub const DEFAULT_RETRY_METHODS: [Method; 5] = [
    Method::GET,
    Method::HEAD,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

/// Outgoing request as seen by a retry policy.
#[derive(Clone, Copy, Debug)]
pub struct AttemptRequest<'a> {
    pub method: &'a Method,
    pub url: &'a Url,
    pub headers: &'a HeaderMap,
}

/// Result of one attempt as seen by a retry policy.
#[derive(Clone, Copy, Debug)]
pub enum AttemptOutcome<'a> {
    /// The server answered with this status.
    Status(StatusCode),
    /// The attempt failed before a response arrived.
    Error(&'a RestError),
}

/// Answer of [`RetryPolicy::should_retry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    pub fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Strategy deciding whether a finished attempt is repeated.
pub trait RetryPolicy: fmt::Debug + Send + Sync {
    /// `attempts` is the number of retries already performed for this call
    /// (zero after the first attempt).
    fn should_retry(
        &self,
        request: &AttemptRequest<'_>,
        outcome: AttemptOutcome<'_>,
        attempts: usize,
    ) -> RetryDecision;

    /// Returns a copy of this policy allowing exactly `methods`; an empty
    /// slice restores the default allow-list. `self` is not modified.
    fn with_methods(&self, methods: &[Method]) -> Arc<dyn RetryPolicy>;

    /// Key/value description for diagnostics.
    fn params(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::new()
    }
}

/// Fixed-delay policy retrying transport errors and 5xx responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleRetry {
    max_retries: usize,
    delay: Duration,
    methods: Vec<Method>,
}

impl SimpleRetry {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            methods: DEFAULT_RETRY_METHODS.to_vec(),
        }
    }

    /// Builds a policy from signed settings, as found in config files.
    ///
    /// Negative `max_retries` or `delay_ms` are configuration errors.
    pub fn try_from_millis(max_retries: i64, delay_ms: i64) -> Result<Self> {
        if max_retries < 0 || delay_ms < 0 {
            return Err(RestError::Construction(format!(
                "invalid retry policy: max_retries={max_retries}, delay_ms={delay_ms}"
            )));
        }
        let max_retries = usize::try_from(max_retries).map_err(|err| {
            RestError::Construction(format!("invalid retry policy: max_retries: {err}"))
        })?;
        Ok(Self::new(
            max_retries,
            Duration::from_millis(delay_ms.unsigned_abs()),
        ))
    }

    /// Replaces the allowed verb set. An empty iterator keeps the defaults.
    pub fn methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        let methods: Vec<Method> = methods.into_iter().collect();
        self.methods = if methods.is_empty() {
            DEFAULT_RETRY_METHODS.to_vec()
        } else {
            methods
        };
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn allowed_methods(&self) -> &[Method] {
        &self.methods
    }

    fn is_method_allowed(&self, method: &Method) -> bool {
        self.methods.iter().any(|allowed| allowed == method)
    }
}

impl RetryPolicy for SimpleRetry {
    fn should_retry(
        &self,
        request: &AttemptRequest<'_>,
        outcome: AttemptOutcome<'_>,
        attempts: usize,
    ) -> RetryDecision {
        let failed = match outcome {
            AttemptOutcome::Status(status) => status.is_server_error(),
            AttemptOutcome::Error(err) => err.is_transport(),
        };

        if attempts < self.max_retries && failed && self.is_method_allowed(request.method) {
            RetryDecision::retry_after(self.delay)
        } else {
            RetryDecision::stop()
        }
    }

    fn with_methods(&self, methods: &[Method]) -> Arc<dyn RetryPolicy> {
        Arc::new(self.clone().methods(methods.iter().cloned()))
    }

    fn params(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("max_retries", self.max_retries.to_string()),
            ("delay", self.delay.as_millis().to_string()),
        ])
    }
}

/// Parses verb names from configuration.
pub(crate) fn parse_methods(names: &[String]) -> Result<Vec<Method>> {
    names
        .iter()
        .map(|name| {
            Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes()).map_err(|err| {
                RestError::Construction(format!("invalid retry method '{name}': {err}"))
            })
        })
        .collect()
}
