use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method,
};

use crate::{Body, ForwardHeaders};

/// One outgoing call: verb, URL relative to the client's base URL, body and
/// per-call options. Consumed by [`RestClient::execute`](crate::RestClient::execute).
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) body: Body,
    pub(crate) headers: HeaderMap,
    pub(crate) forward: ForwardHeaders,
    pub(crate) timeout: Option<Duration>,
}

impl RequestSpec {
    /// Request for `method` on `url`, with no body and no extra headers.
    ///
    /// `url` is appended verbatim to the client's base URL, query string
    /// included.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::time::Duration;
    ///
    /// use reqwest::Method;
    /// use restpipe::RequestSpec;
    ///
    /// let spec = RequestSpec::new(Method::HEAD, "/orders?status=open")
    ///     .timeout(Duration::from_secs(2));
    /// ```
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: Body::empty(),
            headers: HeaderMap::new(),
            forward: ForwardHeaders::default(),
            timeout: None,
        }
    }

    /// `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// `POST` request carrying `body`.
    pub fn post(url: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// `PUT` request carrying `body`.
    pub fn put(url: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::PUT, url).body(body)
    }

    /// `PATCH` request carrying `body`.
    pub fn patch(url: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::PATCH, url).body(body)
    }

    /// `DELETE` request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Replaces the body. It is encoded only when the request is executed.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Adds a per-call header. Headers set later in the pipeline
    /// (keep-alive, pool markers, tracing, auth, user agent, content type)
    /// override it.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Merges `headers` into the per-call headers, replacing values of
    /// headers already set.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Tracing headers of the inbound call this request belongs to.
    pub fn forward(mut self, forward: ForwardHeaders) -> Self {
        self.forward = forward;
        self
    }

    /// Overrides the client's request deadline for this call only.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// HTTP verb.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// URL relative to the client's base URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}
