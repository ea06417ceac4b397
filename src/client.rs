use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Url,
};
use tokio::{task::JoinHandle, time::sleep};

use crate::{
    mock::{MockReply, ORIGINAL_URL_HEADER},
    pool::{Pool, TransportSettings},
    response::decompress,
    retry::{parse_methods, AttemptOutcome, AttemptRequest},
    Body, ClientOptions, ContentType, MockRouter, RequestSpec, Response, RestError, Result,
    RetryLimiter, RetryPolicy, SimpleRetry,
};

/// Name of the pool that served the request.
pub const POOL_NAME_HEADER: &str = "x-rest-pool-name";
/// Request deadline in milliseconds, `0` when disabled.
pub const SOCKET_TIMEOUT_HEADER: &str = "x-socket-timeout";
/// Number of retries performed before this attempt.
pub const RETRY_HEADER: &str = "x-retry";

/// Bytes read from a discarded response before it is dropped.
const DRAIN_LIMIT: usize = 4096;
const MAX_REDIRECTS: usize = 10;

#[derive(Clone)]
/// Outbound HTTP client executing requests through a pooled transport with
/// retries, a shared retry budget and optional mock substitution.
///
/// Cloning is cheap; clones share the pool, retry policy, limiter and mock
/// router.
pub struct RestClient {
    options: ClientOptions,
    pool: Arc<Pool>,
    retry: Option<Arc<dyn RetryPolicy>>,
    limiter: Arc<RetryLimiter>,
    mock: Option<Arc<MockRouter>>,
    default_headers: HeaderMap,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("options", &self.options)
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .field("limiter", &self.limiter)
            .field("mock", &self.mock.is_some())
            .finish()
    }
}

impl RestClient {
    /// Creates a client with default options and the given base URL.
    ///
    /// The client gets its own pool named `pool_default` and its own retry
    /// budget; it does not retry until a policy is set with
    /// [`RestClient::with_retry`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use restpipe::RestClient;
    ///
    /// # async fn run() -> restpipe::Result<()> {
    /// let client = RestClient::new("http://orders.internal");
    /// let response = client.get("/orders/7").await?.error_for_status()?;
    /// println!("{}", response.text());
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        let options = ClientOptions {
            base_url: base_url.into(),
            ..ClientOptions::default()
        };
        Self {
            pool: Arc::new(own_pool(&options)),
            limiter: Arc::new(own_limiter(&options)),
            retry: None,
            mock: None,
            default_headers: HeaderMap::new(),
            options,
        }
    }

    /// Creates a client from configuration.
    ///
    /// Fails with [`RestError::Construction`] when the retry settings are
    /// invalid (negative values, unknown verbs).
    ///
    /// # Example
    ///
    /// ```no_run
    /// use restpipe::{ClientOptions, RestClient, RetryOptions};
    ///
    /// let client = RestClient::from_options(ClientOptions {
    ///     base_url: "http://orders.internal".to_owned(),
    ///     timeout_ms: 250,
    ///     retry: Some(RetryOptions {
    ///         max_retries: 2,
    ///         delay_ms: 50,
    ///         methods: Vec::new(),
    ///     }),
    ///     ..ClientOptions::default()
    /// })
    /// .expect("valid retry settings");
    /// ```
    pub fn from_options(options: ClientOptions) -> Result<Self> {
        let retry = match &options.retry {
            Some(retry) => {
                let policy = SimpleRetry::try_from_millis(retry.max_retries, retry.delay_ms)?
                    .methods(parse_methods(&retry.methods)?);
                Some(Arc::new(policy) as Arc<dyn RetryPolicy>)
            }
            None => None,
        };

        Ok(Self {
            pool: Arc::new(own_pool(&options)),
            limiter: Arc::new(own_limiter(&options)),
            retry,
            mock: None,
            default_headers: HeaderMap::new(),
            options,
        })
    }

    /// Shares `pool` (and its connections) with other clients.
    ///
    /// The pool's name replaces the one from
    /// [`ClientOptions::pool_name`] in `X-Rest-Pool-Name`.
    pub fn with_pool(mut self, pool: Arc<Pool>) -> Self {
        self.pool = pool;
        self
    }

    /// Retries failed attempts according to `policy`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::time::Duration;
    ///
    /// use restpipe::{RestClient, SimpleRetry};
    ///
    /// let client = RestClient::new("http://orders.internal")
    ///     .with_retry(SimpleRetry::new(3, Duration::from_millis(100)));
    /// ```
    pub fn with_retry<P: RetryPolicy + 'static>(self, policy: P) -> Self {
        self.with_retry_policy(Arc::new(policy))
    }

    /// Same as [`RestClient::with_retry`] for a policy already shared
    /// behind an `Arc`.
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Same client, retrying exactly `methods`. The current policy is left
    /// untouched for other clones. No-op without a policy.
    pub fn with_retry_methods(&self, methods: &[Method]) -> Self {
        let mut scoped = self.clone();
        scoped.retry = self.retry.as_ref().map(|policy| policy.with_methods(methods));
        scoped
    }

    /// Shares a retry budget with other clients.
    pub fn with_retry_limiter(mut self, limiter: Arc<RetryLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Routes every request to `router` instead of the network.
    pub fn with_mock(mut self, router: Arc<MockRouter>) -> Self {
        self.mock = Some(router);
        self
    }

    /// Header sent on every request unless the call sets it too.
    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Options the client was built from.
    pub fn config(&self) -> &ClientOptions {
        &self.options
    }

    /// Pool requests go through, shared or owned.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Retry budget consumed by this client's retries.
    pub fn limiter(&self) -> &Arc<RetryLimiter> {
        &self.limiter
    }

    /// `None` when the client never retries.
    pub fn retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.retry.as_ref()
    }

    /// Sends `GET base_url + url`.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute(RequestSpec::get(url)).await
    }

    /// Sends `HEAD base_url + url`.
    pub async fn head(&self, url: &str) -> Result<Response> {
        self.execute(RequestSpec::new(Method::HEAD, url)).await
    }

    /// Sends `OPTIONS base_url + url`.
    pub async fn options(&self, url: &str) -> Result<Response> {
        self.execute(RequestSpec::new(Method::OPTIONS, url)).await
    }

    /// Sends `DELETE base_url + url`.
    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.execute(RequestSpec::delete(url)).await
    }

    /// Sends `POST base_url + url` with `body` encoded per the configured
    /// content type.
    ///
    /// POST is not retried by default; see
    /// [`RestClient::with_retry_methods`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use restpipe::RestClient;
    /// use serde_json::json;
    ///
    /// # async fn run() -> restpipe::Result<()> {
    /// let client = RestClient::new("http://orders.internal");
    /// let created = client.post("/orders", json!({"id": "1"})).await?;
    /// assert!(created.is_success());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn post(&self, url: &str, body: impl Into<Body>) -> Result<Response> {
        self.execute(RequestSpec::post(url, body)).await
    }

    /// Sends `PUT base_url + url` with `body`.
    pub async fn put(&self, url: &str, body: impl Into<Body>) -> Result<Response> {
        self.execute(RequestSpec::put(url, body)).await
    }

    /// Sends `PATCH base_url + url` with `body`. Not retried by default.
    pub async fn patch(&self, url: &str, body: impl Into<Body>) -> Result<Response> {
        self.execute(RequestSpec::patch(url, body)).await
    }

    /// Runs one call: build, send, evaluate, retry or finalize.
    ///
    /// Any HTTP status is returned as `Ok`; use
    /// [`Response::error_for_status`] to reject 4xx/5xx. A failure on the
    /// wire that is not retried is returned as [`RestError::Transport`].
    pub async fn execute(&self, spec: RequestSpec) -> Result<Response> {
        let RequestSpec {
            method,
            url,
            body,
            headers: call_headers,
            forward,
            timeout,
        } = spec;

        let target = self.resolve_url(&url)?;
        let payload = body.encode(self.options.content_type)?;
        let timeout = timeout.or_else(|| self.options.request_timeout());

        let mut headers = self.default_headers.clone();
        headers.extend(call_headers);
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(POOL_NAME_HEADER, header_value(self.pool.name())?);
        headers.insert(
            SOCKET_TIMEOUT_HEADER,
            HeaderValue::from(timeout.map_or(0, |timeout| timeout.as_millis() as u64)),
        );
        for (name, value) in forward.headers() {
            headers.insert(name.clone(), value.clone());
        }
        self.apply_identity_headers(&mut headers, &body)?;

        let mut retries = 0usize;
        loop {
            #[cfg(feature = "tracing")]
            tracing::debug!(%method, url = %target, attempt = retries + 1, "sending request");

            let outcome = match self
                .send(&method, &target, &headers, payload.clone(), timeout)
                .await
            {
                Err(err) if !err.is_transport() => return Err(err),
                outcome => outcome,
            };

            let Some(policy) = &self.retry else {
                return self.finalize(outcome, retries).await;
            };
            let decision = {
                let request = AttemptRequest {
                    method: &method,
                    url: &target,
                    headers: &headers,
                };
                let attempt = match &outcome {
                    Ok(sent) => AttemptOutcome::Status(sent.exchange.status()),
                    Err(err) => AttemptOutcome::Error(err),
                };
                policy.should_retry(&request, attempt, retries)
            };
            if !decision.retry {
                return self.finalize(outcome, retries).await;
            }

            if let Err(_err) = self.limiter.admit(1) {
                #[cfg(feature = "tracing")]
                tracing::warn!(%method, url = %target, retries, "retry budget exhausted: {_err}");
                return self.finalize(outcome, retries).await;
            }

            if let Ok(sent) = outcome {
                sent.exchange.drain().await;
            }
            self.wait_before_retry(decision.delay).await;
            retries += 1;
            headers.insert(RETRY_HEADER, HeaderValue::from(retries));
        }
    }

    /// Runs the call on a spawned task.
    ///
    /// A panic inside the task is caught at the task boundary and reported
    /// as [`RestError::Background`] when the handle is awaited.
    pub fn spawn(&self, spec: RequestSpec) -> PendingResponse {
        let client = self.clone();
        PendingResponse {
            handle: tokio::spawn(async move { client.execute(spec).await }),
        }
    }

    /// Runs the call on a spawned task and hands the result to `callback`.
    ///
    /// Panics in the call or in the callback are logged and never reach the
    /// caller; the returned handle always completes normally.
    pub fn spawn_with<F>(&self, spec: RequestSpec, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            let call = tokio::spawn(async move { callback(client.execute(spec).await) });
            if let Err(_err) = call.await {
                #[cfg(feature = "tracing")]
                tracing::error!("spawned call failed: {_err}");
            }
        })
    }

    fn resolve_url(&self, url: &str) -> Result<Url> {
        let raw = format!("{}{}", self.options.base_url, url);
        Url::parse(&raw).map_err(|err| RestError::Construction(format!("invalid url '{raw}': {err}")))
    }

    /// Basic auth, user agent and content negotiation headers. These
    /// override anything set before them.
    fn apply_identity_headers(&self, headers: &mut HeaderMap, body: &Body) -> Result<()> {
        if let Some(auth) = &self.options.basic_auth {
            let credentials = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
            let mut value = header_value(&format!("Basic {credentials}"))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        headers.insert(header::USER_AGENT, header_value(self.options.user_agent())?);

        match self.options.content_type {
            ContentType::Json | ContentType::Xml => {
                if let Some(mime) = self.options.content_type.mime() {
                    headers.insert(header::ACCEPT, HeaderValue::from_static(mime));
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
                }
            }
            ContentType::Multipart => {
                if let Some(boundary) = body.boundary() {
                    headers.insert(
                        header::CONTENT_TYPE,
                        header_value(&format!("multipart/form-data; boundary={boundary}"))?,
                    );
                }
            }
            ContentType::Bytes => {}
        }
        Ok(())
    }

    /// One attempt: a single exchange, plus the redirect hops it triggers.
    async fn send(
        &self,
        method: &Method,
        target: &Url,
        headers: &HeaderMap,
        payload: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Sent> {
        let mut method = method.clone();
        let mut url = target.clone();
        let mut payload = payload;
        let mut headers = headers.clone();

        for _ in 0..=MAX_REDIRECTS {
            let exchange = self
                .dispatch(&method, &url, &headers, payload.clone(), timeout)
                .await?;

            let Some(location) = exchange.redirect_location() else {
                return Ok(Sent { exchange, url });
            };
            let status = exchange.status();
            if !self.options.follow_redirect {
                exchange.drain().await;
                return Err(RestError::RedirectBlocked {
                    status: status.as_u16(),
                    location,
                });
            }

            let next = url.join(&location).map_err(|err| {
                RestError::Construction(format!("invalid redirect location '{location}': {err}"))
            })?;
            if switches_to_get(status, &method) {
                method = Method::GET;
                payload = None;
                headers.remove(header::CONTENT_TYPE);
            }
            exchange.drain().await;

            #[cfg(feature = "tracing")]
            tracing::debug!(from = %url, to = %next, status = status.as_u16(), "following redirect");
            url = next;
        }

        Err(RestError::TooManyRedirects(MAX_REDIRECTS))
    }

    async fn dispatch(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        payload: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Exchange> {
        if let Some(router) = &self.mock {
            let endpoint = router.rewrite(url)?;
            let mut headers = headers.clone();
            headers.insert(ORIGINAL_URL_HEADER, header_value(url.as_str())?);
            let reply = router.serve(
                method,
                endpoint.as_str(),
                &headers,
                payload.as_deref().unwrap_or_default(),
            );
            return Ok(Exchange::Mock(reply));
        }

        let transport = self
            .pool
            .transport(TransportSettings {
                connect_timeout: self.options.connect_timeout(),
            })
            .await?;

        let mut request = transport
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(payload) = payload {
            request = request.body(payload);
        }

        request
            .send()
            .await
            .map(Exchange::Network)
            .map_err(RestError::Transport)
    }

    async fn finalize(&self, outcome: Result<Sent>, retries: usize) -> Result<Response> {
        let Sent { exchange, url } = outcome?;
        let (status, headers, body) = exchange.into_parts().await?;
        let body = if self.options.uncompress_response {
            decompress(&headers, body)?
        } else {
            body
        };
        Ok(Response::new(status, headers, body, url, retries + 1))
    }

    async fn wait_before_retry(&self, delay: Duration) {
        #[cfg(feature = "tracing")]
        tracing::debug!("retrying request after {} ms", delay.as_millis());

        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

/// Handle on a call started with [`RestClient::spawn`]. Await it for the
/// result.
#[derive(Debug)]
pub struct PendingResponse {
    handle: JoinHandle<Result<Response>>,
}

impl PendingResponse {
    /// `true` once the spawned call completed, failed or was aborted.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the call; awaiting afterwards yields [`RestError::Background`].
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Future for PendingResponse {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::error!("spawned call failed: {err}");
                Err(RestError::Background(err.to_string()))
            }
        })
    }
}

struct Sent {
    exchange: Exchange,
    url: Url,
}

enum Exchange {
    Network(reqwest::Response),
    Mock(MockReply),
}

impl Exchange {
    fn status(&self) -> StatusCode {
        match self {
            Self::Network(response) => response.status(),
            Self::Mock(reply) => reply.status,
        }
    }

    fn headers(&self) -> &HeaderMap {
        match self {
            Self::Network(response) => response.headers(),
            Self::Mock(reply) => &reply.headers,
        }
    }

    fn redirect_location(&self) -> Option<String> {
        let status = self.status();
        let is_redirect = matches!(
            status,
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        );
        if !is_redirect {
            return None;
        }
        self.headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    /// Reads and drops a bounded prefix of the body so the connection can
    /// return to the pool.
    async fn drain(self) {
        if let Self::Network(mut response) = self {
            let mut read = 0;
            while read < DRAIN_LIMIT {
                match response.chunk().await {
                    Ok(Some(chunk)) => read += chunk.len(),
                    _ => break,
                }
            }
        }
    }

    async fn into_parts(self) -> Result<(StatusCode, HeaderMap, Bytes)> {
        match self {
            Self::Network(mut response) => {
                let status = response.status();
                let headers = std::mem::take(response.headers_mut());
                let body = response.bytes().await.map_err(RestError::Transport)?;
                Ok((status, headers, body))
            }
            Self::Mock(reply) => Ok((reply.status, reply.headers, reply.body)),
        }
    }
}

fn switches_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => *method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
            *method != Method::GET && *method != Method::HEAD
        }
        _ => false,
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| RestError::Construction(format!("invalid header value '{value}': {err}")))
}

fn own_pool(options: &ClientOptions) -> Pool {
    let name = options
        .pool_name
        .as_deref()
        .unwrap_or(crate::pool::DEFAULT_POOL_NAME);
    let pool = Pool::new(name).with_max_idle_per_host(options.max_idle_per_host);
    match &options.proxy {
        Some(proxy) => pool.with_proxy(proxy.clone()),
        None => pool,
    }
}

fn own_limiter(options: &ClientOptions) -> RetryLimiter {
    RetryLimiter::new(
        options.retry_budget.rate,
        Duration::from_millis(options.retry_budget.period_ms),
    )
}
