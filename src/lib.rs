//! `restpipe` is an outbound HTTP execution engine for service-to-service
//! calls.
//!
//! A [`RestClient`] runs every request through the same pipeline:
//! - headers are assembled (defaults, per-call, pool markers, forwarded
//!   tracing headers, auth, user agent, content negotiation)
//! - the request is sent through a shared [`Pool`], or answered by a
//!   [`MockRouter`] in tests
//! - failures are retried by a [`RetryPolicy`] within the budget of a
//!   [`RetryLimiter`]
//! - the final body is read, optionally inflated, and wrapped in a
//!   [`Response`] that can be deserialized with [`Response::fill_up`]

mod body;
mod client;
mod error;
mod forward;
mod limiter;
mod mock;
mod options;
mod pool;
mod request;
mod response;
mod retry;

pub use body::{Body, ContentType, Multipart};
pub use client::{
    PendingResponse, RestClient, POOL_NAME_HEADER, RETRY_HEADER, SOCKET_TIMEOUT_HEADER,
};
pub use error::{CallCountMismatch, RestError};
pub use forward::{ForwardHeaders, FLOW_STARTER_HEADER, FORWARDED_HEADER_NAMES, REQUEST_ID_HEADER};
pub use limiter::{RetryLimiter, DEFAULT_RETRY_PERIOD, DEFAULT_RETRY_RATE};
pub use mock::{
    Mock, MockHandle, MockMatch, MockReply, MockRouter, DEFAULT_MOCK_ENDPOINT,
    MOCK_BODY_MISMATCH, MOCK_HEADERS_MISMATCH, MOCK_NOT_FOUND, ORIGINAL_URL_HEADER,
};
pub use options::{
    BasicAuth, ClientOptions, RetryBudgetOptions, RetryOptions, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_TIMEOUT_MS, DEFAULT_USER_AGENT,
};
pub use pool::{Pool, DEFAULT_MAX_IDLE_PER_HOST, DEFAULT_POOL_NAME};
pub use request::RequestSpec;
pub use response::Response;
pub use retry::{
    AttemptOutcome, AttemptRequest, RetryDecision, RetryPolicy, SimpleRetry,
    DEFAULT_RETRY_METHODS,
};

pub type Result<T> = std::result::Result<T, RestError>;
