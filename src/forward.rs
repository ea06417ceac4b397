//! Tracing headers carried from an inbound request to outbound calls.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const FLOW_STARTER_HEADER: &str = "x-flow-starter";
/// Comma separated list of inbound header names to forward.
pub const FORWARDED_HEADER_NAMES: &str = "x-forwarded-header-names";

/// Bag of headers forwarded verbatim on every outbound request of a call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwardHeaders {
    headers: HeaderMap,
}

impl ForwardHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracts the headers an inbound request asked to be forwarded.
    ///
    /// Every header named in `x-forwarded-header-names` that carries a value
    /// is copied. `x-request-id` is always present in the result: taken from
    /// the inbound request, or freshly generated.
    pub fn from_inbound(inbound: &HeaderMap) -> Self {
        let mut headers = HeaderMap::new();

        let names = inbound
            .get(FORWARDED_HEADER_NAMES)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        for name in names.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if let Some(value) = inbound.get(&name).filter(|value| !value.is_empty()) {
                headers.insert(name, value.clone());
            }
        }

        let request_id = inbound
            .get(REQUEST_ID_HEADER)
            .filter(|value| !value.is_empty())
            .cloned()
            .unwrap_or_else(new_request_id);
        headers.insert(REQUEST_ID_HEADER, request_id);

        Self { headers }
    }

    /// Starts a new request flow: fresh request id, marked as flow starter.
    pub fn flow_starter() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, new_request_id());
        headers.insert(FLOW_STARTER_HEADER, HeaderValue::from_static("true"));
        Self { headers }
    }

    pub fn insert(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

fn new_request_id() -> HeaderValue {
    // hyphenated uuids are always valid header values
    HeaderValue::from_str(&Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static(""))
}
