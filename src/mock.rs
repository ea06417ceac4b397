//! In-memory substitute for the network boundary.
//!
//! A [`MockRouter`] is created per test run and injected into a
//! [`RestClient`](crate::RestClient) with
//! [`RestClient::with_mock`](crate::RestClient::with_mock). Requests issued
//! by that client never leave the process: their URL is rewritten to the
//! router's endpoint, the original URL travels in `X-Original-URL`, and the
//! router answers from its registered [`Mock`]s.
//!
//! Matching is insensitive to query parameter order and to whitespace in
//! request bodies.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Url,
};

use crate::{error::CallCountMismatch, RestError, Result};

/// Header carrying the intended URL of a request rewritten to the mock
/// endpoint.
pub const ORIGINAL_URL_HEADER: &str = "x-original-url";
pub const DEFAULT_MOCK_ENDPOINT: &str = "http://mockup.local";

pub const MOCK_NOT_FOUND: &str = "MockUp nil!";
pub const MOCK_BODY_MISMATCH: &str = "MockUp body does not match!";
pub const MOCK_HEADERS_MISMATCH: &str = "MockUp headers do not match!";

/// Expected request and canned reply.
#[derive(Clone, Debug)]
pub struct Mock {
    method: Method,
    url: String,
    request_headers: HeaderMap,
    request_body: Option<String>,
    status: StatusCode,
    response_headers: HeaderMap,
    response_body: Bytes,
    expected_calls: Option<usize>,
}

impl Mock {
    /// Expects `method` on the absolute `url`; replies `200` with an empty
    /// body until [`Mock::respond`] is called.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            request_headers: HeaderMap::new(),
            request_body: None,
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            response_body: Bytes::new(),
            expected_calls: None,
        }
    }

    /// Only matches requests carrying this body (whitespace-insensitive).
    /// Without it the mock matches any body; `with_body("")` only matches
    /// requests without one.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.request_body = Some(body.into());
        self
    }

    /// Requires the request to carry this header with this value.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.request_headers.insert(name, value);
        self
    }

    pub fn respond(mut self, status: StatusCode, body: impl Into<Bytes>) -> Self {
        self.status = status;
        self.response_body = body.into();
        self
    }

    pub fn respond_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.response_headers.append(name, value);
        self
    }

    /// Declares how many times the mock must be hit; checked by
    /// [`MockRouter::verify_call_counts`]. Mocks without it are exempt.
    pub fn times(mut self, calls: usize) -> Self {
        self.expected_calls = Some(calls);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug)]
struct Entry {
    mock: Mock,
    normalized_url: String,
    calls: AtomicUsize,
}

/// Handle on a registered mock.
#[derive(Clone, Debug)]
pub struct MockHandle {
    entry: Arc<Entry>,
}

impl MockHandle {
    /// Number of requests this mock answered since registration.
    pub fn calls(&self) -> usize {
        self.entry.calls.load(Ordering::SeqCst)
    }

    pub fn mock(&self) -> &Mock {
        &self.entry.mock
    }
}

/// Canned reply produced by the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl MockReply {
    fn sentinel(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            body: Bytes::from_static(message.as_bytes()),
        }
    }
}

/// Outcome of [`MockRouter::dispatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockMatch {
    Matched(MockReply),
    NotFound,
    BodyMismatch,
    HeaderMismatch,
}

enum Lookup {
    Found(Arc<Entry>),
    OtherBody,
    Missing,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MockKey {
    method: Method,
    url: String,
    /// `None` for mocks accepting any body.
    body: Option<String>,
}

/// Registry of mocks keyed by normalized (method, URL, body).
pub struct MockRouter {
    endpoint: String,
    mocks: RwLock<HashMap<MockKey, Arc<Entry>>>,
}

impl fmt::Debug for MockRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockRouter")
            .field("endpoint", &self.endpoint)
            .field("mocks", &self.len())
            .finish()
    }
}

impl Default for MockRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRouter {
    pub fn new() -> Self {
        Self {
            endpoint: DEFAULT_MOCK_ENDPOINT.to_owned(),
            mocks: RwLock::new(HashMap::new()),
        }
    }

    /// Uses the scheme and authority of `endpoint` for rewritten requests.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint)
            .map_err(|err| RestError::Mock(format!("invalid mock endpoint '{endpoint}': {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| RestError::Mock(format!("mock endpoint '{endpoint}' has no host")))?;
        self.endpoint = match url.port() {
            Some(port) => format!("{}://{host}:{port}", url.scheme()),
            None => format!("{}://{host}", url.scheme()),
        };
        Ok(self)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Registers one mock, replacing any mock with the same normalized key,
    /// and resets its call counter.
    pub fn register(&self, mock: Mock) -> Result<MockHandle> {
        let normalized_url = normalize_url(&mock.url)?;
        let key = MockKey {
            method: mock.method.clone(),
            url: normalized_url.clone(),
            body: mock.request_body.as_deref().map(normalize_body),
        };
        let entry = Arc::new(Entry {
            mock,
            normalized_url,
            calls: AtomicUsize::new(0),
        });

        self.mocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&entry));
        Ok(MockHandle { entry })
    }

    /// Registers every mock, stopping at the first invalid one.
    pub fn register_all<I>(&self, mocks: I) -> Result<Vec<MockHandle>>
    where
        I: IntoIterator<Item = Mock>,
    {
        mocks.into_iter().map(|mock| self.register(mock)).collect()
    }

    /// Removes every registered mock.
    pub fn flush(&self) {
        self.mocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.mocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matches a request against the registry.
    ///
    /// Looks up (method, URL, body) first and falls back to a mock
    /// registered without a body. A found mock must also see every header it
    /// names; only then is its call counter incremented.
    pub fn dispatch(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> MockMatch {
        let Ok(url) = normalize_url(url) else {
            return MockMatch::NotFound;
        };
        let key = MockKey {
            method: method.clone(),
            url,
            body: Some(normalize_body(&String::from_utf8_lossy(body))),
        };

        let lookup = {
            let mocks = self.mocks.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = mocks.get(&key) {
                Lookup::Found(Arc::clone(entry))
            } else {
                let any_body = MockKey {
                    body: None,
                    ..key
                };
                match mocks.get(&any_body) {
                    Some(entry) => Lookup::Found(Arc::clone(entry)),
                    None if mocks.values().any(|entry| {
                        entry.mock.method == any_body.method
                            && entry.normalized_url == any_body.url
                    }) =>
                    {
                        Lookup::OtherBody
                    }
                    None => Lookup::Missing,
                }
            }
        };

        let entry = match lookup {
            Lookup::Found(entry) => entry,
            Lookup::OtherBody => return MockMatch::BodyMismatch,
            Lookup::Missing => return MockMatch::NotFound,
        };
        if !headers_match(&entry.mock.request_headers, headers) {
            return MockMatch::HeaderMismatch;
        }

        entry.calls.fetch_add(1, Ordering::SeqCst);
        MockMatch::Matched(MockReply {
            status: entry.mock.status,
            headers: entry.mock.response_headers.clone(),
            body: entry.mock.response_body.clone(),
        })
    }

    /// Answers a request rewritten to the mock endpoint.
    ///
    /// The intended URL is read from `X-Original-URL` (falling back to `url`)
    /// and misses are turned into fixed `400` sentinel replies.
    pub fn serve(&self, method: &Method, url: &str, headers: &HeaderMap, body: &[u8]) -> MockReply {
        let target = headers
            .get(ORIGINAL_URL_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(url);

        match self.dispatch(method, target, headers, body) {
            MockMatch::Matched(reply) => reply,
            MockMatch::NotFound => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%method, url = target, "no mock registered");
                MockReply::sentinel(MOCK_NOT_FOUND)
            }
            MockMatch::BodyMismatch => MockReply::sentinel(MOCK_BODY_MISMATCH),
            MockMatch::HeaderMismatch => MockReply::sentinel(MOCK_HEADERS_MISMATCH),
        }
    }

    /// Mocks whose observed call count differs from the declared one.
    pub fn mismatches(&self) -> Vec<CallCountMismatch> {
        let mocks = self.mocks.read().unwrap_or_else(PoisonError::into_inner);
        let mut mismatches: Vec<CallCountMismatch> = mocks
            .values()
            .filter_map(|entry| {
                let expected = entry.mock.expected_calls?;
                let observed = entry.calls.load(Ordering::SeqCst);
                (expected != observed).then(|| CallCountMismatch {
                    method: entry.mock.method.to_string(),
                    url: entry.mock.url.clone(),
                    expected,
                    observed,
                })
            })
            .collect();
        mismatches.sort_by(|a, b| (&a.url, &a.method).cmp(&(&b.url, &b.method)));
        mismatches
    }

    /// Fails with [`RestError::CallCountMismatch`] when any mock with a
    /// declared call count was hit a different number of times.
    pub fn verify_call_counts(&self) -> Result<()> {
        let mismatches = self.mismatches();
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(RestError::CallCountMismatch(mismatches))
        }
    }

    /// Rewrites scheme and authority of `url` to the mock endpoint,
    /// preserving path and query.
    pub(crate) fn rewrite(&self, url: &Url) -> Result<Url> {
        let mut target = format!("{}{}", self.endpoint, url.path());
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        Url::parse(&target)
            .map_err(|err| RestError::Construction(format!("invalid mock url '{target}': {err}")))
    }
}

fn headers_match(expected: &HeaderMap, actual: &HeaderMap) -> bool {
    expected
        .iter()
        .all(|(name, value)| actual.get(name) == Some(value))
}

/// Sorts query parameters by key so URLs compare independently of
/// parameter order. Values and their encoding are kept as sent.
pub(crate) fn normalize_url(raw: &str) -> Result<String> {
    let mut url =
        Url::parse(raw).map_err(|err| RestError::Mock(format!("invalid url '{raw}': {err}")))?;
    url.set_fragment(None);

    let sorted = url.query().filter(|query| !query.is_empty()).map(|query| {
        let mut pairs: Vec<&str> = query.split('&').filter(|pair| !pair.is_empty()).collect();
        pairs.sort_by_key(|pair| pair.split_once('=').map_or(*pair, |(key, _)| key));
        pairs.join("&")
    });
    url.set_query(sorted.as_deref());
    Ok(url.into())
}

/// Drops spaces, tabs and line breaks.
pub(crate) fn normalize_body(body: &str) -> String {
    body.chars()
        .filter(|c| !matches!(c, ' ' | '\n' | '\t' | '\r'))
        .collect()
}
