//! Final responses and body processing.
//!
//! [`Response`] owns the fully-read (and optionally inflated) body, so
//! [`Response::fill_up`] can be called any number of times.

use std::{borrow::Cow, io::Read};

use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::{
    header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE},
    StatusCode, Url,
};
use serde::de::DeserializeOwned;

use crate::{RestError, Result};

/// Response returned by [`RestClient`](crate::RestClient) calls.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    attempts: usize,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        url: Url,
        attempts: usize,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            url,
            attempts,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body bytes, after decompression when enabled.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Body as text; invalid UTF-8 is replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// URL that produced this response (after redirects).
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Total number of attempts made, the first one included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Turns 4xx/5xx responses into [`RestError::Http`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            return Err(RestError::Http {
                status: self.status.as_u16(),
                body: self.text().into_owned(),
            });
        }
        Ok(self)
    }

    /// Deserializes the body as JSON or XML.
    ///
    /// The format comes from `Content-Type`; without one the body is sniffed.
    /// Any other format is a [`RestError::Format`]. The body is left intact,
    /// so the raw bytes remain available after a failure.
    pub fn fill_up<T: DeserializeOwned>(&self) -> Result<T> {
        let format = match self.content_type() {
            Some(content_type) => BodyFormat::from_content_type(content_type),
            None => BodyFormat::sniff(&self.body),
        };

        match format {
            BodyFormat::Json => serde_json::from_slice(&self.body)
                .map_err(|err| RestError::Format(format!("invalid json body: {err}"))),
            BodyFormat::Xml => {
                let text = std::str::from_utf8(&self.body)
                    .map_err(|err| RestError::Format(format!("invalid xml body: {err}")))?;
                quick_xml::de::from_str(text)
                    .map_err(|err| RestError::Format(format!("invalid xml body: {err}")))
            }
            BodyFormat::Other => Err(RestError::Format(format!(
                "response format neither json nor xml (content-type: {})",
                self.content_type().unwrap_or("<none>")
            ))),
        }
    }

    fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyFormat {
    Json,
    Xml,
    Other,
}

impl BodyFormat {
    fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence == "application/json" || essence.ends_with("+json") {
            Self::Json
        } else if essence == "application/xml" || essence == "text/xml" || essence.ends_with("+xml")
        {
            Self::Xml
        } else {
            Self::Other
        }
    }

    fn sniff(body: &[u8]) -> Self {
        let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
        match body.iter().find(|byte| !byte.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => Self::Json,
            Some(b'<') => Self::Xml,
            _ => Self::Other,
        }
    }
}

/// Inflates `body` according to its encoding.
///
/// The encoding is read from `Content-Encoding`, or from `Content-Type` when
/// there is none. Unknown or absent encodings pass the bytes through.
pub(crate) fn decompress(headers: &HeaderMap, body: Bytes) -> Result<Bytes> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .or_else(|| headers.get(CONTENT_TYPE))
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match encoding.as_str() {
        "gzip" | "x-gzip" | "application/x-gzip" if !body.is_empty() => {
            let mut decoded = Vec::new();
            GzDecoder::new(body.as_ref())
                .read_to_end(&mut decoded)
                .map_err(|err| RestError::Decompress(format!("{encoding}: {err}")))?;
            Ok(decoded.into())
        }
        _ => Ok(body),
    }
}
