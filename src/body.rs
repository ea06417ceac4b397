//! Request bodies and their encoding.
//!
//! A [`Body`] is turned into bytes while the request is being built, using
//! the client's configured [`ContentType`]. Encoding failures surface as
//! [`RestError::Construction`] before anything touches the network.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{RestError, Result};

/// Wire format used for request bodies and the `Accept` header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Json,
    Xml,
    Bytes,
    Multipart,
}

impl ContentType {
    /// Value for `Accept`/`Content-Type`, when the format has one.
    pub fn mime(self) -> Option<&'static str> {
        match self {
            Self::Json => Some("application/json"),
            Self::Xml => Some("application/xml"),
            Self::Bytes | Self::Multipart => None,
        }
    }
}

type Encoder = Arc<dyn Fn(ContentType) -> Result<Vec<u8>> + Send + Sync>;

#[derive(Clone, Default)]
enum Payload {
    #[default]
    Empty,
    Value(Encoder),
    Raw(Bytes),
    Multipart { boundary: String, data: Bytes },
}

/// Payload of an outgoing request.
#[derive(Clone, Default)]
pub struct Body {
    payload: Payload,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Empty => f.write_str("Body::Empty"),
            Payload::Value(_) => f.write_str("Body::Value(..)"),
            Payload::Raw(bytes) => write!(f, "Body::Raw({} bytes)", bytes.len()),
            Payload::Multipart { boundary, data } => {
                write!(f, "Body::Multipart({boundary}, {} bytes)", data.len())
            }
        }
    }
}

impl Body {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A structured value, marshalled as JSON or XML depending on the
    /// client's content type.
    pub fn value<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let encoder: Encoder = Arc::new(move |content_type| encode_value(&value, content_type));
        Self {
            payload: Payload::Value(encoder),
        }
    }

    /// Raw bytes, sent unchanged.
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            payload: Payload::Raw(bytes.into()),
        }
    }

    /// A pre-built `multipart/form-data` buffer delimited by `boundary`.
    ///
    /// The buffer is validated when the request is built.
    pub fn multipart(boundary: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            payload: Payload::Multipart {
                boundary: boundary.into(),
                data: data.into(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.payload, Payload::Empty)
    }

    /// Boundary of a multipart body.
    pub fn boundary(&self) -> Option<&str> {
        match &self.payload {
            Payload::Multipart { boundary, .. } => Some(boundary),
            _ => None,
        }
    }

    /// Encodes the body for `content_type`.
    ///
    /// Raw bytes pass through for every content type except `Multipart`; a
    /// structured value is rejected for `Bytes` and `Multipart`.
    pub(crate) fn encode(&self, content_type: ContentType) -> Result<Option<Bytes>> {
        match (&self.payload, content_type) {
            (Payload::Empty, _) => Ok(None),
            (Payload::Multipart { boundary, data }, _) => {
                validate_multipart(boundary, data)?;
                Ok(Some(data.clone()))
            }
            (Payload::Raw(_), ContentType::Multipart) => Err(RestError::Construction(
                "multipart: body is raw bytes, not a multipart buffer".to_owned(),
            )),
            (Payload::Raw(bytes), _) => Ok(Some(bytes.clone())),
            (Payload::Value(encoder), _) => encoder(content_type).map(|bytes| Some(bytes.into())),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Self::bytes(value)
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self::bytes(value)
    }
}

impl From<&'static [u8]> for Body {
    fn from(value: &'static [u8]) -> Self {
        Self::bytes(Bytes::from_static(value))
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::value(value)
    }
}

fn encode_value<T: Serialize>(value: &T, content_type: ContentType) -> Result<Vec<u8>> {
    match content_type {
        ContentType::Json => serde_json::to_vec(value)
            .map_err(|err| RestError::Construction(format!("json: {err}"))),
        ContentType::Xml => quick_xml::se::to_string(value)
            .map(String::into_bytes)
            .map_err(|err| RestError::Construction(format!("xml: {err}"))),
        ContentType::Bytes => Err(RestError::Construction(
            "bytes: body is a structured value, not a byte buffer".to_owned(),
        )),
        ContentType::Multipart => Err(RestError::Construction(
            "multipart: body is a structured value, not a multipart buffer".to_owned(),
        )),
    }
}

fn validate_multipart(boundary: &str, data: &[u8]) -> Result<()> {
    if boundary.is_empty() || boundary.len() > 70 {
        return Err(RestError::Construction(format!(
            "multipart: invalid boundary '{boundary}'"
        )));
    }
    let opening = format!("--{boundary}\r\n");
    let closing = format!("--{boundary}--");

    let trimmed = data
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .map_or(&data[..0], |start| &data[start..]);
    if !trimmed.starts_with(opening.as_bytes()) {
        return Err(RestError::Construction(
            "multipart: buffer does not start with the boundary delimiter".to_owned(),
        ));
    }
    if !contains(trimmed, closing.as_bytes()) {
        return Err(RestError::Construction(
            "multipart: buffer is missing the closing delimiter".to_owned(),
        ));
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Builder for well-formed `multipart/form-data` bodies.
#[derive(Debug)]
pub struct Multipart {
    boundary: String,
    data: Vec<u8>,
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

impl Multipart {
    pub fn new() -> Self {
        Self {
            boundary: format!("restpipe-{}", Uuid::new_v4().simple()),
            data: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.open_part(&format!("form-data; name=\"{name}\""), None);
        self.data.extend_from_slice(value.as_bytes());
        self.data.extend_from_slice(b"\r\n");
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, content: &[u8]) -> Self {
        self.open_part(
            &format!("form-data; name=\"{name}\"; filename=\"{file_name}\""),
            Some("application/octet-stream"),
        );
        self.data.extend_from_slice(content);
        self.data.extend_from_slice(b"\r\n");
        self
    }

    pub fn finish(mut self) -> Body {
        self.data
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        Body::multipart(self.boundary, self.data)
    }

    fn open_part(&mut self, disposition: &str, content_type: Option<&str>) {
        self.data
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.data
            .extend_from_slice(format!("Content-Disposition: {disposition}\r\n").as_bytes());
        if let Some(content_type) = content_type {
            self.data
                .extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        self.data.extend_from_slice(b"\r\n");
    }
}
