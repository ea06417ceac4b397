use std::fmt;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// Request could not be built: malformed body for the declared content
    /// type, invalid multipart payload, invalid URL or invalid retry settings.
    /// Never retried, never sent.
    #[error("construction error: {0}")]
    Construction(String),
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Non-success HTTP status code with raw response body.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    /// A 3xx response was received while redirect following is disabled.
    #[error("redirect blocked: {status} to '{location}'")]
    RedirectBlocked {
        /// Status code of the redirect response.
        status: u16,
        /// Target of the `Location` header.
        location: String,
    },
    /// Redirect chain exceeded the hop limit.
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),
    /// The retry budget denied an admission.
    #[error("retry quota exceeded")]
    QuotaExceeded,
    /// Admission weight must be positive.
    #[error("limiter weight must be positive")]
    InvalidWeight,
    /// Response body could not be inflated.
    #[error("decompress error: {0}")]
    Decompress(String),
    /// Response body type unsupported or unparsable.
    #[error("format error: {0}")]
    Format(String),
    /// Mock registration or dispatch failure.
    #[error("mock error: {0}")]
    Mock(String),
    /// Registered mocks were called a different number of times than declared.
    #[error("mock call count mismatch: {}", DisplayMismatches(.0))]
    CallCountMismatch(Vec<CallCountMismatch>),
    /// A spawned call panicked or was aborted.
    #[error("background call failed: {0}")]
    Background(String),
}

impl RestError {
    /// Returns `true` for failures that happened on the wire (connect,
    /// DNS, deadline, body read).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` when the transport deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_timeout())
    }
}

/// One mock whose observed calls differ from the declared expectation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallCountMismatch {
    pub method: String,
    pub url: String,
    pub expected: usize,
    pub observed: usize,
}

impl fmt::Display for CallCountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} expected {} call(s), got {}",
            self.method, self.url, self.expected, self.observed
        )
    }
}

struct DisplayMismatches<'a>(&'a [CallCountMismatch]);

impl fmt::Display for DisplayMismatches<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, mismatch) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{mismatch}")?;
        }
        Ok(())
    }
}
