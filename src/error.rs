use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no free port available from {start} to {end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("request to {url} failed: status={status} body={body}")]
    RemoteRequest {
        url: String,
        status: u16,
        body: String,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("folder '{segment}' of '{path}' not found")]
    FolderNotFound { path: String, segment: String },

    #[error("timed out after {0}s waiting for the authorization redirect")]
    CallbackTimeout(u64),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedResponse {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure belongs to one remote call only (bad status, bad
    /// payload, broken connection) rather than to the whole operation.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::RemoteRequest { .. } | Self::MalformedResponse { .. } | Self::Transport { .. }
        )
    }
}

const REDACTED_BODY_MAX_LEN: usize = 200;

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}

#[cfg(test)]
mod tests {
    use super::{redact_response_body, Error};

    #[test]
    fn short_bodies_are_kept() {
        assert_eq!(redact_response_body("  {\"error\":1}  "), "{\"error\":1}");
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(300);
        let redacted = redact_response_body(&body);
        assert!(redacted.contains("[truncated 600 bytes]"));
        assert!(redacted.len() < body.len());
    }

    #[test]
    fn remote_errors_are_classified() {
        let remote = Error::RemoteRequest {
            url: "https://graph.test/me".to_string(),
            status: 404,
            body: String::new(),
        };
        assert!(remote.is_remote());
        assert!(Error::malformed("https://graph.test/me", "eof").is_remote());
        assert!(!Error::Authentication("nope".to_string()).is_remote());
    }
}
