use reqwest::StatusCode;

use crate::decrypt::DecryptError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} failed with HTTP {status}")]
    HttpStatus { url: String, status: StatusCode },

    #[error("request to {url} returned an empty body (HTTP {status})")]
    EmptyBody { url: String, status: StatusCode },

    #[error("failed to decrypt {url}: {source}")]
    Decryption {
        url: String,
        #[source]
        source: DecryptError,
    },

    #[error("no variant with resolution {wanted} (available: {available})")]
    VariantNotFound { wanted: String, available: String },

    #[error("cannot resolve relative URI `{uri}` without a base URL")]
    BaseUrlRequired { uri: String },

    #[error("segment {index} cannot be assembled: {reason}")]
    AssemblyContract { index: usize, reason: &'static str },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("invalid URL `{input}`: {source}")]
    InvalidUrl {
        input: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("merge failed: {reason}")]
    Merge { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("download cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn merge(reason: impl Into<String>) -> Self {
        Self::Merge {
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, source: url::ParseError) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            source,
        }
    }

    /// Whether another attempt at the same request could succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::HttpStatus { .. } | Self::EmptyBody { .. } | Self::Io { .. }
        )
    }
}
