//! Classified errors returned by external collaborators (cloud APIs, host agents).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::errors::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NotFound,
    NotSupported,
    NotImplemented,
    Validation,
    Timeout,
    RateLimited,
    ConnectionReset,
    ResourceBusy,
    Unclassified,
}

impl RemoteErrorKind {
    pub fn class(self) -> ErrorKind {
        match self {
            RemoteErrorKind::Timeout
            | RemoteErrorKind::RateLimited
            | RemoteErrorKind::ConnectionReset
            | RemoteErrorKind::ResourceBusy => ErrorKind::Transient,
            RemoteErrorKind::NotFound
            | RemoteErrorKind::NotSupported
            | RemoteErrorKind::NotImplemented
            | RemoteErrorKind::Validation
            | RemoteErrorKind::Unclassified => ErrorKind::Permanent,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RemoteErrorKind::NotFound => "not_found",
            RemoteErrorKind::NotSupported => "not_supported",
            RemoteErrorKind::NotImplemented => "not_implemented",
            RemoteErrorKind::Validation => "validation",
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::RateLimited => "rate_limited",
            RemoteErrorKind::ConnectionReset => "connection_reset",
            RemoteErrorKind::ResourceBusy => "resource_busy",
            RemoteErrorKind::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(result, error_classification)` の error 側。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotSupported, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    pub fn class(&self) -> ErrorKind {
        self.kind.class()
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorKind::Transient
    }

    /// "Nothing to do on this backend". Workflows decide whether that is a skip.
    pub fn is_not_supported(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::NotSupported | RemoteErrorKind::NotImplemented
        )
    }
}
