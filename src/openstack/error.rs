//! Error types for the OpenStack backend.

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;

/// HTTP status Nova, Cinder and Glance return for missing resources.
const NOT_FOUND: u16 = 404;

/// Errors raised by the OpenStack backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OpenStackError {
    /// Raised when the credentials are incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid server request: {0}")]
    Validation(String),
    /// Raised when Keystone rejects the credentials or returns no token.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Raised when the service catalog lacks a required service.
    #[error("no {service} endpoint in the service catalog")]
    MissingEndpoint {
        /// Service type that was looked up.
        service: String,
    },
    /// Raised when an API call returns a non-success status.
    #[error("{action} failed with HTTP {status}: {body}")]
    Http {
        /// Operation being performed.
        action: String,
        /// HTTP status code.
        status: u16,
        /// Response body, as returned.
        body: String,
    },
    /// Raised when the request could not be sent or the response read.
    #[error("transport error: {message}")]
    Transport {
        /// Error reported by the HTTP client.
        message: String,
    },
    /// Raised when a response body does not have the expected shape.
    #[error("unexpected response to {action}: {message}")]
    Decode {
        /// Operation whose response could not be read.
        action: String,
        /// Parser error.
        message: String,
    },
}

impl OpenStackError {
    /// Returns `true` when the API reported the resource as missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status == NOT_FOUND)
    }
}

/// Collapses the result of a removal call, treating a missing resource as
/// already removed.
pub(super) fn removed<T>(result: Result<T, OpenStackError>) -> Result<(), OpenStackError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}

impl From<reqwest::Error> for OpenStackError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

impl From<BackendError> for OpenStackError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for OpenStackError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn http(status: u16) -> OpenStackError {
        OpenStackError::Http {
            action: String::from("detach_volume"),
            status,
            body: String::new(),
        }
    }

    #[rstest]
    fn missing_resource_counts_as_removed() {
        assert_eq!(removed::<()>(Err(http(404))), Ok(()));
        assert_eq!(removed(Ok("accepted")), Ok(()));
    }

    #[rstest]
    #[case::conflict(409)]
    #[case::server_error(500)]
    fn other_failures_are_kept(#[case] status: u16) {
        assert_eq!(removed::<()>(Err(http(status))), Err(http(status)));
    }

    #[rstest]
    fn transport_failures_are_kept() {
        let err = OpenStackError::Transport {
            message: String::from("connection reset"),
        };

        assert_eq!(removed::<()>(Err(err.clone())), Err(err));
    }
}
