// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Credentials were rejected. No later call to the same provider can succeed.
    #[error("{provider}: authentication failed: {message}")]
    Authentication { provider: String, message: String },

    #[error("{provider}: rate limit exceeded")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// The provider answered, but not in a shape we understand.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider configuration error: {0}")]
    Configuration(String),
}

/// Coarse classification used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    Authentication,
    RateLimited,
    Network,
    Timeout,
    InvalidResponse,
    /// 5xx from the provider.
    Server,
    /// 4xx other than 401/429, or a local configuration problem.
    Rejected,
}

impl ProviderErrorKind {
    /// Kinds worth another attempt.
    pub const TRANSIENT: [ProviderErrorKind; 4] = [
        ProviderErrorKind::RateLimited,
        ProviderErrorKind::Network,
        ProviderErrorKind::Timeout,
        ProviderErrorKind::Server,
    ];
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::Authentication { .. } => ProviderErrorKind::Authentication,
            ProviderError::RateLimited { .. } => ProviderErrorKind::RateLimited,
            ProviderError::Network(_) => ProviderErrorKind::Network,
            ProviderError::Timeout => ProviderErrorKind::Timeout,
            ProviderError::InvalidResponse(_) => ProviderErrorKind::InvalidResponse,
            ProviderError::Api { status, .. } if *status >= 500 => ProviderErrorKind::Server,
            ProviderError::Api { .. } | ProviderError::Configuration(_) => {
                ProviderErrorKind::Rejected
            }
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ProviderError::Authentication { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::InvalidResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let server = ProviderError::Api {
            status: 503,
            message: "unavailable".to_string(),
        };
        let client = ProviderError::Api {
            status: 400,
            message: "bad request".to_string(),
        };
        assert_eq!(server.kind(), ProviderErrorKind::Server);
        assert_eq!(client.kind(), ProviderErrorKind::Rejected);
        assert!(ProviderErrorKind::TRANSIENT.contains(&server.kind()));
        assert!(!ProviderErrorKind::TRANSIENT.contains(&client.kind()));
    }

    #[test]
    fn authentication_is_never_transient() {
        let err = ProviderError::Authentication {
            provider: "acrcloud".to_string(),
            message: "invalid key".to_string(),
        };
        assert!(err.is_authentication());
        assert!(!ProviderErrorKind::TRANSIENT.contains(&err.kind()));
    }
}
