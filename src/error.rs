use std::fmt;

/// Authentication failures. The variants mirror the OAuth2 error registry
/// plus the local acquisition outcomes; cloneable so a single in-flight
/// refresh can hand the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    ServerError,
    TemporarilyUnavailable,
    NetworkError(String),
    ParseError(String),
    TokenAcquisitionFailed(String),
    AuthorizationTimeout,
    InvalidState,
}

impl AuthError {
    /// Classify a token-endpoint `error` field per RFC 6749 §5.2.
    pub fn from_oauth_code(code: &str) -> Self {
        match code {
            "invalid_request" => AuthError::InvalidRequest,
            "invalid_client" => AuthError::InvalidClient,
            "invalid_grant" => AuthError::InvalidGrant,
            "unauthorized_client" => AuthError::UnauthorizedClient,
            "unsupported_grant_type" => AuthError::UnsupportedGrantType,
            "invalid_scope" => AuthError::InvalidScope,
            "temporarily_unavailable" => AuthError::TemporarilyUnavailable,
            _ => AuthError::ServerError,
        }
    }

    /// Fallback classification when the error body carries no `error` field.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => AuthError::InvalidRequest,
            401 => AuthError::InvalidClient,
            403 => AuthError::UnauthorizedClient,
            503 => AuthError::TemporarilyUnavailable,
            _ => AuthError::ServerError,
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidRequest => write!(f, "invalid_request"),
            AuthError::InvalidClient => write!(f, "invalid_client"),
            AuthError::InvalidGrant => write!(f, "invalid_grant"),
            AuthError::UnauthorizedClient => write!(f, "unauthorized_client"),
            AuthError::UnsupportedGrantType => write!(f, "unsupported_grant_type"),
            AuthError::InvalidScope => write!(f, "invalid_scope"),
            AuthError::ServerError => write!(f, "server_error"),
            AuthError::TemporarilyUnavailable => write!(f, "temporarily_unavailable"),
            AuthError::NetworkError(msg) => write!(f, "network error: {msg}"),
            AuthError::ParseError(msg) => write!(f, "parse error: {msg}"),
            AuthError::TokenAcquisitionFailed(msg) => {
                write!(f, "token acquisition failed: {msg}")
            }
            AuthError::AuthorizationTimeout => write!(f, "authorization flow timed out"),
            AuthError::InvalidState => write!(f, "unknown or already-consumed state"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Transport-level failures shared by all four transport kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    ConnectionFailed(String),
    ConnectionTimeout,
    ConnectionReset,
    RequestTimeout,
    TransportClosed,
    Unauthorized,
    ServiceUnavailable,
    InvalidUrl(String),
    ProtocolError(String),
}

impl TransportError {
    /// Whether the reconnection state machine should be engaged. Clean
    /// protocol violations and bad configuration are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::ConnectionFailed(_)
            | TransportError::ConnectionTimeout
            | TransportError::ConnectionReset
            | TransportError::RequestTimeout
            | TransportError::ServiceUnavailable => true,
            TransportError::TransportClosed
            | TransportError::Unauthorized
            | TransportError::InvalidUrl(_)
            | TransportError::ProtocolError(_) => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
            TransportError::ConnectionTimeout => write!(f, "connection timed out"),
            TransportError::ConnectionReset => write!(f, "connection reset"),
            TransportError::RequestTimeout => write!(f, "request timed out"),
            TransportError::TransportClosed => write!(f, "transport closed"),
            TransportError::Unauthorized => write!(f, "unauthorized"),
            TransportError::ServiceUnavailable => write!(f, "service unavailable"),
            TransportError::InvalidUrl(url) => write!(f, "invalid url: {url}"),
            TransportError::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Tool-registry failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    ToolNotFound(String),
    DuplicateTool(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::ToolNotFound(name) => write!(f, "tool not found: {name}"),
            RegistryError::DuplicateTool(name) => {
                write!(f, "tool already registered by another server: {name}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Configuration failures surfaced before any connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidArgument(String),
    MissingCommand(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ConfigError::MissingCommand(name) => write!(f, "missing command: {name}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_codes_map_to_closed_set() {
        assert_eq!(
            AuthError::from_oauth_code("invalid_grant"),
            AuthError::InvalidGrant
        );
        assert_eq!(
            AuthError::from_oauth_code("something_else"),
            AuthError::ServerError
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(TransportError::ConnectionReset.is_retryable());
        assert!(TransportError::ServiceUnavailable.is_retryable());
        assert!(!TransportError::Unauthorized.is_retryable());
        assert!(!TransportError::InvalidUrl("ws://example.com".into()).is_retryable());
    }

    #[test]
    fn error_messages_carry_no_secrets() {
        let err = AuthError::TokenAcquisitionFailed("endpoint returned empty token".into());
        assert!(!err.to_string().contains("Bearer"));
    }
}
