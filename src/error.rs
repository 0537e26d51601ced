use thiserror::Error;

/// Startup failures. Any of these stops the process before a listener is bound.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("route table: {0}")]
    RouteTable(String),
}

impl ConfigError {
    pub fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed forwarding attempt, as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProxyFailure {
    /// DNS, TLS, refused or timed out connections and broken upstream streams (502)
    #[error("upstream unreachable")]
    UpstreamUnreachable,
    /// Anything else that went wrong while proxying (500)
    #[error("unexpected proxy failure")]
    Unexpected,
    /// The client went away; there is nobody to answer
    #[error("client disconnected")]
    ClientGone,
    /// An explicit HTTP status raised by a filter
    #[error("http status {0}")]
    Status(u16),
}

impl ProxyFailure {
    /// Status code to send downstream, `None` when no response should be written.
    pub fn status_code(self) -> Option<u16> {
        match self {
            ProxyFailure::UpstreamUnreachable => Some(502),
            ProxyFailure::Unexpected => Some(500),
            ProxyFailure::ClientGone => None,
            ProxyFailure::Status(code) => Some(code),
        }
    }
}
