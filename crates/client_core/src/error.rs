use shared::protocol::FieldError;
use thiserror::Error;

/// Failure taxonomy for every operation that crosses the network.
///
/// `status()` follows the backend convention: 0 is reserved for failures
/// where no usable response reached the client, distinct from any
/// server-assigned code.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No response reached the client (connection refused, DNS, malformed body).
    #[error("network error: {0}")]
    Transport(String),

    /// The server answered with a non-2xx status or `success = false`.
    #[error("{message}")]
    Request {
        status: u16,
        message: String,
        field_errors: Vec<FieldError>,
    },

    /// Credential invalid or expired.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The realtime bridge gave up reconnecting.
    #[error("realtime connection gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl ClientError {
    pub fn status(&self) -> u16 {
        match self {
            ClientError::Transport(_) | ClientError::ReconnectExhausted { .. } => 0,
            ClientError::Request { status, .. } => *status,
            ClientError::Auth(_) => 401,
        }
    }

    /// True when the backend actively rejected the request, as opposed to
    /// the request never producing a response.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ClientError::Request { .. } | ClientError::Auth(_)
        )
    }
}
