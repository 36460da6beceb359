//! Provider error types
//!
//! Errors raised at the seam to the realtime channel provider and the
//! bootstrap RPC.

use thiserror::Error;

/// Errors that can occur when talking to the channel provider or bootstrap RPC
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Provider or RPC endpoint cannot be reached
    #[error("Realtime provider unavailable")]
    Unavailable,

    /// Request timed out
    #[error("Request timeout")]
    Timeout,

    /// HTTP transport error
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// RPC returned a non-success status
    #[error("RPC error {status}: {message}")]
    Rpc { status: u16, message: String },

    /// Provider rejected a channel subscription
    #[error("Failed to subscribe channel {channel}: {reason}")]
    Subscribe { channel: String, reason: String },

    /// Broadcast could not be delivered
    #[error("Failed to send on channel {channel}: {reason}")]
    Send { channel: String, reason: String },

    /// No open channel instance for the given name
    #[error("Channel not connected: {0}")]
    NotConnected(String),
}

/// Result type alias for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::Rpc {
            status: 503,
            message: "busy".to_string(),
        };
        assert_eq!(err.to_string(), "RPC error 503: busy");

        let err = ProviderError::NotConnected("realtime:jobs".to_string());
        assert_eq!(err.to_string(), "Channel not connected: realtime:jobs");
    }
}
