//! Service Error Types

use thiserror::Error;

use crate::provider::ProviderError;

/// Errors surfaced by [`RealtimeService`](crate::RealtimeService)
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Realtime service already started")]
    AlreadyStarted,

    #[error("Realtime service has been shut down")]
    ShutDown,
}

/// Result type for service operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;
