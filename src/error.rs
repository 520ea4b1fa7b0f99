//! Error types for the matchmaking service
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for surface-visible matchmaking failures
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("Unauthenticated: {message}")]
    Unauthenticated { message: String },

    #[error("Forbidden: player {player_id} is not permitted to act on party {party_id}")]
    Forbidden { player_id: String, party_id: String },

    #[error("Illegal state: {operation} not allowed while party is {status}")]
    IllegalState { operation: String, status: String },

    #[error("Not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Queue entry timed out: party {party_id}")]
    Timeout { party_id: String },

    #[error("Backpressure: subscriber outbound queue overflowed for party {party_id}")]
    Backpressure { party_id: String },

    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal service error: {message}")]
    Internal { message: String },
}

impl MatchmakingError {
    /// Stable machine-readable kind tag, matching the wire-level error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            MatchmakingError::Unauthenticated { .. } => "unauthenticated",
            MatchmakingError::Forbidden { .. } => "forbidden",
            MatchmakingError::IllegalState { .. } => "illegal_state",
            MatchmakingError::NotFound { .. } => "not_found",
            MatchmakingError::Conflict { .. } => "conflict",
            MatchmakingError::Timeout { .. } => "timeout",
            MatchmakingError::Backpressure { .. } => "backpressure",
            MatchmakingError::Transport { .. } => "transport",
            MatchmakingError::Configuration { .. } => "configuration",
            MatchmakingError::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_tags() {
        let err = MatchmakingError::Conflict {
            reason: "party already queued".to_string(),
        };
        assert_eq!(err.kind(), "conflict");

        let err = MatchmakingError::IllegalState {
            operation: "join".to_string(),
            status: "queueing".to_string(),
        };
        assert_eq!(err.kind(), "illegal_state");
    }
}
