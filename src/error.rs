// Error taxonomy shared across the progression engine and scoring pipeline.

use thiserror::Error;

use crate::store::RoundState;

/// Crate-wide error type.
///
/// Validation-class errors are caller mistakes and map to 4xx at the API
/// boundary; state conflicts map to 409; store failures propagate as 500
/// and are never retried by the core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("round {round_id} is {current:?}, cannot {requested}")]
    InvalidRoundState {
        round_id: i64,
        current: RoundState,
        requested: &'static str,
    },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("not enough teams: need {needed}, have {available}")]
    InsufficientTeams { needed: usize, available: usize },

    #[error("not enough group winners: need {needed}, found {found}")]
    InsufficientQualifiers { needed: usize, found: usize },

    #[error("selection strategy misconfigured: {0}")]
    InvalidStrategyConfig(String),

    #[error("group configuration invalid: {0}")]
    InvalidGroupConfig(String),

    #[error("round {round_id} not ready: {reason}")]
    RoundNotReady { round_id: i64, reason: String },

    #[error("no legal pairing available: {0}")]
    UnresolvablePairing(String),

    #[error("concurrent update detected on {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: i64 },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller can recover by fixing input or state and retrying.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_state() {
        let e = Error::InvalidRoundState {
            round_id: 7,
            current: RoundState::Created,
            requested: "finalize",
        };
        let msg = e.to_string();
        assert!(msg.contains("7"));
        assert!(msg.contains("Created"));
        assert!(msg.contains("finalize"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Validation("x".into()).is_recoverable());
        assert!(Error::ConcurrencyConflict {
            entity: "match",
            id: 1
        }
        .is_recoverable());
        assert!(!Error::Store(sqlx::Error::PoolClosed).is_recoverable());
    }
}
