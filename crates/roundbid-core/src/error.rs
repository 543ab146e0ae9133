// Error taxonomy for the allocation engine.

use thiserror::Error;

use crate::model::{RoundId, RoundStatus, TiebreakerId};

/// Broad classification of an [`EngineError`], used by callers to decide
/// whether to fix their input, refresh their view, or retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong; resubmit with corrected input.
    Validation,
    /// The caller is operating on stale state; refresh and retry.
    State,
    /// A commit attempt failed as a whole; nothing was applied and a retry is safe.
    Commit,
    /// The backing store failed.
    Storage,
}

#[derive(Debug, Error)]
pub enum EngineError {
    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------
    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount {
        amount: i64,
        reason: String,
        /// Authoritative highest bid, when the amount was judged against one.
        current_highest_bid: Option<u32>,
    },

    #[error("amount {amount} exceeds available balance {balance}")]
    InsufficientBalance { amount: u32, balance: u32 },

    #[error("team {team_id} has reached the limit of {limit} bids in round {round_id}")]
    BidLimitExceeded {
        team_id: String,
        round_id: RoundId,
        limit: u32,
    },

    #[error("team {team_id} is not an active participant of tiebreaker {tiebreaker_id}")]
    NotParticipant {
        team_id: String,
        tiebreaker_id: TiebreakerId,
    },

    #[error("unknown team: {0}")]
    UnknownTeam(String),

    #[error("player {player_id} has already been assigned to team {team_id}")]
    PlayerUnavailable { player_id: String, team_id: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // ---------------------------------------------------------------
    // State
    // ---------------------------------------------------------------
    #[error("tiebreaker {0} is already resolved")]
    AlreadyResolved(TiebreakerId),

    #[error("round {round_id} has {active} unresolved tiebreaker(s)")]
    IncompleteTiebreakers { round_id: RoundId, active: usize },

    #[error("round {0} has no pending allocations")]
    NoPendingAllocations(RoundId),

    #[error("round not found: {0}")]
    RoundNotFound(RoundId),

    #[error("tiebreaker not found: {0}")]
    TiebreakerNotFound(TiebreakerId),

    #[error("round {round_id} is not accepting bids (status: {status})")]
    RoundNotActive { round_id: RoundId, status: RoundStatus },

    #[error("round {round_id} is {status}; expected one of: {expected}")]
    InvalidRoundStatus {
        round_id: RoundId,
        status: RoundStatus,
        expected: String,
    },

    // ---------------------------------------------------------------
    // Commit-time
    // ---------------------------------------------------------------
    #[error("budget validation failed for round {round_id}: {}", .errors.join("; "))]
    BudgetValidation {
        round_id: RoundId,
        errors: Vec<String>,
    },

    #[error("commit of round {round_id} aborted: {reason}")]
    CommitFailed { round_id: RoundId, reason: String },

    // ---------------------------------------------------------------
    // Storage
    // ---------------------------------------------------------------
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidAmount { .. }
            | EngineError::InsufficientBalance { .. }
            | EngineError::BidLimitExceeded { .. }
            | EngineError::NotParticipant { .. }
            | EngineError::UnknownTeam(_)
            | EngineError::PlayerUnavailable { .. }
            | EngineError::Unauthorized(_) => ErrorKind::Validation,
            EngineError::AlreadyResolved(_)
            | EngineError::IncompleteTiebreakers { .. }
            | EngineError::NoPendingAllocations(_)
            | EngineError::RoundNotFound(_)
            | EngineError::TiebreakerNotFound(_)
            | EngineError::RoundNotActive { .. }
            | EngineError::InvalidRoundStatus { .. } => ErrorKind::State,
            EngineError::BudgetValidation { .. } | EngineError::CommitFailed { .. } => {
                ErrorKind::Commit
            }
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Stable machine-readable code for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidAmount { .. } => "invalid_amount",
            EngineError::InsufficientBalance { .. } => "insufficient_balance",
            EngineError::BidLimitExceeded { .. } => "bid_limit_exceeded",
            EngineError::NotParticipant { .. } => "not_participant",
            EngineError::UnknownTeam(_) => "unknown_team",
            EngineError::PlayerUnavailable { .. } => "player_unavailable",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::AlreadyResolved(_) => "already_resolved",
            EngineError::IncompleteTiebreakers { .. } => "incomplete_tiebreakers",
            EngineError::NoPendingAllocations(_) => "no_pending_allocations",
            EngineError::RoundNotFound(_) => "round_not_found",
            EngineError::TiebreakerNotFound(_) => "tiebreaker_not_found",
            EngineError::RoundNotActive { .. } => "round_not_active",
            EngineError::InvalidRoundStatus { .. } => "invalid_round_status",
            EngineError::BudgetValidation { .. } => "budget_validation",
            EngineError::CommitFailed { .. } => "commit_failed",
            EngineError::Storage(_) => "storage",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
