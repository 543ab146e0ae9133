// Round, bid, budget, and caller identity types shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RoundId = i64;
pub type TiebreakerId = i64;
pub type BidId = i64;

// ---------------------------------------------------------------------------
// Round
// ---------------------------------------------------------------------------

/// Lifecycle of a bidding round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Draft,
    Active,
    Closed,
    PendingFinalization,
    Completed,
    ExpiredPendingFinalization,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Draft => "draft",
            RoundStatus::Active => "active",
            RoundStatus::Closed => "closed",
            RoundStatus::PendingFinalization => "pending_finalization",
            RoundStatus::Completed => "completed",
            RoundStatus::ExpiredPendingFinalization => "expired_pending_finalization",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(RoundStatus::Draft),
            "active" => Some(RoundStatus::Active),
            "closed" => Some(RoundStatus::Closed),
            "pending_finalization" => Some(RoundStatus::PendingFinalization),
            "completed" => Some(RoundStatus::Completed),
            "expired_pending_finalization" => Some(RoundStatus::ExpiredPendingFinalization),
            _ => None,
        }
    }

    /// Whether pending allocations may be (re)compiled from this status.
    pub fn can_compile(&self) -> bool {
        matches!(
            self,
            RoundStatus::Closed
                | RoundStatus::PendingFinalization
                | RoundStatus::ExpiredPendingFinalization
        )
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a round moves from compiled allocations to committed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationMode {
    /// Compiled allocations are committed immediately.
    Automatic,
    /// Compiled allocations wait for a committee member to commit or cancel.
    Manual,
}

impl FinalizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizationMode::Automatic => "automatic",
            FinalizationMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automatic" => Some(FinalizationMode::Automatic),
            "manual" => Some(FinalizationMode::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub season_id: String,
    pub position: String,
    pub round_number: u32,
    pub status: RoundStatus,
    pub finalization_mode: FinalizationMode,
    pub max_bids_per_team: u32,
    /// Every sealed bid must be a multiple of this value.
    pub bid_increment: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a round. Rounds start in `draft`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRound {
    pub season_id: String,
    pub position: String,
    pub round_number: u32,
    pub finalization_mode: FinalizationMode,
    pub max_bids_per_team: u32,
    pub bid_increment: u32,
}

// ---------------------------------------------------------------------------
// Bids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Active,
    Won,
    Lost,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Active => "active",
            BidStatus::Won => "won",
            BidStatus::Lost => "lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BidStatus::Active),
            "won" => Some(BidStatus::Won),
            "lost" => Some(BidStatus::Lost),
            _ => None,
        }
    }
}

/// One sealed bid as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRecord {
    pub id: BidId,
    pub round_id: RoundId,
    pub team_id: String,
    pub player_id: String,
    pub amount: u32,
    pub status: BidStatus,
    pub submitted_at: DateTime<Utc>,
}

/// The maximum effective bid for a player and every team holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighestBid {
    pub amount: u32,
    /// Sorted by team id.
    pub teams: Vec<String>,
}

impl HighestBid {
    pub fn is_tie(&self) -> bool {
        self.teams.len() > 1
    }
}

// ---------------------------------------------------------------------------
// Budgets and assignments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamBudget {
    pub team_id: String,
    pub team_name: String,
    /// Remaining spendable balance.
    pub balance: u32,
    pub total_spent: u32,
    pub players_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerAssignment {
    pub player_id: String,
    pub team_id: String,
    pub round_id: RoundId,
    pub purchase_price: u32,
    pub acquired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Caller identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Team,
    Committee,
    Admin,
}

/// The identity a request is attributed to, as supplied by the identity
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Display identity recorded in the audit log.
    pub name: String,
    pub role: Role,
    /// The team this actor bids for, if any.
    pub team_id: Option<String>,
}

impl Actor {
    pub fn team(team_id: &str) -> Self {
        Actor {
            name: team_id.to_string(),
            role: Role::Team,
            team_id: Some(team_id.to_string()),
        }
    }

    pub fn committee(name: &str) -> Self {
        Actor {
            name: name.to_string(),
            role: Role::Committee,
            team_id: None,
        }
    }

    /// Committee members and admins may close, compile, commit, and cancel rounds.
    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Committee | Role::Admin)
    }
}
