// Tiebreaker auction: a live open-ascending auction for one contested player.
//
// The state machine is pure (`Tiebreaker::place_bid` / `Tiebreaker::withdraw`);
// the functions at the bottom of this module load and persist it. Callers
// must hold the tiebreaker's lock from `load` through `save`.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::{enum_at, opt_timestamp_at, timestamp_at};
use crate::error::{EngineError, EngineResult};
use crate::model::{RoundId, TiebreakerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiebreakerStatus {
    Active,
    Resolved,
}

impl TiebreakerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TiebreakerStatus::Active => "active",
            TiebreakerStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TiebreakerStatus::Active),
            "resolved" => Some(TiebreakerStatus::Resolved),
            _ => None,
        }
    }
}

/// One tied team's state inside a tiebreaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub team_id: String,
    /// Last live bid placed by this team, if any.
    pub current_bid: Option<u32>,
    pub withdrawn: bool,
    /// Team balance when the tiebreaker was created; caps live bids.
    pub balance_snapshot: u32,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tiebreaker {
    pub id: TiebreakerId,
    pub round_id: RoundId,
    pub player_id: String,
    pub original_amount: u32,
    pub current_highest_bid: u32,
    pub current_highest_bidder: Option<String>,
    pub status: TiebreakerStatus,
    pub winner_team_id: Option<String>,
    pub final_amount: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub winner_team: String,
    pub final_amount: u32,
}

/// Result of a live bid. A race loss is not an error: the caller gets the
/// authoritative highest bid back and decides whether to resubmit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlaceBidOutcome {
    Accepted {
        amount: u32,
        previous_highest: u32,
        timestamp: DateTime<Utc>,
    },
    Superseded {
        submitted: u32,
        current_highest_bid: u32,
        current_highest_bidder: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawOutcome {
    pub team_id: String,
    pub teams_remaining: usize,
    pub current_highest_bid: u32,
    pub current_highest_bidder: Option<String>,
    /// Present when this withdrawal left a single participant.
    pub resolution: Option<Resolution>,
}

/// One entry of a tiebreaker's live bid stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiebreakerBid {
    pub team_id: String,
    pub amount: u32,
    pub placed_at: DateTime<Utc>,
}

impl Tiebreaker {
    /// Build an unsaved tiebreaker for `teams` (team id, balance) tied at
    /// `amount`. The id is assigned by [`insert`].
    pub fn seed(
        round_id: RoundId,
        player_id: &str,
        amount: u32,
        teams: Vec<(String, u32)>,
        at: DateTime<Utc>,
    ) -> EngineResult<Self> {
        if teams.len() < 2 {
            return Err(anyhow::anyhow!(
                "a tiebreaker for {player_id} needs at least two teams, got {}",
                teams.len()
            )
            .into());
        }
        Ok(Tiebreaker {
            id: 0,
            round_id,
            player_id: player_id.to_string(),
            original_amount: amount,
            current_highest_bid: amount,
            current_highest_bidder: None,
            status: TiebreakerStatus::Active,
            winner_team_id: None,
            final_amount: None,
            created_at: at,
            resolved_at: None,
            participants: teams
                .into_iter()
                .map(|(team_id, balance)| Participant {
                    team_id,
                    current_bid: None,
                    withdrawn: false,
                    balance_snapshot: balance,
                    withdrawn_at: None,
                })
                .collect(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == TiebreakerStatus::Active
    }

    pub fn active_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| !p.withdrawn)
    }

    pub fn teams_remaining(&self) -> usize {
        self.active_participants().count()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        match (&self.winner_team_id, self.final_amount) {
            (Some(team), Some(amount)) => Some(Resolution {
                winner_team: team.clone(),
                final_amount: amount,
            }),
            _ => None,
        }
    }

    fn active_participant_index(&self, team_id: &str) -> EngineResult<usize> {
        if !self.is_active() {
            return Err(EngineError::AlreadyResolved(self.id));
        }
        self.participants
            .iter()
            .position(|p| p.team_id == team_id && !p.withdrawn)
            .ok_or_else(|| EngineError::NotParticipant {
                team_id: team_id.to_string(),
                tiebreaker_id: self.id,
            })
    }

    /// Compare-and-set a live bid against the current highest bid.
    ///
    /// `seen_highest` is the highest bid the caller was looking at. An amount
    /// that was not above even that value is invalid input; an amount that
    /// beat the caller's view but not the current value lost a race and is
    /// reported as [`PlaceBidOutcome::Superseded`].
    pub fn place_bid(
        &mut self,
        team_id: &str,
        amount: u32,
        seen_highest: Option<u32>,
        at: DateTime<Utc>,
    ) -> EngineResult<PlaceBidOutcome> {
        let idx = self.active_participant_index(team_id)?;

        if amount == 0 {
            return Err(EngineError::InvalidAmount {
                amount: 0,
                reason: "must be positive".into(),
                current_highest_bid: Some(self.current_highest_bid),
            });
        }

        if amount <= self.current_highest_bid {
            if seen_highest.is_some_and(|seen| amount <= seen) {
                return Err(EngineError::InvalidAmount {
                    amount: i64::from(amount),
                    reason: format!("must exceed the current highest bid of {}", self.current_highest_bid),
                    current_highest_bid: Some(self.current_highest_bid),
                });
            }
            return Ok(PlaceBidOutcome::Superseded {
                submitted: amount,
                current_highest_bid: self.current_highest_bid,
                current_highest_bidder: self.current_highest_bidder.clone(),
            });
        }

        let participant = &mut self.participants[idx];
        if amount > participant.balance_snapshot {
            return Err(EngineError::InsufficientBalance {
                amount,
                balance: participant.balance_snapshot,
            });
        }

        participant.current_bid = Some(amount);
        let previous_highest = self.current_highest_bid;
        self.current_highest_bid = amount;
        self.current_highest_bidder = Some(team_id.to_string());

        Ok(PlaceBidOutcome::Accepted {
            amount,
            previous_highest,
            timestamp: at,
        })
    }

    /// Withdraw a team. When one participant remains the tiebreaker resolves
    /// in the same transition; the returned outcome already reflects it.
    pub fn withdraw(&mut self, team_id: &str, at: DateTime<Utc>) -> EngineResult<WithdrawOutcome> {
        let idx = self.active_participant_index(team_id)?;
        let participant = &mut self.participants[idx];
        participant.withdrawn = true;
        participant.withdrawn_at = Some(at);

        if self.current_highest_bidder.as_deref() == Some(team_id) {
            self.recompute_leader();
        }

        let remaining = self.teams_remaining();
        let resolution = if remaining == 1 {
            Some(self.resolve(at))
        } else {
            None
        };

        Ok(WithdrawOutcome {
            team_id: team_id.to_string(),
            teams_remaining: remaining,
            current_highest_bid: self.current_highest_bid,
            current_highest_bidder: self.current_highest_bidder.clone(),
            resolution,
        })
    }

    /// Point the leader at the best remaining live bid, or back at the
    /// original tied amount with no bidder when nobody else has bid.
    fn recompute_leader(&mut self) {
        let best = self
            .active_participants()
            .filter_map(|p| p.current_bid.map(|bid| (bid, p.team_id.clone())))
            .max_by_key(|(bid, _)| *bid);
        match best {
            Some((bid, team)) => {
                self.current_highest_bid = bid;
                self.current_highest_bidder = Some(team);
            }
            None => {
                self.current_highest_bid = self.original_amount;
                self.current_highest_bidder = None;
            }
        }
    }

    fn resolve(&mut self, at: DateTime<Utc>) -> Resolution {
        let (winner, amount) = self
            .active_participants()
            .next()
            .map(|p| (p.team_id.clone(), p.current_bid.unwrap_or(self.original_amount)))
            .unwrap_or_else(|| (String::new(), self.original_amount));

        self.status = TiebreakerStatus::Resolved;
        self.current_highest_bid = amount;
        self.current_highest_bidder = Some(winner.clone());
        self.winner_team_id = Some(winner.clone());
        self.final_amount = Some(amount);
        self.resolved_at = Some(at);

        Resolution {
            winner_team: winner,
            final_amount: amount,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Insert a seeded tiebreaker and its participants, returning the stored copy.
pub(crate) fn insert(conn: &Connection, tiebreaker: &Tiebreaker) -> EngineResult<Tiebreaker> {
    let id: TiebreakerId = conn
        .query_row(
            "INSERT INTO tiebreakers
                (round_id, player_id, original_amount, current_highest_bid,
                 current_highest_bidder, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             RETURNING id",
            params![
                tiebreaker.round_id,
                tiebreaker.player_id,
                tiebreaker.original_amount,
                tiebreaker.current_highest_bid,
                tiebreaker.current_highest_bidder,
                tiebreaker.status.as_str(),
                tiebreaker.created_at.to_rfc3339(),
            ],
            |row| row.get(0),
        )
        .context("failed to insert tiebreaker")?;

    for p in &tiebreaker.participants {
        conn.execute(
            "INSERT INTO tiebreaker_participants
                (tiebreaker_id, team_id, current_bid, withdrawn, balance_snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, p.team_id, p.current_bid, p.withdrawn, p.balance_snapshot],
        )
        .context("failed to insert tiebreaker participant")?;
    }

    Ok(Tiebreaker {
        id,
        ..tiebreaker.clone()
    })
}

/// Persist the mutable parts of a tiebreaker after a transition.
pub(crate) fn save(conn: &Connection, tiebreaker: &Tiebreaker) -> EngineResult<()> {
    conn.execute(
        "UPDATE tiebreakers SET
            current_highest_bid = ?1,
            current_highest_bidder = ?2,
            status = ?3,
            winner_team_id = ?4,
            final_amount = ?5,
            resolved_at = ?6
         WHERE id = ?7",
        params![
            tiebreaker.current_highest_bid,
            tiebreaker.current_highest_bidder,
            tiebreaker.status.as_str(),
            tiebreaker.winner_team_id,
            tiebreaker.final_amount,
            tiebreaker.resolved_at.map(|t| t.to_rfc3339()),
            tiebreaker.id,
        ],
    )
    .context("failed to update tiebreaker")?;

    for p in &tiebreaker.participants {
        conn.execute(
            "UPDATE tiebreaker_participants
             SET current_bid = ?1, withdrawn = ?2, withdrawn_at = ?3
             WHERE tiebreaker_id = ?4 AND team_id = ?5",
            params![
                p.current_bid,
                p.withdrawn,
                p.withdrawn_at.map(|t| t.to_rfc3339()),
                tiebreaker.id,
                p.team_id,
            ],
        )
        .context("failed to update tiebreaker participant")?;
    }
    Ok(())
}

pub(crate) fn append_history(
    conn: &Connection,
    tiebreaker_id: TiebreakerId,
    team_id: &str,
    amount: u32,
    at: DateTime<Utc>,
) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO tiebreaker_bids (tiebreaker_id, team_id, amount, placed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![tiebreaker_id, team_id, amount, at.to_rfc3339()],
    )
    .context("failed to append tiebreaker bid")?;
    Ok(())
}

const TIEBREAKER_COLUMNS: &str = "id, round_id, player_id, original_amount, current_highest_bid,
     current_highest_bidder, status, winner_team_id, final_amount, created_at, resolved_at";

fn map_tiebreaker(row: &Row<'_>) -> rusqlite::Result<Tiebreaker> {
    Ok(Tiebreaker {
        id: row.get(0)?,
        round_id: row.get(1)?,
        player_id: row.get(2)?,
        original_amount: row.get(3)?,
        current_highest_bid: row.get(4)?,
        current_highest_bidder: row.get(5)?,
        status: enum_at(row, 6, TiebreakerStatus::parse)?,
        winner_team_id: row.get(7)?,
        final_amount: row.get(8)?,
        created_at: timestamp_at(row, 9)?,
        resolved_at: opt_timestamp_at(row, 10)?,
        participants: Vec::new(),
    })
}

fn load_participants(conn: &Connection, tiebreaker_id: TiebreakerId) -> EngineResult<Vec<Participant>> {
    let mut stmt = conn
        .prepare(
            "SELECT team_id, current_bid, withdrawn, balance_snapshot, withdrawn_at
             FROM tiebreaker_participants WHERE tiebreaker_id = ?1 ORDER BY team_id",
        )
        .context("failed to prepare participants query")?;
    let participants = stmt
        .query_map(params![tiebreaker_id], |row| {
            Ok(Participant {
                team_id: row.get(0)?,
                current_bid: row.get(1)?,
                withdrawn: row.get(2)?,
                balance_snapshot: row.get(3)?,
                withdrawn_at: opt_timestamp_at(row, 4)?,
            })
        })
        .context("failed to query participants")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map participant rows")?;
    Ok(participants)
}

pub fn load(conn: &Connection, tiebreaker_id: TiebreakerId) -> EngineResult<Option<Tiebreaker>> {
    let row = conn
        .query_row(
            &format!("SELECT {TIEBREAKER_COLUMNS} FROM tiebreakers WHERE id = ?1"),
            params![tiebreaker_id],
            map_tiebreaker,
        )
        .optional()
        .context("failed to load tiebreaker")?;
    match row {
        Some(mut tiebreaker) => {
            tiebreaker.participants = load_participants(conn, tiebreaker.id)?;
            Ok(Some(tiebreaker))
        }
        None => Ok(None),
    }
}

pub fn find_for_player(conn: &Connection, round_id: RoundId, player_id: &str) -> EngineResult<Option<Tiebreaker>> {
    let id: Option<TiebreakerId> = conn
        .query_row(
            "SELECT id FROM tiebreakers WHERE round_id = ?1 AND player_id = ?2",
            params![round_id, player_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up tiebreaker by player")?;
    match id {
        Some(id) => load(conn, id),
        None => Ok(None),
    }
}

pub fn for_round(conn: &Connection, round_id: RoundId) -> EngineResult<Vec<Tiebreaker>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TIEBREAKER_COLUMNS} FROM tiebreakers WHERE round_id = ?1 ORDER BY id"
        ))
        .context("failed to prepare tiebreakers query")?;
    let mut tiebreakers = stmt
        .query_map(params![round_id], map_tiebreaker)
        .context("failed to query tiebreakers")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map tiebreaker rows")?;
    for tiebreaker in &mut tiebreakers {
        tiebreaker.participants = load_participants(conn, tiebreaker.id)?;
    }
    Ok(tiebreakers)
}

/// Active tiebreakers in which `team_id` is still bidding.
pub fn active_for_team(conn: &Connection, team_id: &str) -> EngineResult<Vec<TiebreakerId>> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id FROM tiebreakers t
             JOIN tiebreaker_participants p ON p.tiebreaker_id = t.id
             WHERE p.team_id = ?1 AND p.withdrawn = 0 AND t.status = 'active'
             ORDER BY t.created_at DESC, t.id DESC",
        )
        .context("failed to prepare active_for_team query")?;
    let ids = stmt
        .query_map(params![team_id], |row| row.get(0))
        .context("failed to query team tiebreakers")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map tiebreaker ids")?;
    Ok(ids)
}

pub fn history(conn: &Connection, tiebreaker_id: TiebreakerId) -> EngineResult<Vec<TiebreakerBid>> {
    let mut stmt = conn
        .prepare(
            "SELECT team_id, amount, placed_at FROM tiebreaker_bids
             WHERE tiebreaker_id = ?1 ORDER BY id",
        )
        .context("failed to prepare history query")?;
    let bids = stmt
        .query_map(params![tiebreaker_id], |row| {
            Ok(TiebreakerBid {
                team_id: row.get(0)?,
                amount: row.get(1)?,
                placed_at: timestamp_at(row, 2)?,
            })
        })
        .context("failed to query tiebreaker history")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map tiebreaker history rows")?;
    Ok(bids)
}
