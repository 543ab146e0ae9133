// Bid ledger: append-only sealed bids and highest-bid standings.

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::info;

use crate::db::{self, enum_at, timestamp_at};
use crate::error::{EngineError, EngineResult};
use crate::model::{BidId, BidRecord, BidStatus, HighestBid, RoundId, RoundStatus};

/// A team's bid that counts for a player: its highest amount, and among
/// equal amounts the latest submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveBid {
    pub bid_id: BidId,
    pub team_id: String,
    pub player_id: String,
    pub amount: u32,
}

/// The top of the board for one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStanding {
    pub player_id: String,
    pub amount: u32,
    /// Every team holding the maximum, sorted by team id.
    pub leaders: Vec<EffectiveBid>,
}

impl PlayerStanding {
    pub fn is_tie(&self) -> bool {
        self.leaders.len() > 1
    }

    pub fn highest(&self) -> HighestBid {
        HighestBid {
            amount: self.amount,
            teams: self.leaders.iter().map(|b| b.team_id.clone()).collect(),
        }
    }
}

/// Validate and append one sealed bid. Balances are read, never written.
pub fn submit_bid(
    conn: &Connection,
    round_id: RoundId,
    team_id: &str,
    player_id: &str,
    amount: u32,
    at: DateTime<Utc>,
) -> EngineResult<BidRecord> {
    let round = db::load_round(conn, round_id)?.ok_or(EngineError::RoundNotFound(round_id))?;
    if round.status != RoundStatus::Active {
        return Err(EngineError::RoundNotActive {
            round_id,
            status: round.status,
        });
    }

    if amount == 0 {
        return Err(EngineError::InvalidAmount {
            amount: 0,
            reason: "must be positive".into(),
            current_highest_bid: None,
        });
    }
    if amount % round.bid_increment != 0 {
        return Err(EngineError::InvalidAmount {
            amount: i64::from(amount),
            reason: format!("must be a multiple of {}", round.bid_increment),
            current_highest_bid: None,
        });
    }

    let team = db::load_team(conn, team_id)?
        .ok_or_else(|| EngineError::UnknownTeam(team_id.to_string()))?;

    if let Some(assignment) = db::load_assignment(conn, player_id)? {
        return Err(EngineError::PlayerUnavailable {
            player_id: player_id.to_string(),
            team_id: assignment.team_id,
        });
    }

    if amount > team.balance {
        return Err(EngineError::InsufficientBalance {
            amount,
            balance: team.balance,
        });
    }

    // The limit counts distinct players; raising an existing bid is free.
    let already_bid_on_player: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM bids WHERE round_id = ?1 AND team_id = ?2 AND player_id = ?3)",
            params![round_id, team_id, player_id],
            |row| row.get(0),
        )
        .context("failed to check existing bids")?;
    if !already_bid_on_player {
        let players_bid: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT player_id) FROM bids WHERE round_id = ?1 AND team_id = ?2",
                params![round_id, team_id],
                |row| row.get(0),
            )
            .context("failed to count team bids")?;
        if players_bid >= i64::from(round.max_bids_per_team) {
            return Err(EngineError::BidLimitExceeded {
                team_id: team_id.to_string(),
                round_id,
                limit: round.max_bids_per_team,
            });
        }
    }

    let id: BidId = conn
        .query_row(
            "INSERT INTO bids (round_id, team_id, player_id, amount, status, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING id",
            params![
                round_id,
                team_id,
                player_id,
                amount,
                BidStatus::Active.as_str(),
                at.to_rfc3339()
            ],
            |row| row.get(0),
        )
        .context("failed to insert bid")?;

    info!("Bid #{id}: team {team_id} bid {amount} on {player_id} in round {round_id}");

    Ok(BidRecord {
        id,
        round_id,
        team_id: team_id.to_string(),
        player_id: player_id.to_string(),
        amount,
        status: BidStatus::Active,
        submitted_at: at,
    })
}

fn map_bid(row: &Row<'_>) -> rusqlite::Result<BidRecord> {
    Ok(BidRecord {
        id: row.get(0)?,
        round_id: row.get(1)?,
        team_id: row.get(2)?,
        player_id: row.get(3)?,
        amount: row.get(4)?,
        status: enum_at(row, 5, BidStatus::parse)?,
        submitted_at: timestamp_at(row, 6)?,
    })
}

/// All bids of a round, in submission order.
pub fn bids_for_round(conn: &Connection, round_id: RoundId) -> EngineResult<Vec<BidRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, round_id, team_id, player_id, amount, status, submitted_at
             FROM bids WHERE round_id = ?1 ORDER BY id",
        )
        .context("failed to prepare bids_for_round query")?;
    let bids = stmt
        .query_map(params![round_id], map_bid)
        .context("failed to query bids")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map bid rows")?;
    Ok(bids)
}

pub fn bids_for_team(conn: &Connection, round_id: RoundId, team_id: &str) -> EngineResult<Vec<BidRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, round_id, team_id, player_id, amount, status, submitted_at
             FROM bids WHERE round_id = ?1 AND team_id = ?2 ORDER BY id",
        )
        .context("failed to prepare bids_for_team query")?;
    let bids = stmt
        .query_map(params![round_id, team_id], map_bid)
        .context("failed to query team bids")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map bid rows")?;
    Ok(bids)
}

/// Collapse raw bids to one effective bid per (player, team).
pub fn effective_bids(bids: &[BidRecord]) -> Vec<EffectiveBid> {
    let mut best: BTreeMap<(&str, &str), &BidRecord> = BTreeMap::new();
    for bid in bids {
        let key = (bid.player_id.as_str(), bid.team_id.as_str());
        match best.get(&key) {
            Some(current) if (current.amount, current.id) >= (bid.amount, bid.id) => {}
            _ => {
                best.insert(key, bid);
            }
        }
    }
    best.into_values()
        .map(|b| EffectiveBid {
            bid_id: b.id,
            team_id: b.team_id.clone(),
            player_id: b.player_id.clone(),
            amount: b.amount,
        })
        .collect()
}

/// Per-player standings keyed by player id. Ties are exact equality at the
/// maximum effective amount.
pub fn standings(bids: &[BidRecord]) -> BTreeMap<String, PlayerStanding> {
    let mut out: BTreeMap<String, PlayerStanding> = BTreeMap::new();
    for bid in effective_bids(bids) {
        let standing = out
            .entry(bid.player_id.clone())
            .or_insert_with(|| PlayerStanding {
                player_id: bid.player_id.clone(),
                amount: bid.amount,
                leaders: Vec::new(),
            });
        if bid.amount > standing.amount {
            standing.amount = bid.amount;
            standing.leaders = vec![bid];
        } else if bid.amount == standing.amount {
            standing.leaders.push(bid);
        }
    }
    for standing in out.values_mut() {
        standing.leaders.sort_by(|a, b| a.team_id.cmp(&b.team_id));
    }
    out
}

pub fn highest_bid_for(conn: &Connection, round_id: RoundId, player_id: &str) -> EngineResult<Option<HighestBid>> {
    let bids: Vec<BidRecord> = bids_for_round(conn, round_id)?
        .into_iter()
        .filter(|b| b.player_id == player_id)
        .collect();
    Ok(standings(&bids).remove(player_id).map(|s| s.highest()))
}

/// Mark the given bids `won` and every other bid of the round `lost`.
pub(crate) fn mark_outcomes(conn: &Connection, round_id: RoundId, winning: &[BidId]) -> EngineResult<()> {
    conn.execute(
        "UPDATE bids SET status = ?1 WHERE round_id = ?2",
        params![BidStatus::Lost.as_str(), round_id],
    )
    .context("failed to mark losing bids")?;
    for bid_id in winning {
        conn.execute(
            "UPDATE bids SET status = ?1 WHERE id = ?2 AND round_id = ?3",
            params![BidStatus::Won.as_str(), bid_id, round_id],
        )
        .context("failed to mark winning bid")?;
    }
    Ok(())
}
