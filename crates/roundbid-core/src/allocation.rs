// Allocation compiler: merge settled bids and resolved tiebreakers into the
// round's pending allocation set.

use std::collections::HashSet;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{self, enum_at, timestamp_at};
use crate::error::{EngineError, EngineResult};
use crate::model::{BidId, RoundId, RoundStatus};
use crate::ties;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPhase {
    /// Settled by sealed bidding without contest.
    Regular,
    /// Settled by a tiebreaker auction.
    Incomplete,
}

impl AllocationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPhase::Regular => "regular",
            AllocationPhase::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(AllocationPhase::Regular),
            "incomplete" => Some(AllocationPhase::Incomplete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAllocation {
    pub id: i64,
    pub round_id: RoundId,
    pub team_id: String,
    pub player_id: String,
    pub amount: u32,
    pub phase: AllocationPhase,
    /// The sealed bid this allocation came from, if any.
    pub bid_id: Option<BidId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub total_players: usize,
    pub total_spent: u64,
    pub average_bid: u64,
}

impl AllocationSummary {
    pub fn of(allocations: &[PendingAllocation]) -> Self {
        let total_players = allocations.len();
        if total_players == 0 {
            return Self::default();
        }
        let total_spent: u64 = allocations.iter().map(|a| u64::from(a.amount)).sum();
        let n = total_players as u64;
        // Round half up.
        let average_bid = (total_spent * 2 + n) / (2 * n);
        Self {
            total_players,
            total_spent,
            average_bid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAllocations {
    pub round_id: RoundId,
    pub allocations: Vec<PendingAllocation>,
    pub summary: AllocationSummary,
}

/// Sort for presentation: highest amount first, then by player id.
pub fn sort_for_display(allocations: &mut [PendingAllocation]) {
    allocations.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.player_id.cmp(&b.player_id)));
}

/// Recompute the pending set of a round, replacing any previous one, and
/// move the round to `pending_finalization`.
pub(crate) fn compile(conn: &Connection, round_id: RoundId, at: DateTime<Utc>) -> EngineResult<Vec<PendingAllocation>> {
    let round = db::load_round(conn, round_id)?.ok_or(EngineError::RoundNotFound(round_id))?;
    if !round.status.can_compile() {
        return Err(EngineError::InvalidRoundStatus {
            round_id,
            status: round.status,
            expected: "closed, pending_finalization, expired_pending_finalization".into(),
        });
    }

    let detection = ties::detect(conn, round_id, at)?;
    let report = &detection.report;

    // Players sold by another round since bidding closed can never be
    // assigned here; they are left out so the rest of the round can commit.
    let mut sold = HashSet::new();
    for player_id in detection.standings.keys() {
        if db::load_assignment(conn, player_id)?.is_some() {
            sold.insert(player_id.as_str());
        }
    }
    if !sold.is_empty() {
        warn!("Round {round_id}: skipping already assigned player(s) {sold:?}");
    }

    let active = report
        .tiebreakers
        .iter()
        .filter(|t| t.is_active() && !sold.contains(t.player_id.as_str()))
        .count();
    if active > 0 {
        return Err(EngineError::IncompleteTiebreakers { round_id, active });
    }

    let mut entries: Vec<(String, String, u32, AllocationPhase, Option<BidId>)> = report
        .settled
        .iter()
        .map(|s| {
            (
                s.team_id.clone(),
                s.player_id.clone(),
                s.amount,
                AllocationPhase::Regular,
                Some(s.bid_id),
            )
        })
        .collect();

    entries.retain(|(_, player_id, ..)| !sold.contains(player_id.as_str()));

    for tb in &report.tiebreakers {
        if sold.contains(tb.player_id.as_str()) {
            continue;
        }
        let Some(resolution) = tb.resolution() else {
            continue;
        };
        let sealed_bid = detection
            .standings
            .get(&tb.player_id)
            .and_then(|s| s.leaders.iter().find(|l| l.team_id == resolution.winner_team))
            .map(|l| l.bid_id);
        entries.push((
            resolution.winner_team,
            tb.player_id.clone(),
            resolution.final_amount,
            AllocationPhase::Incomplete,
            sealed_bid,
        ));
    }

    conn.execute(
        "DELETE FROM pending_allocations WHERE round_id = ?1",
        params![round_id],
    )
    .context("failed to clear previous pending allocations")?;

    let created_at = at.to_rfc3339();
    let mut allocations = Vec::with_capacity(entries.len());
    for (team_id, player_id, amount, phase, bid_id) in entries {
        let id: i64 = conn
            .query_row(
                "INSERT INTO pending_allocations
                    (round_id, team_id, player_id, amount, phase, bid_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 RETURNING id",
                params![round_id, team_id, player_id, amount, phase.as_str(), bid_id, created_at],
                |row| row.get(0),
            )
            .context("failed to insert pending allocation")?;
        allocations.push(PendingAllocation {
            id,
            round_id,
            team_id,
            player_id,
            amount,
            phase,
            bid_id,
            created_at: at,
        });
    }

    db::set_round_status(conn, round_id, RoundStatus::PendingFinalization)?;

    sort_for_display(&mut allocations);
    info!(
        "Compiled {} pending allocation(s) for round {round_id}",
        allocations.len()
    );
    Ok(allocations)
}

/// The stored pending set of a round, in insertion order.
pub fn load_pending(conn: &Connection, round_id: RoundId) -> EngineResult<Vec<PendingAllocation>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, round_id, team_id, player_id, amount, phase, bid_id, created_at
             FROM pending_allocations WHERE round_id = ?1 ORDER BY id",
        )
        .context("failed to prepare pending allocations query")?;
    let rows = stmt
        .query_map(params![round_id], |row| {
            Ok(PendingAllocation {
                id: row.get(0)?,
                round_id: row.get(1)?,
                team_id: row.get(2)?,
                player_id: row.get(3)?,
                amount: row.get(4)?,
                phase: enum_at(row, 5, AllocationPhase::parse)?,
                bid_id: row.get(6)?,
                created_at: timestamp_at(row, 7)?,
            })
        })
        .context("failed to query pending allocations")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map pending allocation rows")?;
    Ok(rows)
}

pub(crate) fn delete_pending(conn: &Connection, round_id: RoundId) -> EngineResult<usize> {
    let n = conn
        .execute(
            "DELETE FROM pending_allocations WHERE round_id = ?1",
            params![round_id],
        )
        .context("failed to delete pending allocations")?;
    Ok(n)
}
