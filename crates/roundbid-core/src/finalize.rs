// Finalization committer: apply or discard a round's pending allocations.
//
// Both operations run entirely inside the caller's transaction; an error
// from `commit` must roll back everything it touched.

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocation::{self, PendingAllocation};
use crate::audit::{self, AuditAction, AuditOutcome, NewAuditEntry};
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::ledger;
use crate::model::{RoundId, RoundStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Applied,
    /// Nothing was pending; the round was left untouched.
    NoOp,
}

/// One applied allocation as written to the settlement log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub team_id: String,
    pub player_id: String,
    pub amount: u32,
    pub balance_before: u32,
    pub balance_after: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub round_id: RoundId,
    pub outcome: CommitOutcome,
    pub settlements: Vec<Settlement>,
    pub total_spent: u64,
}

impl CommitResult {
    pub fn allocation_count(&self) -> usize {
        self.settlements.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResult {
    pub round_id: RoundId,
    pub cancelled: usize,
}

/// Apply every pending allocation of the round, or none of them.
pub(crate) fn commit(conn: &Connection, round_id: RoundId, actor: &str, at: DateTime<Utc>) -> EngineResult<CommitResult> {
    let round = db::load_round(conn, round_id)?.ok_or(EngineError::RoundNotFound(round_id))?;
    let pending = allocation::load_pending(conn, round_id)?;

    if pending.is_empty() {
        audit::record(
            conn,
            NewAuditEntry {
                actor,
                action: AuditAction::Commit,
                round_id,
                allocation_count: 0,
                outcome: AuditOutcome::NoOp,
                detail: None,
            },
        )?;
        info!("Commit of round {round_id} by {actor}: nothing pending");
        return Ok(CommitResult {
            round_id,
            outcome: CommitOutcome::NoOp,
            settlements: Vec::new(),
            total_spent: 0,
        });
    }

    if round.status != RoundStatus::PendingFinalization {
        return Err(EngineError::InvalidRoundStatus {
            round_id,
            status: round.status,
            expected: RoundStatus::PendingFinalization.to_string(),
        });
    }

    validate_budgets(conn, round_id, &pending)?;

    let mut settlements = Vec::with_capacity(pending.len());
    for allocation in &pending {
        let settlement = apply_one(conn, allocation, at).map_err(|e| EngineError::CommitFailed {
            round_id,
            reason: format!("player {}: {e:#}", allocation.player_id),
        })?;
        settlements.push(settlement);
    }

    let winning: Vec<_> = pending.iter().filter_map(|a| a.bid_id).collect();
    ledger::mark_outcomes(conn, round_id, &winning)?;
    db::set_round_status(conn, round_id, RoundStatus::Completed)?;
    allocation::delete_pending(conn, round_id)?;

    let total_spent: u64 = settlements.iter().map(|s| u64::from(s.amount)).sum();
    audit::record(
        conn,
        NewAuditEntry {
            actor,
            action: AuditAction::Commit,
            round_id,
            allocation_count: settlements.len(),
            outcome: AuditOutcome::Applied,
            detail: Some(format!("total spent {total_spent}")),
        },
    )?;

    info!(
        "Committed round {round_id} by {actor}: {} allocation(s), {total_spent} spent",
        settlements.len()
    );

    Ok(CommitResult {
        round_id,
        outcome: CommitOutcome::Applied,
        settlements,
        total_spent,
    })
}

/// Check every team can afford its whole share before touching anything.
/// All shortfalls are reported together.
fn validate_budgets(conn: &Connection, round_id: RoundId, pending: &[PendingAllocation]) -> EngineResult<()> {
    let mut required: BTreeMap<&str, u64> = BTreeMap::new();
    for allocation in pending {
        *required.entry(allocation.team_id.as_str()).or_default() += u64::from(allocation.amount);
    }

    let mut errors = Vec::new();
    for (team_id, needed) in required {
        match db::load_team(conn, team_id)? {
            None => errors.push(format!("team {team_id} has no budget entry")),
            Some(team) if u64::from(team.balance) < needed => errors.push(format!(
                "team {team_id} needs {needed} but has {} (short by {})",
                team.balance,
                needed - u64::from(team.balance)
            )),
            Some(_) => {}
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::BudgetValidation { round_id, errors })
    }
}

fn apply_one(conn: &Connection, allocation: &PendingAllocation, at: DateTime<Utc>) -> anyhow::Result<Settlement> {
    let team = db::load_team(conn, &allocation.team_id)?
        .with_context(|| format!("team {} has no budget entry", allocation.team_id))?;

    let updated = conn
        .execute(
            "UPDATE teams
             SET balance = balance - ?1,
                 total_spent = total_spent + ?1,
                 players_count = players_count + 1
             WHERE team_id = ?2 AND balance >= ?1",
            params![allocation.amount, allocation.team_id],
        )
        .context("failed to deduct budget")?;
    anyhow::ensure!(
        updated == 1,
        "team {} cannot afford {}",
        allocation.team_id,
        allocation.amount
    );

    let acquired_at = at.to_rfc3339();
    conn.execute(
        "INSERT INTO player_assignments (player_id, team_id, round_id, purchase_price, acquired_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            allocation.player_id,
            allocation.team_id,
            allocation.round_id,
            allocation.amount,
            acquired_at,
        ],
    )
    .context("failed to assign player")?;

    let balance_after = team.balance - allocation.amount;
    conn.execute(
        "INSERT INTO settlements
            (round_id, team_id, player_id, amount, balance_before, balance_after, settled_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            allocation.round_id,
            allocation.team_id,
            allocation.player_id,
            allocation.amount,
            team.balance,
            balance_after,
            acquired_at,
        ],
    )
    .context("failed to write settlement")?;

    Ok(Settlement {
        team_id: allocation.team_id.clone(),
        player_id: allocation.player_id.clone(),
        amount: allocation.amount,
        balance_before: team.balance,
        balance_after,
    })
}

/// Discard the round's pending set and mark the round expired.
pub(crate) fn cancel(conn: &Connection, round_id: RoundId, actor: &str) -> EngineResult<CancelResult> {
    db::load_round(conn, round_id)?.ok_or(EngineError::RoundNotFound(round_id))?;

    let cancelled = allocation::delete_pending(conn, round_id)?;
    if cancelled == 0 {
        return Err(EngineError::NoPendingAllocations(round_id));
    }

    db::set_round_status(conn, round_id, RoundStatus::ExpiredPendingFinalization)?;
    audit::record(
        conn,
        NewAuditEntry {
            actor,
            action: AuditAction::Cancel,
            round_id,
            allocation_count: cancelled,
            outcome: AuditOutcome::Cancelled,
            detail: None,
        },
    )?;

    info!("Cancelled {cancelled} pending allocation(s) for round {round_id} by {actor}");
    Ok(CancelResult { round_id, cancelled })
}

/// Settlement rows written for a round, in commit order.
pub fn settlements_for_round(conn: &Connection, round_id: RoundId) -> EngineResult<Vec<Settlement>> {
    let mut stmt = conn
        .prepare(
            "SELECT team_id, player_id, amount, balance_before, balance_after
             FROM settlements WHERE round_id = ?1 ORDER BY id",
        )
        .context("failed to prepare settlements query")?;
    let rows = stmt
        .query_map(params![round_id], |row| {
            Ok(Settlement {
                team_id: row.get(0)?,
                player_id: row.get(1)?,
                amount: row.get(2)?,
                balance_before: row.get(3)?,
                balance_after: row.get(4)?,
            })
        })
        .context("failed to query settlements")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map settlement rows")?;
    Ok(rows)
}
