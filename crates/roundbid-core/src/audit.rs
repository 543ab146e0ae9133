// Audit trail for privileged round operations.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::{enum_at, timestamp_at};
use crate::error::EngineResult;
use crate::model::RoundId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CloseRound,
    Compile,
    Commit,
    Cancel,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CloseRound => "close_round",
            AuditAction::Compile => "compile",
            AuditAction::Commit => "commit",
            AuditAction::Cancel => "cancel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "close_round" => Some(AuditAction::CloseRound),
            "compile" => Some(AuditAction::Compile),
            "commit" => Some(AuditAction::Commit),
            "cancel" => Some(AuditAction::Cancel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    NoOp,
    Cancelled,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Applied => "applied",
            AuditOutcome::NoOp => "no_op",
            AuditOutcome::Cancelled => "cancelled",
            AuditOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(AuditOutcome::Applied),
            "no_op" => Some(AuditOutcome::NoOp),
            "cancelled" => Some(AuditOutcome::Cancelled),
            "failed" => Some(AuditOutcome::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    pub action: AuditAction,
    pub round_id: RoundId,
    pub allocation_count: usize,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An audit row about to be written.
#[derive(Debug, Clone)]
pub struct NewAuditEntry<'a> {
    pub actor: &'a str,
    pub action: AuditAction,
    pub round_id: RoundId,
    pub allocation_count: usize,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
}

/// Append an entry. Call inside the transaction that makes the audited
/// change so both land or neither does.
pub(crate) fn record(conn: &Connection, entry: NewAuditEntry<'_>) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO audit_log (actor, action, round_id, allocation_count, outcome, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.actor,
            entry.action.as_str(),
            entry.round_id,
            entry.allocation_count as i64,
            entry.outcome.as_str(),
            entry.detail,
            Utc::now().to_rfc3339(),
        ],
    )
    .context("failed to write audit entry")?;
    Ok(())
}

/// Entries for a round, oldest first.
pub fn audit_log(conn: &Connection, round_id: RoundId) -> EngineResult<Vec<AuditEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, actor, action, round_id, allocation_count, outcome, detail, created_at
             FROM audit_log WHERE round_id = ?1 ORDER BY id",
        )
        .context("failed to prepare audit query")?;
    let entries = stmt
        .query_map(params![round_id], |row| {
            let count: i64 = row.get(4)?;
            Ok(AuditEntry {
                id: row.get(0)?,
                actor: row.get(1)?,
                action: enum_at(row, 2, AuditAction::parse)?,
                round_id: row.get(3)?,
                allocation_count: usize::try_from(count).unwrap_or(0),
                outcome: enum_at(row, 5, AuditOutcome::parse)?,
                detail: row.get(6)?,
                created_at: timestamp_at(row, 7)?,
            })
        })
        .context("failed to query audit log")?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to map audit rows")?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn records_and_reads_back_in_order() {
        let db = Database::open(":memory:").unwrap();
        db.write(|tx| {
            record(
                tx,
                NewAuditEntry {
                    actor: "chair",
                    action: AuditAction::Compile,
                    round_id: 3,
                    allocation_count: 4,
                    outcome: AuditOutcome::Applied,
                    detail: None,
                },
            )?;
            record(
                tx,
                NewAuditEntry {
                    actor: "chair",
                    action: AuditAction::Commit,
                    round_id: 3,
                    allocation_count: 4,
                    outcome: AuditOutcome::Failed,
                    detail: Some("player p1 already assigned".into()),
                },
            )
        })
        .unwrap();

        let log = db.read(|c| audit_log(c, 3)).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action, AuditAction::Compile);
        assert_eq!(log[1].outcome, AuditOutcome::Failed);
        assert_eq!(log[1].detail.as_deref(), Some("player p1 already assigned"));
        assert!(db.read(|c| audit_log(c, 4)).unwrap().is_empty());
    }

    #[test]
    fn outcome_strings_are_snake_case() {
        assert_eq!(AuditOutcome::NoOp.as_str(), "no_op");
        assert_eq!(AuditOutcome::parse("no_op"), Some(AuditOutcome::NoOp));
        assert_eq!(
            serde_json::to_string(&AuditAction::CloseRound).unwrap(),
            "\"close_round\""
        );
    }
}
