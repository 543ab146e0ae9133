// SQLite persistence layer: schema, connection access, rounds and team budgets.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::model::{
    FinalizationMode, NewRound, PlayerAssignment, Round, RoundId, RoundStatus, TeamBudget,
};

/// SQLite-backed store for rounds, bids, tiebreakers, pending allocations,
/// team budgets, assignments, settlements, and the audit log.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS teams (
                team_id       TEXT PRIMARY KEY,
                team_name     TEXT NOT NULL,
                balance       INTEGER NOT NULL CHECK (balance >= 0),
                total_spent   INTEGER NOT NULL DEFAULT 0,
                players_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS rounds (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                season_id         TEXT NOT NULL,
                position          TEXT NOT NULL,
                round_number      INTEGER NOT NULL,
                status            TEXT NOT NULL,
                finalization_mode TEXT NOT NULL,
                max_bids_per_team INTEGER NOT NULL,
                bid_increment     INTEGER NOT NULL CHECK (bid_increment > 0),
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bids (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id     INTEGER NOT NULL REFERENCES rounds(id),
                team_id      TEXT NOT NULL REFERENCES teams(team_id),
                player_id    TEXT NOT NULL,
                amount       INTEGER NOT NULL CHECK (amount > 0),
                status       TEXT NOT NULL DEFAULT 'active',
                submitted_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tiebreakers (
                id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id               INTEGER NOT NULL REFERENCES rounds(id),
                player_id              TEXT NOT NULL,
                original_amount        INTEGER NOT NULL,
                current_highest_bid    INTEGER NOT NULL,
                current_highest_bidder TEXT,
                status                 TEXT NOT NULL,
                winner_team_id         TEXT,
                final_amount           INTEGER,
                created_at             TEXT NOT NULL,
                resolved_at            TEXT,
                UNIQUE(round_id, player_id)
            );

            CREATE TABLE IF NOT EXISTS tiebreaker_participants (
                tiebreaker_id    INTEGER NOT NULL REFERENCES tiebreakers(id),
                team_id          TEXT NOT NULL,
                current_bid      INTEGER,
                withdrawn        INTEGER NOT NULL DEFAULT 0,
                balance_snapshot INTEGER NOT NULL,
                withdrawn_at     TEXT,
                PRIMARY KEY (tiebreaker_id, team_id)
            );

            CREATE TABLE IF NOT EXISTS tiebreaker_bids (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                tiebreaker_id INTEGER NOT NULL REFERENCES tiebreakers(id),
                team_id       TEXT NOT NULL,
                amount        INTEGER NOT NULL,
                placed_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_allocations (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id   INTEGER NOT NULL REFERENCES rounds(id),
                team_id    TEXT NOT NULL,
                player_id  TEXT NOT NULL,
                amount     INTEGER NOT NULL,
                phase      TEXT NOT NULL,
                bid_id     INTEGER,
                created_at TEXT NOT NULL,
                UNIQUE(round_id, player_id)
            );

            CREATE TABLE IF NOT EXISTS player_assignments (
                player_id      TEXT PRIMARY KEY,
                team_id        TEXT NOT NULL REFERENCES teams(team_id),
                round_id       INTEGER NOT NULL REFERENCES rounds(id),
                purchase_price INTEGER NOT NULL,
                acquired_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settlements (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id       INTEGER NOT NULL REFERENCES rounds(id),
                team_id        TEXT NOT NULL,
                player_id      TEXT NOT NULL,
                amount         INTEGER NOT NULL,
                balance_before INTEGER NOT NULL,
                balance_after  INTEGER NOT NULL,
                settled_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                actor            TEXT NOT NULL,
                action           TEXT NOT NULL,
                round_id         INTEGER NOT NULL,
                allocation_count INTEGER NOT NULL,
                outcome          TEXT NOT NULL,
                detail           TEXT,
                created_at       TEXT NOT NULL
            );
            ",
        )
        .context("failed to create database schema")?;

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_bids_round_player ON bids(round_id, player_id);
             CREATE INDEX IF NOT EXISTS idx_bids_round_team ON bids(round_id, team_id);
             CREATE INDEX IF NOT EXISTS idx_audit_round ON audit_log(round_id);",
        )
        .context("failed to create indexes")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Run `f` inside an IMMEDIATE transaction. The transaction commits when
    /// `f` returns `Ok` and rolls back (on drop) when it returns `Err`.
    pub(crate) fn write<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<anyhow::Error>,
    {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin transaction")?;
        let value = f(&tx)?;
        tx.commit().context("failed to commit transaction")?;
        Ok(value)
    }

    /// Run a read-only closure against the connection.
    pub(crate) fn read<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E> {
        let conn = self.conn();
        f(&conn)
    }

    // ------------------------------------------------------------------
    // Teams
    // ------------------------------------------------------------------

    /// Insert a team budget entry, or leave an existing one untouched.
    /// Returns the stored entry.
    pub fn ensure_team(&self, team_id: &str, team_name: &str, balance: u32) -> Result<TeamBudget> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO teams (team_id, team_name, balance) VALUES (?1, ?2, ?3)",
            params![team_id, team_name, balance],
        )
        .context("failed to insert team")?;
        load_team(&conn, team_id)?.context("team missing after insert")
    }

    pub fn team_budget(&self, team_id: &str) -> Result<Option<TeamBudget>> {
        let conn = self.conn();
        load_team(&conn, team_id)
    }

    // ------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------

    pub fn insert_round(&self, new: &NewRound) -> Result<Round> {
        let conn = self.conn();
        let now = now_str();
        let id: RoundId = conn
            .query_row(
                "INSERT INTO rounds
                    (season_id, position, round_number, status, finalization_mode,
                     max_bids_per_team, bid_increment, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 RETURNING id",
                params![
                    new.season_id,
                    new.position,
                    new.round_number,
                    RoundStatus::Draft.as_str(),
                    new.finalization_mode.as_str(),
                    new.max_bids_per_team,
                    new.bid_increment,
                    now,
                ],
                |row| row.get(0),
            )
            .context("failed to insert round")?;
        load_round(&conn, id)?.context("round missing after insert")
    }

    pub fn round(&self, round_id: RoundId) -> Result<Option<Round>> {
        let conn = self.conn();
        load_round(&conn, round_id)
    }

    pub fn player_assignment(&self, player_id: &str) -> Result<Option<PlayerAssignment>> {
        let conn = self.conn();
        load_assignment(&conn, player_id)
    }
}

// ---------------------------------------------------------------------------
// Row helpers shared by the component modules
// ---------------------------------------------------------------------------

pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Read an RFC 3339 TEXT column as a UTC timestamp.
pub(crate) fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text, idx)
}

pub(crate) fn opt_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_timestamp(&t, idx)).transpose()
}

fn parse_timestamp(text: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a TEXT enum column through `parse`, failing the row on unknown values.
pub(crate) fn enum_at<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unexpected enum value '{text}'").into(),
        )
    })
}

const ROUND_COLUMNS: &str = "id, season_id, position, round_number, status, finalization_mode,
     max_bids_per_team, bid_increment, created_at, updated_at";

fn map_round(row: &Row<'_>) -> rusqlite::Result<Round> {
    Ok(Round {
        id: row.get(0)?,
        season_id: row.get(1)?,
        position: row.get(2)?,
        round_number: row.get(3)?,
        status: enum_at(row, 4, RoundStatus::parse)?,
        finalization_mode: enum_at(row, 5, FinalizationMode::parse)?,
        max_bids_per_team: row.get(6)?,
        bid_increment: row.get(7)?,
        created_at: timestamp_at(row, 8)?,
        updated_at: timestamp_at(row, 9)?,
    })
}

pub(crate) fn load_round(conn: &Connection, round_id: RoundId) -> Result<Option<Round>> {
    conn.query_row(
        &format!("SELECT {ROUND_COLUMNS} FROM rounds WHERE id = ?1"),
        params![round_id],
        map_round,
    )
    .optional()
    .context("failed to load round")
}

pub(crate) fn set_round_status(conn: &Connection, round_id: RoundId, status: RoundStatus) -> Result<()> {
    conn.execute(
        "UPDATE rounds SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now_str(), round_id],
    )
    .context("failed to update round status")?;
    Ok(())
}

pub(crate) fn load_team(conn: &Connection, team_id: &str) -> Result<Option<TeamBudget>> {
    conn.query_row(
        "SELECT team_id, team_name, balance, total_spent, players_count
         FROM teams WHERE team_id = ?1",
        params![team_id],
        |row| {
            Ok(TeamBudget {
                team_id: row.get(0)?,
                team_name: row.get(1)?,
                balance: row.get(2)?,
                total_spent: row.get(3)?,
                players_count: row.get(4)?,
            })
        },
    )
    .optional()
    .context("failed to load team")
}

pub(crate) fn load_assignment(conn: &Connection, player_id: &str) -> Result<Option<PlayerAssignment>> {
    conn.query_row(
        "SELECT player_id, team_id, round_id, purchase_price, acquired_at
         FROM player_assignments WHERE player_id = ?1",
        params![player_id],
        |row| {
            Ok(PlayerAssignment {
                player_id: row.get(0)?,
                team_id: row.get(1)?,
                round_id: row.get(2)?,
                purchase_price: row.get(3)?,
                acquired_at: timestamp_at(row, 4)?,
            })
        },
    )
    .optional()
    .context("failed to load player assignment")
}
