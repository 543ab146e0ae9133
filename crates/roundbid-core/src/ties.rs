// Tie detection at round close: settle uncontested players, escalate ties.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db;
use crate::error::EngineResult;
use crate::ledger::{self, EffectiveBid, PlayerStanding};
use crate::model::{BidId, RoundId};
use crate::tiebreaker::{self, Tiebreaker};

/// A player won outright by a single highest bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledBid {
    pub player_id: String,
    pub team_id: String,
    pub amount: u32,
    pub bid_id: BidId,
}

impl From<&EffectiveBid> for SettledBid {
    fn from(bid: &EffectiveBid) -> Self {
        SettledBid {
            player_id: bid.player_id.clone(),
            team_id: bid.team_id.clone(),
            amount: bid.amount,
            bid_id: bid.bid_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TieReport {
    pub round_id: RoundId,
    pub settled: Vec<SettledBid>,
    /// Every tiebreaker of the round, newly created or pre-existing.
    pub tiebreakers: Vec<Tiebreaker>,
}

/// The report together with the standings it was computed from, for
/// callers that need the sealed bids behind a tiebreaker.
pub(crate) struct Detection {
    pub report: TieReport,
    pub standings: std::collections::BTreeMap<String, PlayerStanding>,
}

/// Classify every player bid on in `round_id`. Safe to re-run: a player
/// that already has a tiebreaker reuses it and is never reported settled.
pub(crate) fn detect(conn: &Connection, round_id: RoundId, at: DateTime<Utc>) -> EngineResult<Detection> {
    let bids = ledger::bids_for_round(conn, round_id)?;
    let standings = ledger::standings(&bids);

    let mut settled = Vec::new();
    let mut tiebreakers = Vec::new();
    let mut created = 0usize;

    for (player_id, standing) in &standings {
        if let Some(existing) = tiebreaker::find_for_player(conn, round_id, player_id)? {
            tiebreakers.push(existing);
            continue;
        }

        if !standing.is_tie() {
            if let Some(leader) = standing.leaders.first() {
                settled.push(SettledBid::from(leader));
            }
            continue;
        }

        let mut teams = Vec::with_capacity(standing.leaders.len());
        for leader in &standing.leaders {
            let balance = db::load_team(conn, &leader.team_id)?
                .map(|t| t.balance)
                .unwrap_or(0);
            teams.push((leader.team_id.clone(), balance));
        }
        let seeded = Tiebreaker::seed(round_id, player_id, standing.amount, teams, at)?;
        let stored = tiebreaker::insert(conn, &seeded)?;
        info!(
            "Tiebreaker #{} created for {player_id} in round {round_id}: {} teams tied at {}",
            stored.id,
            stored.participants.len(),
            stored.original_amount
        );
        tiebreakers.push(stored);
        created += 1;
    }

    info!(
        "Tie detection for round {round_id}: {} settled, {} tiebreaker(s) ({created} new)",
        settled.len(),
        tiebreakers.len()
    );

    Ok(Detection {
        report: TieReport {
            round_id,
            settled,
            tiebreakers,
        },
        standings,
    })
}
