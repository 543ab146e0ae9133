// Engine facade: lock boundaries, transactions, and event publication
// around the component modules.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::allocation::{self, AllocationSummary, PendingAllocation, PendingAllocations};
use crate::audit::{self, AuditAction, AuditEntry, AuditOutcome, NewAuditEntry};
use crate::db::{self, Database};
use crate::error::{EngineError, EngineResult};
use crate::events::{AuctionEvent, EventBus, Scope};
use crate::finalize::{self, CancelResult, CommitOutcome, CommitResult, Settlement};
use crate::ledger;
use crate::locks::{acquire, LockRegistry};
use crate::model::{
    Actor, BidRecord, FinalizationMode, HighestBid, NewRound, PlayerAssignment, Round, RoundId,
    RoundStatus, TeamBudget, TiebreakerId,
};
use crate::tiebreaker::{self, PlaceBidOutcome, Tiebreaker, TiebreakerBid, WithdrawOutcome};
use crate::ties::{self, TieReport};

/// What `compile_round` did: always a compiled set, plus the commit when
/// the round finalizes automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundCompilation {
    pub round_id: RoundId,
    pub mode: FinalizationMode,
    pub allocations: Vec<PendingAllocation>,
    pub commit: Option<CommitResult>,
}

/// The allocation engine. Cheap to share behind an `Arc`; every method
/// takes `&self`.
pub struct Engine {
    db: Database,
    locks: LockRegistry,
    events: EventBus,
}

impl Engine {
    pub fn new(db: Database, events: EventBus) -> Self {
        Self {
            db,
            locks: LockRegistry::default(),
            events,
        }
    }

    /// An engine over a fresh in-memory database.
    pub fn in_memory() -> EngineResult<Arc<Self>> {
        let db = Database::open(":memory:")?;
        Ok(Arc::new(Self::new(db, EventBus::default())))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------
    // Teams and rounds
    // ------------------------------------------------------------------

    pub fn register_team(&self, team_id: &str, team_name: &str, balance: u32) -> EngineResult<TeamBudget> {
        Ok(self.db.ensure_team(team_id, team_name, balance)?)
    }

    pub fn team_budget(&self, team_id: &str) -> EngineResult<TeamBudget> {
        self.db
            .team_budget(team_id)?
            .ok_or_else(|| EngineError::UnknownTeam(team_id.to_string()))
    }

    pub fn player_assignment(&self, player_id: &str) -> EngineResult<Option<PlayerAssignment>> {
        Ok(self.db.player_assignment(player_id)?)
    }

    pub fn create_round(&self, new: &NewRound) -> EngineResult<Round> {
        if new.bid_increment == 0 {
            return Err(EngineError::InvalidAmount {
                amount: 0,
                reason: "bid increment must be positive".into(),
                current_highest_bid: None,
            });
        }
        let round = self.db.insert_round(new)?;
        info!(
            "Created round {} ({} #{}, {} mode)",
            round.id,
            round.position,
            round.round_number,
            round.finalization_mode.as_str()
        );
        Ok(round)
    }

    pub fn round(&self, round_id: RoundId) -> EngineResult<Round> {
        self.db.round(round_id)?.ok_or(EngineError::RoundNotFound(round_id))
    }

    /// Open a draft round for sealed bidding.
    pub fn open_round(&self, round_id: RoundId) -> EngineResult<Round> {
        let handle = self.locks.rounds.handle(&round_id);
        let _guard = acquire(&handle);
        self.db.write(|tx| {
            let round = db::load_round(tx, round_id)?.ok_or(EngineError::RoundNotFound(round_id))?;
            if round.status != RoundStatus::Draft {
                return Err(EngineError::InvalidRoundStatus {
                    round_id,
                    status: round.status,
                    expected: RoundStatus::Draft.to_string(),
                });
            }
            db::set_round_status(tx, round_id, RoundStatus::Active)?;
            info!("Round {round_id} opened for bidding");
            db::load_round(tx, round_id)?.ok_or(EngineError::RoundNotFound(round_id))
        })
    }

    // ------------------------------------------------------------------
    // Bid ledger
    // ------------------------------------------------------------------

    pub fn submit_bid(&self, round_id: RoundId, team_id: &str, player_id: &str, amount: u32) -> EngineResult<BidRecord> {
        let result = self
            .db
            .write(|tx| ledger::submit_bid(tx, round_id, team_id, player_id, amount, Utc::now()));
        if let Err(e) = &result {
            info!("Rejected bid from {team_id} on {player_id} in round {round_id}: {e}");
        }
        result
    }

    pub fn highest_bid_for(&self, round_id: RoundId, player_id: &str) -> EngineResult<Option<HighestBid>> {
        self.db.read(|c| ledger::highest_bid_for(c, round_id, player_id))
    }

    pub fn bids_for_round(&self, round_id: RoundId) -> EngineResult<Vec<BidRecord>> {
        self.db.read(|c| ledger::bids_for_round(c, round_id))
    }

    pub fn bids_for_team(&self, round_id: RoundId, team_id: &str) -> EngineResult<Vec<BidRecord>> {
        self.db.read(|c| ledger::bids_for_team(c, round_id, team_id))
    }

    // ------------------------------------------------------------------
    // Round close and tie detection
    // ------------------------------------------------------------------

    /// Stop sealed bidding and run tie detection, in one transaction.
    pub fn close_round(&self, actor: &Actor, round_id: RoundId) -> EngineResult<TieReport> {
        require_privileged(actor, "close rounds")?;
        let handle = self.locks.rounds.handle(&round_id);
        let _guard = acquire(&handle);
        self.db.write(|tx| {
            let round = db::load_round(tx, round_id)?.ok_or(EngineError::RoundNotFound(round_id))?;
            if round.status != RoundStatus::Active {
                return Err(EngineError::InvalidRoundStatus {
                    round_id,
                    status: round.status,
                    expected: RoundStatus::Active.to_string(),
                });
            }
            db::set_round_status(tx, round_id, RoundStatus::Closed)?;
            let report = ties::detect(tx, round_id, Utc::now())?.report;
            audit::record(
                tx,
                NewAuditEntry {
                    actor: &actor.name,
                    action: AuditAction::CloseRound,
                    round_id,
                    allocation_count: report.settled.len(),
                    outcome: AuditOutcome::Applied,
                    detail: Some(format!("{} tiebreaker(s)", report.tiebreakers.len())),
                },
            )?;
            info!("Round {round_id} closed by {}", actor.name);
            Ok(report)
        })
    }

    /// Re-run tie detection on a round that is no longer accepting bids.
    pub fn detect_ties(&self, round_id: RoundId) -> EngineResult<TieReport> {
        let handle = self.locks.rounds.handle(&round_id);
        let _guard = acquire(&handle);
        self.db.write(|tx| {
            let round = db::load_round(tx, round_id)?.ok_or(EngineError::RoundNotFound(round_id))?;
            if !round.status.can_compile() {
                return Err(EngineError::InvalidRoundStatus {
                    round_id,
                    status: round.status,
                    expected: "closed, pending_finalization, expired_pending_finalization".into(),
                });
            }
            Ok(ties::detect(tx, round_id, Utc::now())?.report)
        })
    }

    // ------------------------------------------------------------------
    // Tiebreakers
    // ------------------------------------------------------------------

    /// Place a live bid. The tiebreaker's lock is held from load to save,
    /// so concurrent bidders are arbitrated one at a time against the
    /// stored highest bid.
    pub fn place_tiebreaker_bid(
        &self,
        tiebreaker_id: TiebreakerId,
        team_id: &str,
        amount: u32,
        seen_highest: Option<u32>,
    ) -> EngineResult<PlaceBidOutcome> {
        let (outcome, round_id) = {
            let handle = self.locks.tiebreakers.handle(&tiebreaker_id);
            let _guard = acquire(&handle);
            self.db.write(|tx| {
                let mut tb = tiebreaker::load(tx, tiebreaker_id)?
                    .ok_or(EngineError::TiebreakerNotFound(tiebreaker_id))?;
                let outcome = tb.place_bid(team_id, amount, seen_highest, Utc::now())?;
                if let PlaceBidOutcome::Accepted { amount, timestamp, .. } = &outcome {
                    tiebreaker::save(tx, &tb)?;
                    tiebreaker::append_history(tx, tiebreaker_id, team_id, *amount, *timestamp)?;
                }
                Ok::<_, EngineError>((outcome, tb.round_id))
            })?
        };

        match &outcome {
            PlaceBidOutcome::Accepted { amount, timestamp, .. } => {
                info!("Tiebreaker #{tiebreaker_id}: {team_id} leads at {amount}");
                self.events.publish_tiebreaker(
                    round_id,
                    tiebreaker_id,
                    AuctionEvent::BidPlaced {
                        tiebreaker_id,
                        team: team_id.to_string(),
                        amount: *amount,
                        timestamp: *timestamp,
                    },
                );
            }
            PlaceBidOutcome::Superseded {
                current_highest_bid, ..
            } => {
                info!(
                    "Tiebreaker #{tiebreaker_id}: {team_id} bid {amount} superseded by {current_highest_bid}"
                );
            }
        }
        Ok(outcome)
    }

    pub fn withdraw_from_tiebreaker(&self, tiebreaker_id: TiebreakerId, team_id: &str) -> EngineResult<WithdrawOutcome> {
        let (outcome, round_id) = {
            let handle = self.locks.tiebreakers.handle(&tiebreaker_id);
            let _guard = acquire(&handle);
            self.db.write(|tx| {
                let mut tb = tiebreaker::load(tx, tiebreaker_id)?
                    .ok_or(EngineError::TiebreakerNotFound(tiebreaker_id))?;
                let outcome = tb.withdraw(team_id, Utc::now())?;
                tiebreaker::save(tx, &tb)?;
                Ok::<_, EngineError>((outcome, tb.round_id))
            })?
        };

        if outcome.resolution.is_some() {
            self.locks.tiebreakers.release(&tiebreaker_id);
        }
        info!(
            "Tiebreaker #{tiebreaker_id}: {team_id} withdrew, {} remaining",
            outcome.teams_remaining
        );
        self.events.publish_tiebreaker(
            round_id,
            tiebreaker_id,
            AuctionEvent::TeamWithdrew {
                tiebreaker_id,
                team: team_id.to_string(),
                teams_remaining: outcome.teams_remaining,
                winner: outcome.resolution.as_ref().map(|r| r.winner_team.clone()),
            },
        );
        if let Some(resolution) = &outcome.resolution {
            info!(
                "Tiebreaker #{tiebreaker_id} resolved: {} wins at {}",
                resolution.winner_team, resolution.final_amount
            );
            self.events.publish_tiebreaker(
                round_id,
                tiebreaker_id,
                AuctionEvent::TiebreakerResolved {
                    tiebreaker_id,
                    winner_team: resolution.winner_team.clone(),
                    final_amount: resolution.final_amount,
                },
            );
        }
        Ok(outcome)
    }

    pub fn tiebreaker(&self, tiebreaker_id: TiebreakerId) -> EngineResult<Tiebreaker> {
        self.db
            .read(|c| tiebreaker::load(c, tiebreaker_id))?
            .ok_or(EngineError::TiebreakerNotFound(tiebreaker_id))
    }

    pub fn tiebreakers_for_round(&self, round_id: RoundId) -> EngineResult<Vec<Tiebreaker>> {
        self.db.read(|c| tiebreaker::for_round(c, round_id))
    }

    pub fn active_tiebreakers_for_team(&self, team_id: &str) -> EngineResult<Vec<Tiebreaker>> {
        self.db.read(|c| {
            let mut out = Vec::new();
            for id in tiebreaker::active_for_team(c, team_id)? {
                if let Some(tb) = tiebreaker::load(c, id)? {
                    out.push(tb);
                }
            }
            Ok(out)
        })
    }

    pub fn tiebreaker_bid_history(&self, tiebreaker_id: TiebreakerId) -> EngineResult<Vec<TiebreakerBid>> {
        self.db.read(|c| tiebreaker::history(c, tiebreaker_id))
    }

    // ------------------------------------------------------------------
    // Allocation and finalization
    // ------------------------------------------------------------------

    pub fn compile_pending(&self, actor: &Actor, round_id: RoundId) -> EngineResult<Vec<PendingAllocation>> {
        require_privileged(actor, "compile allocations")?;
        let handle = self.locks.rounds.handle(&round_id);
        let _guard = acquire(&handle);
        self.db.write(|tx| {
            let allocations = allocation::compile(tx, round_id, Utc::now())?;
            audit::record(
                tx,
                NewAuditEntry {
                    actor: &actor.name,
                    action: AuditAction::Compile,
                    round_id,
                    allocation_count: allocations.len(),
                    outcome: AuditOutcome::Applied,
                    detail: None,
                },
            )?;
            Ok(allocations)
        })
    }

    pub fn pending_allocations(&self, round_id: RoundId) -> EngineResult<PendingAllocations> {
        self.db.read(|c| {
            db::load_round(c, round_id)?.ok_or(EngineError::RoundNotFound(round_id))?;
            let mut allocations = allocation::load_pending(c, round_id)?;
            allocation::sort_for_display(&mut allocations);
            let summary = AllocationSummary::of(&allocations);
            Ok(PendingAllocations {
                round_id,
                allocations,
                summary,
            })
        })
    }

    /// Apply the round's pending allocations atomically. A failed or
    /// refused attempt leaves the round and its pending set unchanged and
    /// is audited on its own.
    pub fn commit(&self, actor: &Actor, round_id: RoundId) -> EngineResult<CommitResult> {
        let result = self.audited(actor, AuditAction::Commit, round_id, || {
            require_privileged(actor, "commit allocations")?;
            let handle = self.locks.rounds.handle(&round_id);
            let _guard = acquire(&handle);
            self.db
                .write(|tx| finalize::commit(tx, round_id, &actor.name, Utc::now()))
        })?;

        if result.outcome == CommitOutcome::Applied {
            self.locks.rounds.release(&round_id);
            self.events.publish(
                Scope::Round(round_id),
                AuctionEvent::RoundFinalized {
                    round_id,
                    allocation_count: result.allocation_count(),
                    total_spent: result.total_spent,
                },
            );
        }
        Ok(result)
    }

    pub fn cancel(&self, actor: &Actor, round_id: RoundId) -> EngineResult<CancelResult> {
        self.audited(actor, AuditAction::Cancel, round_id, || {
            require_privileged(actor, "cancel allocations")?;
            let handle = self.locks.rounds.handle(&round_id);
            let _guard = acquire(&handle);
            self.db
                .write(|tx| finalize::cancel(tx, round_id, &actor.name))
        })
    }

    /// Compile, then commit straight away when the round finalizes
    /// automatically.
    pub fn compile_round(&self, actor: &Actor, round_id: RoundId) -> EngineResult<RoundCompilation> {
        let allocations = self.compile_pending(actor, round_id)?;
        let round = self.round(round_id)?;
        let commit = match round.finalization_mode {
            FinalizationMode::Automatic => Some(self.commit(actor, round_id)?),
            FinalizationMode::Manual => None,
        };
        Ok(RoundCompilation {
            round_id,
            mode: round.finalization_mode,
            allocations,
            commit,
        })
    }

    pub fn audit_log(&self, round_id: RoundId) -> EngineResult<Vec<AuditEntry>> {
        self.db.read(|c| audit::audit_log(c, round_id))
    }

    pub fn settlements(&self, round_id: RoundId) -> EngineResult<Vec<Settlement>> {
        self.db.read(|c| finalize::settlements_for_round(c, round_id))
    }

    /// Run a finalization step; any error it returns gets a `failed` audit
    /// entry written after the step's transaction has rolled back.
    fn audited<T>(
        &self,
        actor: &Actor,
        action: AuditAction,
        round_id: RoundId,
        step: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let result = step();
        if let Err(e) = &result {
            warn!("{} of round {round_id} by {} failed: {e}", action.as_str(), actor.name);
            self.record_failure(actor, action, round_id, e);
        }
        result
    }

    fn record_failure(&self, actor: &Actor, action: AuditAction, round_id: RoundId, error: &EngineError) {
        let pending = self
            .db
            .read(|c| allocation::load_pending(c, round_id))
            .map(|p| p.len())
            .unwrap_or(0);
        let written = self.db.write(|tx| {
            audit::record(
                tx,
                NewAuditEntry {
                    actor: &actor.name,
                    action,
                    round_id,
                    allocation_count: pending,
                    outcome: AuditOutcome::Failed,
                    detail: Some(error.to_string()),
                },
            )
        });
        if let Err(e) = written {
            warn!("Failed to audit failed {} of round {round_id}: {e}", action.as_str());
        }
    }
}

fn require_privileged(actor: &Actor, what: &str) -> EngineResult<()> {
    if actor.is_privileged() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(format!(
            "{} may not {what}",
            actor.name
        )))
    }
}
