// End-to-end scenarios for the allocation engine.
//
// These drive the public `Engine` API through whole rounds: sealed bidding,
// tie detection, live tiebreakers, compilation, and commit/cancel, including
// multi-threaded races against the same tiebreaker and round.

use std::sync::{Arc, Barrier};
use std::thread;

use roundbid_core::allocation::AllocationPhase;
use roundbid_core::audit::{AuditAction, AuditOutcome};
use roundbid_core::events::{AuctionEvent, Scope};
use roundbid_core::finalize::CommitOutcome;
use roundbid_core::model::{Actor, FinalizationMode, NewRound, RoundId, RoundStatus};
use roundbid_core::tiebreaker::{PlaceBidOutcome, TiebreakerStatus};
use roundbid_core::{Engine, EngineError};

// ===========================================================================
// Test helpers
// ===========================================================================

fn chair() -> Actor {
    Actor::committee("chair")
}

fn engine_with_teams(teams: &[(&str, u32)]) -> Arc<Engine> {
    let engine = Engine::in_memory().unwrap();
    for (team, balance) in teams {
        engine.register_team(team, team, *balance).unwrap();
    }
    engine
}

fn active_round(engine: &Engine, mode: FinalizationMode, max_bids: u32) -> RoundId {
    let round = engine
        .create_round(&NewRound {
            season_id: "2026".into(),
            position: "FWD".into(),
            round_number: 1,
            finalization_mode: mode,
            max_bids_per_team: max_bids,
            bid_increment: 10,
        })
        .unwrap();
    engine.open_round(round.id).unwrap();
    round.id
}

// ===========================================================================
// Named scenarios
// ===========================================================================

#[test]
fn three_way_tiebreaker_resolves_to_last_leader() {
    let engine = engine_with_teams(&[("team_a", 1000), ("team_b", 1000), ("team_c", 1000)]);
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    for team in ["team_a", "team_b", "team_c"] {
        engine.submit_bid(round, team, "striker", 100).unwrap();
    }
    let report = engine.close_round(&chair(), round).unwrap();
    assert!(report.settled.is_empty());
    let tb = report.tiebreakers[0].id;

    let mut rx = engine.events().subscribe();

    let first = engine.place_tiebreaker_bid(tb, "team_a", 110, None).unwrap();
    assert!(matches!(first, PlaceBidOutcome::Accepted { amount: 110, .. }));

    let late = engine.place_tiebreaker_bid(tb, "team_b", 105, None).unwrap();
    assert_eq!(
        late,
        PlaceBidOutcome::Superseded {
            submitted: 105,
            current_highest_bid: 110,
            current_highest_bidder: Some("team_a".into()),
        }
    );

    let c = engine.withdraw_from_tiebreaker(tb, "team_c").unwrap();
    assert_eq!(c.teams_remaining, 2);
    assert!(c.resolution.is_none());

    let b = engine.withdraw_from_tiebreaker(tb, "team_b").unwrap();
    let resolution = b.resolution.unwrap();
    assert_eq!(resolution.winner_team, "team_a");
    assert_eq!(resolution.final_amount, 110);

    let stored = engine.tiebreaker(tb).unwrap();
    assert_eq!(stored.status, TiebreakerStatus::Resolved);
    assert_eq!(stored.winner_team_id.as_deref(), Some("team_a"));
    assert_eq!(stored.final_amount, Some(110));

    // One bid_placed, two team_withdrew, one tiebreaker_resolved on the
    // tiebreaker scope, in that order.
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.scope != Scope::Tiebreaker(tb) {
            continue;
        }
        names.push(match event.event {
            AuctionEvent::BidPlaced { .. } => "bid_placed",
            AuctionEvent::TeamWithdrew { .. } => "team_withdrew",
            AuctionEvent::TiebreakerResolved { .. } => "tiebreaker_resolved",
            AuctionEvent::RoundFinalized { .. } => "round_finalized",
        });
    }
    assert_eq!(
        names,
        vec!["bid_placed", "team_withdrew", "team_withdrew", "tiebreaker_resolved"]
    );
}

#[test]
fn settled_and_tied_players_commit_together() {
    let engine = engine_with_teams(&[("x", 500), ("y", 500), ("z", 500)]);
    let round = active_round(&engine, FinalizationMode::Manual, 3);

    engine.submit_bid(round, "x", "p1", 50).unwrap();
    engine.submit_bid(round, "y", "p2", 80).unwrap();
    engine.submit_bid(round, "z", "p2", 80).unwrap();

    let report = engine.close_round(&chair(), round).unwrap();
    assert_eq!(report.settled.len(), 1);
    assert_eq!(report.settled[0].player_id, "p1");
    assert_eq!(report.tiebreakers.len(), 1);
    let tb = report.tiebreakers[0].id;
    assert_eq!(engine.round(round).unwrap().status, RoundStatus::Closed);

    engine.withdraw_from_tiebreaker(tb, "y").unwrap();

    let compiled = engine.compile_pending(&chair(), round).unwrap();
    assert_eq!(compiled.len(), 2);
    // Highest amount first.
    assert_eq!(compiled[0].player_id, "p2");
    assert_eq!(compiled[0].team_id, "z");
    assert_eq!(compiled[0].amount, 80);
    assert_eq!(compiled[0].phase, AllocationPhase::Incomplete);
    assert_eq!(compiled[1].player_id, "p1");
    assert_eq!(compiled[1].phase, AllocationPhase::Regular);

    let pending = engine.pending_allocations(round).unwrap();
    assert_eq!(pending.summary.total_players, 2);
    assert_eq!(pending.summary.total_spent, 130);
    assert_eq!(pending.summary.average_bid, 65);

    let result = engine.commit(&chair(), round).unwrap();
    assert_eq!(result.outcome, CommitOutcome::Applied);
    assert_eq!(result.allocation_count(), 2);

    assert_eq!(engine.team_budget("x").unwrap().balance, 450);
    assert_eq!(engine.team_budget("y").unwrap().balance, 500);
    assert_eq!(engine.team_budget("z").unwrap().balance, 420);
    assert_eq!(engine.team_budget("z").unwrap().players_count, 1);
    assert_eq!(engine.player_assignment("p1").unwrap().unwrap().team_id, "x");
    assert_eq!(engine.player_assignment("p2").unwrap().unwrap().team_id, "z");
    assert_eq!(engine.round(round).unwrap().status, RoundStatus::Completed);
    assert!(engine.pending_allocations(round).unwrap().allocations.is_empty());

    let settlements = engine.settlements(round).unwrap();
    assert_eq!(settlements.len(), 2);
    assert!(settlements
        .iter()
        .all(|s| s.balance_before - s.amount == s.balance_after));
}

// ===========================================================================
// Bid ledger behaviour through the engine
// ===========================================================================

#[test]
fn assigned_player_cannot_be_bid_on_again() {
    let engine = engine_with_teams(&[("x", 500), ("y", 500)]);
    let first = active_round(&engine, FinalizationMode::Automatic, 3);
    engine.submit_bid(first, "x", "p1", 50).unwrap();
    engine.close_round(&chair(), first).unwrap();
    engine.compile_round(&chair(), first).unwrap();

    let second = active_round(&engine, FinalizationMode::Manual, 3);
    let err = engine.submit_bid(second, "y", "p1", 60).unwrap_err();
    assert!(matches!(err, EngineError::PlayerUnavailable { .. }));
}

#[test]
fn no_bids_after_close() {
    let engine = engine_with_teams(&[("x", 500)]);
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    engine.close_round(&chair(), round).unwrap();
    assert!(matches!(
        engine.submit_bid(round, "x", "p1", 10),
        Err(EngineError::RoundNotActive { .. })
    ));
}

// ===========================================================================
// Finalization
// ===========================================================================

#[test]
fn second_commit_is_a_no_op() {
    let engine = engine_with_teams(&[("x", 500)]);
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    engine.submit_bid(round, "x", "p1", 50).unwrap();
    engine.close_round(&chair(), round).unwrap();
    engine.compile_pending(&chair(), round).unwrap();

    let first = engine.commit(&chair(), round).unwrap();
    assert_eq!(first.outcome, CommitOutcome::Applied);
    let second = engine.commit(&chair(), round).unwrap();
    assert_eq!(second.outcome, CommitOutcome::NoOp);
    assert_eq!(second.allocation_count(), 0);

    assert_eq!(engine.team_budget("x").unwrap().balance, 450);

    let outcomes: Vec<_> = engine
        .audit_log(round)
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::Commit)
        .map(|e| e.outcome)
        .collect();
    assert_eq!(outcomes, vec![AuditOutcome::Applied, AuditOutcome::NoOp]);
}

#[test]
fn compile_requires_closed_round() {
    let engine = engine_with_teams(&[("x", 500)]);
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    assert!(matches!(
        engine.compile_pending(&chair(), round),
        Err(EngineError::InvalidRoundStatus { .. })
    ));
    assert!(matches!(
        engine.compile_pending(&chair(), round + 99),
        Err(EngineError::RoundNotFound(_))
    ));
}

#[test]
fn audit_log_records_lifecycle() {
    let engine = engine_with_teams(&[("x", 500)]);
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    engine.submit_bid(round, "x", "p1", 50).unwrap();
    engine.close_round(&chair(), round).unwrap();
    engine.compile_pending(&chair(), round).unwrap();
    engine.cancel(&chair(), round).unwrap();

    let actions: Vec<_> = engine
        .audit_log(round)
        .unwrap()
        .into_iter()
        .map(|e| (e.action, e.outcome, e.actor))
        .collect();
    assert_eq!(
        actions,
        vec![
            (AuditAction::CloseRound, AuditOutcome::Applied, "chair".to_string()),
            (AuditAction::Compile, AuditOutcome::Applied, "chair".to_string()),
            (AuditAction::Cancel, AuditOutcome::Cancelled, "chair".to_string()),
        ]
    );
}

#[test]
fn player_sold_elsewhere_is_dropped_on_recompile() {
    let engine = engine_with_teams(&[("x", 500), ("y", 500)]);
    let first = active_round(&engine, FinalizationMode::Manual, 3);
    let second = active_round(&engine, FinalizationMode::Manual, 3);
    engine.submit_bid(first, "x", "p1", 50).unwrap();
    engine.submit_bid(second, "y", "p1", 60).unwrap();
    engine.submit_bid(second, "y", "p2", 40).unwrap();
    engine.close_round(&chair(), first).unwrap();
    engine.close_round(&chair(), second).unwrap();

    // The second round is compiled while p1 is still unsold.
    assert_eq!(engine.compile_pending(&chair(), second).unwrap().len(), 2);
    engine.compile_pending(&chair(), first).unwrap();
    engine.commit(&chair(), first).unwrap();

    assert!(matches!(
        engine.commit(&chair(), second),
        Err(EngineError::CommitFailed { .. })
    ));
    engine.cancel(&chair(), second).unwrap();

    let recompiled = engine.compile_pending(&chair(), second).unwrap();
    let players: Vec<_> = recompiled.iter().map(|a| a.player_id.as_str()).collect();
    assert_eq!(players, vec!["p2"]);

    let result = engine.commit(&chair(), second).unwrap();
    assert_eq!(result.outcome, CommitOutcome::Applied);
    assert_eq!(engine.player_assignment("p1").unwrap().unwrap().team_id, "x");
    assert_eq!(engine.player_assignment("p2").unwrap().unwrap().team_id, "y");
    assert_eq!(engine.team_budget("y").unwrap().balance, 460);
    assert_eq!(engine.round(second).unwrap().status, RoundStatus::Completed);
}

#[test]
fn tiebreaker_on_a_sold_player_does_not_block_compile() {
    let engine = engine_with_teams(&[("x", 500), ("y", 500), ("z", 500)]);
    let first = active_round(&engine, FinalizationMode::Manual, 3);
    let second = active_round(&engine, FinalizationMode::Manual, 3);
    engine.submit_bid(first, "x", "p1", 50).unwrap();
    engine.submit_bid(second, "y", "p1", 60).unwrap();
    engine.submit_bid(second, "z", "p1", 60).unwrap();
    engine.submit_bid(second, "z", "p2", 30).unwrap();
    engine.close_round(&chair(), first).unwrap();
    let report = engine.close_round(&chair(), second).unwrap();
    assert_eq!(report.tiebreakers.len(), 1);

    engine.compile_pending(&chair(), first).unwrap();
    engine.commit(&chair(), first).unwrap();

    let compiled = engine.compile_pending(&chair(), second).unwrap();
    assert_eq!(compiled.len(), 1);
    assert_eq!(compiled[0].player_id, "p2");
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[test]
fn concurrent_identical_bids_accept_exactly_one() {
    let teams: Vec<String> = (0..8).map(|i| format!("team_{i}")).collect();
    let engine = Engine::in_memory().unwrap();
    for team in &teams {
        engine.register_team(team, team, 1000).unwrap();
    }
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    for team in &teams {
        engine.submit_bid(round, team, "keeper", 100).unwrap();
    }
    let tb = engine.close_round(&chair(), round).unwrap().tiebreakers[0].id;

    let barrier = Arc::new(Barrier::new(teams.len()));
    let handles: Vec<_> = teams
        .iter()
        .cloned()
        .map(|team| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.place_tiebreaker_bid(tb, &team, 150, Some(100))
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let accepted = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(PlaceBidOutcome::Accepted { .. })))
        .count();
    let superseded = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                Ok(PlaceBidOutcome::Superseded {
                    current_highest_bid: 150,
                    ..
                })
            )
        })
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(superseded, teams.len() - 1);

    let stored = engine.tiebreaker(tb).unwrap();
    assert_eq!(stored.current_highest_bid, 150);
    assert_eq!(engine.tiebreaker_bid_history(tb).unwrap().len(), 1);
}

#[test]
fn concurrent_ascending_bids_leave_the_maximum() {
    let teams: Vec<String> = (0..6).map(|i| format!("team_{i}")).collect();
    let engine = Engine::in_memory().unwrap();
    for team in &teams {
        engine.register_team(team, team, 1000).unwrap();
    }
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    for team in &teams {
        engine.submit_bid(round, team, "keeper", 100).unwrap();
    }
    let tb = engine.close_round(&chair(), round).unwrap().tiebreakers[0].id;

    let barrier = Arc::new(Barrier::new(teams.len()));
    let handles: Vec<_> = teams
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, team)| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.place_tiebreaker_bid(tb, &team, 110 + 10 * i as u32, None)
            })
        })
        .collect();
    for h in handles {
        match h.join().unwrap().unwrap() {
            PlaceBidOutcome::Accepted { .. } => {}
            // A loser learns the amount that beat it.
            PlaceBidOutcome::Superseded {
                submitted,
                current_highest_bid,
                current_highest_bidder,
            } => {
                assert!(current_highest_bid > submitted, "{submitted} lost to {current_highest_bid}");
                assert!(current_highest_bidder.is_some());
            }
        }
    }

    let stored = engine.tiebreaker(tb).unwrap();
    assert_eq!(stored.current_highest_bid, 160);
    assert_eq!(stored.current_highest_bidder.as_deref(), Some("team_5"));
    // Every accepted bid in the history strictly exceeds the one before.
    let history = engine.tiebreaker_bid_history(tb).unwrap();
    assert!(history.windows(2).all(|w| w[1].amount > w[0].amount));
}

#[test]
fn concurrent_commits_apply_once() {
    let engine = engine_with_teams(&[("x", 500), ("y", 500)]);
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    engine.submit_bid(round, "x", "p1", 50).unwrap();
    engine.submit_bid(round, "y", "p2", 70).unwrap();
    engine.close_round(&chair(), round).unwrap();
    engine.compile_pending(&chair(), round).unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.commit(&chair(), round).map(|r| r.outcome)
            })
        })
        .collect();
    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(
        outcomes.iter().filter(|o| **o == CommitOutcome::Applied).count(),
        1
    );
    assert_eq!(
        outcomes.iter().filter(|o| **o == CommitOutcome::NoOp).count(),
        3
    );
    assert_eq!(engine.team_budget("x").unwrap().balance, 450);
    assert_eq!(engine.team_budget("y").unwrap().balance, 430);
}

#[test]
fn commit_and_cancel_race_leaves_one_consistent_outcome() {
    let engine = engine_with_teams(&[("x", 500)]);
    let round = active_round(&engine, FinalizationMode::Manual, 3);
    engine.submit_bid(round, "x", "p1", 50).unwrap();
    engine.close_round(&chair(), round).unwrap();
    engine.compile_pending(&chair(), round).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let committer = {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            engine.commit(&chair(), round).map(|r| r.outcome)
        })
    };
    let canceller = {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            engine.cancel(&chair(), round).map(|r| r.cancelled)
        })
    };
    let commit = committer.join().unwrap();
    let cancel = canceller.join().unwrap();

    let status = engine.round(round).unwrap().status;
    let balance = engine.team_budget("x").unwrap().balance;
    match (commit, cancel) {
        (Ok(CommitOutcome::Applied), Err(EngineError::NoPendingAllocations(_))) => {
            assert_eq!(status, RoundStatus::Completed);
            assert_eq!(balance, 450);
        }
        (Ok(CommitOutcome::NoOp), Ok(1)) => {
            assert_eq!(status, RoundStatus::ExpiredPendingFinalization);
            assert_eq!(balance, 500);
        }
        other => panic!("inconsistent race outcome: {other:?}"),
    }
}
