// Command dispatch: turns client requests into engine calls and frames.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use roundbid_core::model::NewRound;
use roundbid_core::{Engine, EngineError, EngineResult};

use crate::config::{Config, RoundDefaults};
use crate::protocol::{ClientRequest, Command, ServerMessage};
use crate::session::{IdentityTable, Session};

/// Shared, immutable state handed to every connection.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub identities: IdentityTable,
    pub round_defaults: RoundDefaults,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, identities: IdentityTable, round_defaults: RoundDefaults) -> Self {
        Self {
            engine,
            identities,
            round_defaults,
        }
    }

    pub fn from_config(engine: Arc<Engine>, config: &Config) -> Self {
        Self::new(
            engine,
            IdentityTable::from_config(&config.credentials),
            config.auction.rounds.clone(),
        )
    }

    /// Handle one raw text frame from a client.
    pub fn handle_text(&self, session: &mut Session, text: &str) -> ServerMessage {
        let request: ClientRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to parse client message: {}", e);
                return ServerMessage::error(None, "bad_request", format!("malformed request: {e}"));
            }
        };
        self.dispatch(session, request)
    }

    pub fn dispatch(&self, session: &mut Session, request: ClientRequest) -> ServerMessage {
        let request_id = request.request_id;
        let name = request.command.name();
        match self.execute(session, request.command) {
            Ok(payload) => ServerMessage::Response {
                request_id,
                payload,
            },
            Err(e) => {
                info!("{name} rejected: {e}");
                ServerMessage::from_engine_error(request_id, &e)
            }
        }
    }

    fn execute(&self, session: &mut Session, command: Command) -> EngineResult<serde_json::Value> {
        let engine = &self.engine;
        match command {
            Command::Identify { token } => {
                let actor = self
                    .identities
                    .resolve(&token)
                    .cloned()
                    .ok_or_else(|| EngineError::Unauthorized("unknown token".into()))?;
                info!("Connection identified as {} ({:?})", actor.name, actor.role);
                let reply = to_payload(&actor)?;
                session.identify(actor);
                Ok(reply)
            }
            Command::Subscribe { scope } => {
                session.actor()?;
                let added = session.subscribe(scope);
                Ok(json!({ "scope": scope, "subscribed": true, "added": added }))
            }
            Command::Unsubscribe { scope } => {
                let removed = session.unsubscribe(&scope);
                Ok(json!({ "scope": scope, "subscribed": false, "removed": removed }))
            }
            Command::CreateRound {
                season_id,
                position,
                round_number,
                finalization_mode,
                max_bids_per_team,
                bid_increment,
            } => {
                require_privileged(session, "create rounds")?;
                let defaults = &self.round_defaults;
                let round = engine.create_round(&NewRound {
                    season_id,
                    position,
                    round_number,
                    finalization_mode: finalization_mode.unwrap_or(defaults.finalization_mode),
                    max_bids_per_team: max_bids_per_team.unwrap_or(defaults.max_bids_per_team),
                    bid_increment: bid_increment.unwrap_or(defaults.bid_increment),
                })?;
                to_payload(&round)
            }
            Command::OpenRound { round_id } => {
                require_privileged(session, "open rounds")?;
                to_payload(&engine.open_round(round_id)?)
            }
            Command::SubmitBid {
                round_id,
                player_id,
                amount,
            } => {
                let team_id = session.team_id()?;
                let amount = wire_amount(amount)?;
                to_payload(&engine.submit_bid(round_id, team_id, &player_id, amount)?)
            }
            Command::TiebreakerBid {
                tiebreaker_id,
                amount,
                seen_highest,
            } => {
                let team_id = session.team_id()?;
                let amount = match wire_amount(amount) {
                    Ok(a) => a,
                    Err(e) => {
                        let current = engine.tiebreaker(tiebreaker_id)?.current_highest_bid;
                        return Err(with_current_highest(e, current));
                    }
                };
                let seen_highest = seen_highest.map(|s| u32::try_from(s.max(0)).unwrap_or(u32::MAX));
                to_payload(&engine.place_tiebreaker_bid(tiebreaker_id, team_id, amount, seen_highest)?)
            }
            Command::TiebreakerWithdraw { tiebreaker_id } => {
                let team_id = session.team_id()?;
                to_payload(&engine.withdraw_from_tiebreaker(tiebreaker_id, team_id)?)
            }
            Command::GetTiebreaker { tiebreaker_id } => {
                session.actor()?;
                let tiebreaker = engine.tiebreaker(tiebreaker_id)?;
                let history = engine.tiebreaker_bid_history(tiebreaker_id)?;
                Ok(json!({ "tiebreaker": to_payload(&tiebreaker)?, "history": to_payload(&history)? }))
            }
            Command::GetMyTiebreakers {} => {
                let team_id = session.team_id()?;
                to_payload(&engine.active_tiebreakers_for_team(team_id)?)
            }
            Command::CloseRound { round_id } => {
                to_payload(&engine.close_round(session.actor()?, round_id)?)
            }
            Command::DetectTies { round_id } => {
                require_privileged(session, "run tie detection")?;
                to_payload(&engine.detect_ties(round_id)?)
            }
            Command::CompilePending { round_id } => {
                to_payload(&engine.compile_round(session.actor()?, round_id)?)
            }
            Command::GetPendingAllocations { round_id } => {
                session.actor()?;
                to_payload(&engine.pending_allocations(round_id)?)
            }
            Command::FinalizeRound { round_id } => {
                to_payload(&engine.commit(session.actor()?, round_id)?)
            }
            Command::CancelPendingAllocations { round_id } => {
                to_payload(&engine.cancel(session.actor()?, round_id)?)
            }
            Command::GetAuditLog { round_id } => {
                require_privileged(session, "read the audit log")?;
                to_payload(&engine.audit_log(round_id)?)
            }
        }
    }
}

fn require_privileged(session: &Session, what: &str) -> EngineResult<()> {
    let actor = session.actor()?;
    if actor.is_privileged() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(format!("{} may not {what}", actor.name)))
    }
}

fn to_payload<T: Serialize>(value: &T) -> EngineResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| EngineError::Storage(anyhow::anyhow!("failed to encode payload: {e}")))
}

/// Convert a wire amount into a bid amount. Zero is passed through so the
/// engine can reject it with full context.
fn wire_amount(raw: i64) -> EngineResult<u32> {
    if raw < 0 {
        return Err(EngineError::InvalidAmount {
            amount: raw,
            reason: "must be positive".into(),
            current_highest_bid: None,
        });
    }
    u32::try_from(raw).map_err(|_| EngineError::InvalidAmount {
        amount: raw,
        reason: "too large".into(),
        current_highest_bid: None,
    })
}

fn with_current_highest(err: EngineError, current: u32) -> EngineError {
    match err {
        EngineError::InvalidAmount { amount, reason, .. } => EngineError::InvalidAmount {
            amount,
            reason,
            current_highest_bid: Some(current),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roundbid_core::model::{Actor, FinalizationMode, Role};

    fn state() -> AppState {
        let engine = Engine::in_memory().unwrap();
        for team in ["team_a", "team_b"] {
            engine.register_team(team, team, 500).unwrap();
        }
        let mut identities = IdentityTable::default();
        identities.insert("chair-token", Actor::committee("chair"));
        identities.insert("a-token", Actor::team("team_a"));
        identities.insert("b-token", Actor::team("team_b"));
        AppState::new(
            engine,
            identities,
            RoundDefaults {
                bid_increment: 10,
                max_bids_per_team: 3,
                finalization_mode: FinalizationMode::Manual,
            },
        )
    }

    fn send(state: &AppState, session: &mut Session, json: &str) -> serde_json::Value {
        let frame = state.handle_text(session, json);
        serde_json::from_str(&frame.to_json()).unwrap()
    }

    fn identified(state: &AppState, token: &str) -> Session {
        let mut session = Session::new();
        let reply = send(
            state,
            &mut session,
            &format!(r#"{{"type":"IDENTIFY","payload":{{"token":"{token}"}}}}"#),
        );
        assert_eq!(reply["type"], "RESPONSE");
        session
    }

    fn open_round(state: &AppState, chair: &mut Session) -> i64 {
        let created = send(
            state,
            chair,
            r#"{"type":"CREATE_ROUND","payload":{"seasonId":"2026","position":"GK","roundNumber":1}}"#,
        );
        assert_eq!(created["payload"]["bid_increment"], 10);
        let id = created["payload"]["id"].as_i64().unwrap();
        send(
            state,
            chair,
            &format!(r#"{{"type":"OPEN_ROUND","payload":{{"roundId":{id}}}}}"#),
        );
        id
    }

    #[test]
    fn malformed_json_is_bad_request() {
        let state = state();
        let mut session = Session::new();
        let reply = send(&state, &mut session, "{not json");
        assert_eq!(reply["type"], "ERROR");
        assert_eq!(reply["code"], "bad_request");
    }

    #[test]
    fn unknown_token_is_unauthorized() {
        let state = state();
        let mut session = Session::new();
        let reply = send(
            &state,
            &mut session,
            r#"{"type":"IDENTIFY","requestId":1,"payload":{"token":"forged"}}"#,
        );
        assert_eq!(reply["code"], "unauthorized");
        assert_eq!(reply["requestId"], 1);
    }

    #[test]
    fn identify_returns_actor() {
        let state = state();
        let mut session = Session::new();
        let reply = send(
            &state,
            &mut session,
            r#"{"type":"IDENTIFY","payload":{"token":"a-token"}}"#,
        );
        assert_eq!(reply["payload"]["team_id"], "team_a");
        assert_eq!(session.actor().unwrap().role, Role::Team);
    }

    #[test]
    fn bids_require_a_team_identity() {
        let state = state();
        let mut chair = identified(&state, "chair-token");
        let round = open_round(&state, &mut chair);

        let bid = format!(
            r#"{{"type":"SUBMIT_BID","payload":{{"roundId":{round},"playerId":"p1","amount":50}}}}"#
        );
        let mut anonymous = Session::new();
        assert_eq!(send(&state, &mut anonymous, &bid)["code"], "unauthorized");
        assert_eq!(send(&state, &mut chair, &bid)["code"], "unauthorized");

        let mut team = identified(&state, "a-token");
        let reply = send(&state, &mut team, &bid);
        assert_eq!(reply["type"], "RESPONSE");
        assert_eq!(reply["payload"]["team_id"], "team_a");
        assert_eq!(reply["payload"]["amount"], 50);
    }

    #[test]
    fn negative_amount_is_invalid() {
        let state = state();
        let mut chair = identified(&state, "chair-token");
        let round = open_round(&state, &mut chair);
        let mut team = identified(&state, "a-token");
        let reply = send(
            &state,
            &mut team,
            &format!(r#"{{"type":"SUBMIT_BID","payload":{{"roundId":{round},"playerId":"p1","amount":-10}}}}"#),
        );
        assert_eq!(reply["code"], "invalid_amount");
    }

    #[test]
    fn team_cannot_finalize() {
        let state = state();
        let mut chair = identified(&state, "chair-token");
        let round = open_round(&state, &mut chair);
        let mut team = identified(&state, "a-token");
        for command in ["CLOSE_ROUND", "DETECT_TIES", "COMPILE_PENDING", "FINALIZE_ROUND", "CANCEL_PENDING_ALLOCATIONS", "GET_AUDIT_LOG"] {
            let reply = send(
                &state,
                &mut team,
                &format!(r#"{{"type":"{command}","payload":{{"roundId":{round}}}}}"#),
            );
            assert_eq!(reply["code"], "unauthorized", "{command}");
        }
    }

    #[test]
    fn tiebreaker_flow_over_the_protocol() {
        let state = state();
        let mut chair = identified(&state, "chair-token");
        let round = open_round(&state, &mut chair);
        let mut a = identified(&state, "a-token");
        let mut b = identified(&state, "b-token");
        for session in [&mut a, &mut b] {
            send(
                &state,
                session,
                &format!(r#"{{"type":"SUBMIT_BID","payload":{{"roundId":{round},"playerId":"p1","amount":100}}}}"#),
            );
        }

        let closed = send(
            &state,
            &mut chair,
            &format!(r#"{{"type":"CLOSE_ROUND","payload":{{"roundId":{round}}}}}"#),
        );
        let tb = closed["payload"]["tiebreakers"][0]["id"].as_i64().unwrap();

        let detected = send(
            &state,
            &mut chair,
            &format!(r#"{{"type":"DETECT_TIES","payload":{{"roundId":{round}}}}}"#),
        );
        assert_eq!(detected["payload"]["tiebreakers"][0]["id"], tb);

        let mine = send(&state, &mut a, r#"{"type":"GET_MY_TIEBREAKERS","payload":{}}"#);
        assert_eq!(mine["payload"][0]["id"], tb);

        let accepted = send(
            &state,
            &mut a,
            &format!(r#"{{"type":"TIEBREAKER_BID","payload":{{"tiebreakerId":{tb},"amount":120,"seenHighest":100}}}}"#),
        );
        assert_eq!(accepted["payload"]["outcome"], "accepted");

        let stale = send(
            &state,
            &mut b,
            &format!(r#"{{"type":"TIEBREAKER_BID","payload":{{"tiebreakerId":{tb},"amount":110,"seenHighest":100}}}}"#),
        );
        assert_eq!(stale["payload"]["outcome"], "superseded");
        assert_eq!(stale["payload"]["current_highest_bid"], 120);

        let invalid = send(
            &state,
            &mut b,
            &format!(r#"{{"type":"TIEBREAKER_BID","payload":{{"tiebreakerId":{tb},"amount":120,"seenHighest":120}}}}"#),
        );
        assert_eq!(invalid["code"], "invalid_amount");
        assert_eq!(invalid["currentHighestBid"], 120);

        let negative = send(
            &state,
            &mut b,
            &format!(r#"{{"type":"TIEBREAKER_BID","payload":{{"tiebreakerId":{tb},"amount":-1}}}}"#),
        );
        assert_eq!(negative["currentHighestBid"], 120);

        let withdrawn = send(
            &state,
            &mut b,
            &format!(r#"{{"type":"TIEBREAKER_WITHDRAW","payload":{{"tiebreakerId":{tb}}}}}"#),
        );
        assert_eq!(withdrawn["payload"]["resolution"]["winner_team"], "team_a");

        let compiled = send(
            &state,
            &mut chair,
            &format!(r#"{{"type":"COMPILE_PENDING","payload":{{"roundId":{round}}}}}"#),
        );
        assert_eq!(compiled["payload"]["allocations"][0]["amount"], 120);
        assert!(compiled["payload"]["commit"].is_null());

        let pending = send(
            &state,
            &mut chair,
            &format!(r#"{{"type":"GET_PENDING_ALLOCATIONS","payload":{{"roundId":{round}}}}}"#),
        );
        assert_eq!(pending["payload"]["summary"]["total_players"], 1);
        assert_eq!(pending["payload"]["summary"]["average_bid"], 120);

        let cancelled = send(
            &state,
            &mut chair,
            &format!(r#"{{"type":"CANCEL_PENDING_ALLOCATIONS","payload":{{"roundId":{round}}}}}"#),
        );
        assert_eq!(cancelled["payload"]["cancelled"], 1);

        let audit = send(
            &state,
            &mut chair,
            &format!(r#"{{"type":"GET_AUDIT_LOG","payload":{{"roundId":{round}}}}}"#),
        );
        let actions: Vec<_> = audit["payload"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["action"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(actions, vec!["close_round", "compile", "cancel"]);
    }

    #[test]
    fn subscribe_requires_identity() {
        let state = state();
        let mut session = Session::new();
        let reply = send(
            &state,
            &mut session,
            r#"{"type":"SUBSCRIBE","payload":{"scope":"round:1"}}"#,
        );
        assert_eq!(reply["code"], "unauthorized");

        let mut team = identified(&state, "a-token");
        let reply = send(
            &state,
            &mut team,
            r#"{"type":"SUBSCRIBE","payload":{"scope":"round:1"}}"#,
        );
        assert_eq!(reply["payload"]["scope"], "round:1");
        assert_eq!(reply["payload"]["added"], true);
    }
}
