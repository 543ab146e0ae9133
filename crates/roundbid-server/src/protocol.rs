// Wire protocol: JSON frames exchanged with WebSocket clients.
//
// Client frames carry `type`, `payload` and an optional `requestId`, which
// the server echoes on the matching RESPONSE or ERROR frame. EVENT frames
// are pushed to connections subscribed to the event's scope.

use serde::{Deserialize, Serialize};

use roundbid_core::events::{Scope, ScopedEvent};
use roundbid_core::model::{FinalizationMode, RoundId, TiebreakerId};
use roundbid_core::EngineError;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    #[serde(default)]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    Identify {
        token: String,
    },
    Subscribe {
        scope: Scope,
    },
    Unsubscribe {
        scope: Scope,
    },
    CreateRound {
        season_id: String,
        position: String,
        round_number: u32,
        #[serde(default)]
        finalization_mode: Option<FinalizationMode>,
        #[serde(default)]
        max_bids_per_team: Option<u32>,
        #[serde(default)]
        bid_increment: Option<u32>,
    },
    OpenRound {
        round_id: RoundId,
    },
    SubmitBid {
        round_id: RoundId,
        player_id: String,
        amount: i64,
    },
    TiebreakerBid {
        tiebreaker_id: TiebreakerId,
        amount: i64,
        #[serde(default)]
        seen_highest: Option<i64>,
    },
    TiebreakerWithdraw {
        tiebreaker_id: TiebreakerId,
    },
    GetTiebreaker {
        tiebreaker_id: TiebreakerId,
    },
    GetMyTiebreakers {},
    CloseRound {
        round_id: RoundId,
    },
    DetectTies {
        round_id: RoundId,
    },
    CompilePending {
        round_id: RoundId,
    },
    GetPendingAllocations {
        round_id: RoundId,
    },
    FinalizeRound {
        round_id: RoundId,
    },
    CancelPendingAllocations {
        round_id: RoundId,
    },
    GetAuditLog {
        round_id: RoundId,
    },
}

impl Command {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify { .. } => "IDENTIFY",
            Command::Subscribe { .. } => "SUBSCRIBE",
            Command::Unsubscribe { .. } => "UNSUBSCRIBE",
            Command::CreateRound { .. } => "CREATE_ROUND",
            Command::OpenRound { .. } => "OPEN_ROUND",
            Command::SubmitBid { .. } => "SUBMIT_BID",
            Command::TiebreakerBid { .. } => "TIEBREAKER_BID",
            Command::TiebreakerWithdraw { .. } => "TIEBREAKER_WITHDRAW",
            Command::GetTiebreaker { .. } => "GET_TIEBREAKER",
            Command::GetMyTiebreakers {} => "GET_MY_TIEBREAKERS",
            Command::CloseRound { .. } => "CLOSE_ROUND",
            Command::DetectTies { .. } => "DETECT_TIES",
            Command::CompilePending { .. } => "COMPILE_PENDING",
            Command::GetPendingAllocations { .. } => "GET_PENDING_ALLOCATIONS",
            Command::FinalizeRound { .. } => "FINALIZE_ROUND",
            Command::CancelPendingAllocations { .. } => "CANCEL_PENDING_ALLOCATIONS",
            Command::GetAuditLog { .. } => "GET_AUDIT_LOG",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Response {
        request_id: Option<u64>,
        payload: serde_json::Value,
    },
    Error {
        request_id: Option<u64>,
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_highest_bid: Option<u32>,
    },
    Event {
        payload: ScopedEvent,
    },
}

impl ServerMessage {
    pub fn error(request_id: Option<u64>, code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id,
            code: code.to_string(),
            message: message.into(),
            current_highest_bid: None,
        }
    }

    pub fn from_engine_error(request_id: Option<u64>, err: &EngineError) -> Self {
        let current_highest_bid = match err {
            EngineError::InvalidAmount {
                current_highest_bid, ..
            } => *current_highest_bid,
            _ => None,
        };
        ServerMessage::Error {
            request_id,
            code: err.code().to_string(),
            message: err.to_string(),
            current_highest_bid,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"ERROR","code":"internal","message":"failed to encode frame: {e}"}}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roundbid_core::events::AuctionEvent;

    fn parse(json: &str) -> ClientRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_submit_bid_with_request_id() {
        let req = parse(
            r#"{"type":"SUBMIT_BID","requestId":7,"payload":{"roundId":3,"playerId":"p9","amount":40}}"#,
        );
        assert_eq!(req.request_id, Some(7));
        assert_eq!(
            req.command,
            Command::SubmitBid {
                round_id: 3,
                player_id: "p9".into(),
                amount: 40
            }
        );
    }

    #[test]
    fn parses_tiebreaker_bid_without_seen_highest() {
        let req = parse(r#"{"type":"TIEBREAKER_BID","payload":{"tiebreakerId":2,"amount":110}}"#);
        assert_eq!(req.request_id, None);
        assert_eq!(
            req.command,
            Command::TiebreakerBid {
                tiebreaker_id: 2,
                amount: 110,
                seen_highest: None
            }
        );
    }

    #[test]
    fn parses_subscribe_scope() {
        let req = parse(r#"{"type":"SUBSCRIBE","payload":{"scope":"tiebreaker:4"}}"#);
        assert_eq!(
            req.command,
            Command::Subscribe {
                scope: Scope::Tiebreaker(4)
            }
        );
    }

    #[test]
    fn parses_payload_free_command() {
        let req = parse(r#"{"type":"GET_MY_TIEBREAKERS","payload":{}}"#);
        assert_eq!(req.command, Command::GetMyTiebreakers {});
    }

    #[test]
    fn rejects_unknown_command_and_bad_scope() {
        assert!(serde_json::from_str::<ClientRequest>(r#"{"type":"DROP_TABLES","payload":{}}"#).is_err());
        assert!(serde_json::from_str::<ClientRequest>(
            r#"{"type":"SUBSCRIBE","payload":{"scope":"league:1"}}"#
        )
        .is_err());
    }

    #[test]
    fn negative_amount_survives_parsing() {
        let req = parse(r#"{"type":"SUBMIT_BID","payload":{"roundId":1,"playerId":"p","amount":-5}}"#);
        assert!(matches!(req.command, Command::SubmitBid { amount: -5, .. }));
    }

    #[test]
    fn error_frame_carries_code_and_current_highest() {
        let err = EngineError::InvalidAmount {
            amount: 100,
            reason: "must exceed the current highest bid of 110".into(),
            current_highest_bid: Some(110),
        };
        let json: serde_json::Value =
            serde_json::from_str(&ServerMessage::from_engine_error(Some(3), &err).to_json()).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["requestId"], 3);
        assert_eq!(json["code"], "invalid_amount");
        assert_eq!(json["currentHighestBid"], 110);
    }

    #[test]
    fn error_frame_omits_missing_highest_bid() {
        let frame = ServerMessage::from_engine_error(None, &EngineError::NoPendingAllocations(2));
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["code"], "no_pending_allocations");
        assert!(json.get("currentHighestBid").is_none());
    }

    #[test]
    fn event_frame_shape() {
        let frame = ServerMessage::Event {
            payload: ScopedEvent {
                scope: Scope::Round(1),
                event: AuctionEvent::RoundFinalized {
                    round_id: 1,
                    allocation_count: 2,
                    total_spent: 130,
                },
            },
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "EVENT");
        assert_eq!(json["payload"]["scope"], "round:1");
        assert_eq!(json["payload"]["event"], "round_finalized");
        assert_eq!(json["payload"]["total_spent"], 130);
    }
}
