// Notification fan-out: best-effort broadcast of auction events to watchers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{RoundId, TiebreakerId};

/// Default capacity of the broadcast channel. Receivers that fall further
/// behind than this lose the oldest events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A channel watchers subscribe to. Serialized as `round:{id}` or
/// `tiebreaker:{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    Round(RoundId),
    Tiebreaker(TiebreakerId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Round(id) => write!(f, "round:{id}"),
            Scope::Tiebreaker(id) => write!(f, "tiebreaker:{id}"),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed scope '{s}'"))?;
        let id: i64 = id
            .trim()
            .parse()
            .map_err(|_| format!("malformed scope id in '{s}'"))?;
        match kind.trim() {
            "round" => Ok(Scope::Round(id)),
            "tiebreaker" => Ok(Scope::Tiebreaker(id)),
            other => Err(format!("unknown scope kind '{other}'")),
        }
    }
}

impl TryFrom<String> for Scope {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

/// Events pushed to watchers of a round or tiebreaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuctionEvent {
    BidPlaced {
        tiebreaker_id: TiebreakerId,
        team: String,
        amount: u32,
        timestamp: DateTime<Utc>,
    },
    TeamWithdrew {
        tiebreaker_id: TiebreakerId,
        team: String,
        teams_remaining: usize,
        winner: Option<String>,
    },
    TiebreakerResolved {
        tiebreaker_id: TiebreakerId,
        winner_team: String,
        final_amount: u32,
    },
    RoundFinalized {
        round_id: RoundId,
        allocation_count: usize,
        total_spent: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedEvent {
    pub scope: Scope,
    #[serde(flatten)]
    pub event: AuctionEvent,
}

/// Broadcast hub for [`ScopedEvent`]s. Publishing never blocks and never
/// fails the caller.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ScopedEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScopedEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, scope: Scope, event: AuctionEvent) {
        match self.tx.send(ScopedEvent { scope, event }) {
            Ok(receivers) => debug!("Published event on {scope} to {receivers} receiver(s)"),
            Err(_) => debug!("No receivers for event on {scope}; dropped"),
        }
    }

    /// Publish on both a tiebreaker's own channel and its round's channel.
    pub fn publish_tiebreaker(&self, round_id: RoundId, tiebreaker_id: TiebreakerId, event: AuctionEvent) {
        self.publish(Scope::Tiebreaker(tiebreaker_id), event.clone());
        self.publish(Scope::Round(round_id), event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
