// Per-connection session state and token-based identity resolution.

use std::collections::{HashMap, HashSet};

use roundbid_core::events::Scope;
use roundbid_core::model::{Actor, Role};
use roundbid_core::EngineError;

use crate::config::CredentialsConfig;

/// Maps identity tokens to actors. Stands in for an external identity
/// provider.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    actors: HashMap<String, Actor>,
}

impl IdentityTable {
    pub fn from_config(credentials: &CredentialsConfig) -> Self {
        let actors = credentials
            .tokens
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    Actor {
                        name: entry.name.clone(),
                        role: entry.role,
                        team_id: entry.team_id.clone(),
                    },
                )
            })
            .collect();
        Self { actors }
    }

    pub fn insert(&mut self, token: &str, actor: Actor) {
        self.actors.insert(token.to_string(), actor);
    }

    pub fn resolve(&self, token: &str) -> Option<&Actor> {
        self.actors.get(token)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

/// State for one client connection.
#[derive(Debug, Default)]
pub struct Session {
    actor: Option<Actor>,
    subscriptions: HashSet<Scope>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identify(&mut self, actor: Actor) {
        self.actor = Some(actor);
    }

    pub fn actor(&self) -> Result<&Actor, EngineError> {
        self.actor
            .as_ref()
            .ok_or_else(|| EngineError::Unauthorized("connection has not identified".into()))
    }

    /// The team this connection bids for.
    pub fn team_id(&self) -> Result<&str, EngineError> {
        let actor = self.actor()?;
        match (&actor.role, &actor.team_id) {
            (Role::Team, Some(team)) => Ok(team.as_str()),
            _ => Err(EngineError::Unauthorized(format!(
                "{} does not bid for a team",
                actor.name
            ))),
        }
    }

    /// Returns `true` if the scope was newly added.
    pub fn subscribe(&mut self, scope: Scope) -> bool {
        self.subscriptions.insert(scope)
    }

    pub fn unsubscribe(&mut self, scope: &Scope) -> bool {
        self.subscriptions.remove(scope)
    }

    pub fn is_subscribed(&self, scope: &Scope) -> bool {
        self.subscriptions.contains(scope)
    }
}
