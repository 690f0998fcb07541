//! Job-request handlers for reserved event kinds.
//!
//! Events whose kind falls in the NIP-90 job-request range are answered by a
//! handler instead of being broadcast. Handlers are synchronous and see only
//! the request event; the relay delivers whatever they return to the
//! requesting connection.

use std::{collections::HashMap, ops::RangeInclusive, sync::Arc};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    event::{Event, Tag},
    relay::RelayError,
};

/// Kinds that may be routed to a handler.
pub const JOB_REQUEST_KINDS: RangeInclusive<u32> = 5000..=5999;

/// Kind of agent command requests.
pub const AGENT_COMMAND_KIND: u32 = 5838;

/// Offset between a request kind and its result kind.
pub const RESULT_KIND_OFFSET: u32 = 1000;

const AGENT_COMMAND_ACK: &str = "Acknowledged. Will respond shortly.";

/// Failure reported by a handler.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("handler panicked")]
    Panicked,
}

/// Synchronous collaborator answering one request event with one response.
pub trait ServiceHandler: Send + Sync {
    fn handle(&self, request: &Event) -> Result<Event, ServiceError>;
}

/// Dispatch table from job-request kind to handler.
#[derive(Clone, Default)]
pub struct Services {
    handlers: HashMap<u32, Arc<dyn ServiceHandler>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table with the built-in handlers for `kinds`. Kinds without a
    /// built-in handler are skipped with a warning.
    pub fn builtin(kinds: &[u32]) -> Self {
        let mut services = Self::new();
        for &kind in kinds {
            match kind {
                AGENT_COMMAND_KIND => {
                    // always in range
                    let _ = services.register(kind, Arc::new(AgentCommand));
                }
                other => warn!(kind = other, "no built-in handler for kind"),
            }
        }
        services
    }

    /// Route `kind` to `handler`. Only job-request kinds are accepted.
    pub fn register(
        &mut self,
        kind: u32,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<(), RelayError> {
        if !JOB_REQUEST_KINDS.contains(&kind) {
            return Err(RelayError::KindOutOfRange(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: u32) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<u32> {
        let mut kinds: Vec<u32> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Build a relay-authored result event for `request`.
///
/// The relay holds no signing key, so `pubkey` and `sig` stay empty; the id
/// is still derived from the content.
pub fn result_event(request: &Event, kind: u32, content: impl Into<String>) -> Event {
    let mut ev = Event {
        id: String::new(),
        pubkey: String::new(),
        created_at: Utc::now().timestamp(),
        kind,
        tags: vec![
            Tag(vec!["e".into(), request.id.clone()]),
            Tag(vec!["p".into(), request.pubkey.clone()]),
        ],
        content: content.into(),
        sig: String::new(),
    };
    ev.id = ev.compute_id().unwrap_or_default();
    ev
}

/// Result event describing a failed request.
pub fn failure_event(request: &Event, err: &ServiceError) -> Event {
    result_event(
        request,
        request.kind.saturating_add(RESULT_KIND_OFFSET),
        format!("error: {err}"),
    )
}

/// Acknowledges agent command requests.
///
/// The command is the value of the first `["i", <command>, ...]` tag.
pub struct AgentCommand;

impl AgentCommand {
    pub fn command(request: &Event) -> Option<&str> {
        request.tag_value("i")
    }
}

impl ServiceHandler for AgentCommand {
    fn handle(&self, request: &Event) -> Result<Event, ServiceError> {
        let command = Self::command(request)
            .ok_or_else(|| ServiceError::InvalidRequest("missing `i` tag".into()))?;
        info!(
            id = %request.id,
            pubkey = %request.pubkey,
            created_at = request.created_at,
            tags = ?request.tags,
            command,
            "agent command request"
        );
        Ok(result_event(
            request,
            AGENT_COMMAND_KIND + RESULT_KIND_OFFSET,
            AGENT_COMMAND_ACK,
        ))
    }
}
