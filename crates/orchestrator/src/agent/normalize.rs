//! Normalization of raw agent messages.
//!
//! The agent's wire format has drifted over time (most visibly the name of
//! the cost field on the terminal message), so the orchestrator reads raw
//! JSON and resolves those differences itself instead of trusting whatever
//! parser ships with the agent.

use serde_json::{Map, Value};
use thiserror::Error;

/// Synonyms for the cost figure, in lookup order.
pub const COST_FIELDS: [&str; 4] = ["cost_usd", "total_cost_usd", "total_cost", "cost"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MalformedMessage(pub String);

/// The distinguished last message of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalMessage {
    pub subtype: String,
    pub cost_usd: f64,
    /// Which synonym the cost was read from.
    pub cost_field: &'static str,
    pub duration_ms: Option<u64>,
    pub is_error: bool,
    pub num_turns: Option<u32>,
    pub session_id: String,
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    System {
        subtype: Option<String>,
        session_id: Option<String>,
        raw: Value,
    },
    Assistant {
        session_id: Option<String>,
        raw: Value,
    },
    User {
        session_id: Option<String>,
        raw: Value,
    },
    Result(TerminalMessage),
    Other {
        kind: Option<String>,
        raw: Value,
    },
}

impl AgentMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id, .. } => session_id.as_deref(),
            Self::Result(terminal) => Some(&terminal.session_id),
            Self::Other { .. } => None,
        }
    }

    pub fn as_terminal(&self) -> Option<&TerminalMessage> {
        match self {
            Self::Result(terminal) => Some(terminal),
            _ => None,
        }
    }
}

/// Resolve the cost figure of a terminal message.
///
/// Returns the first synonym that is present and non-null, in [`COST_FIELDS`]
/// order. A present `0.0` is a real zero and stops the lookup. `Ok(None)`
/// means no synonym is present at all.
pub fn resolve_cost(fields: &Map<String, Value>) -> Result<Option<(f64, &'static str)>, MalformedMessage> {
    for name in COST_FIELDS {
        match fields.get(name) {
            None | Some(Value::Null) => continue,
            Some(value) => {
                let cost = value.as_f64().ok_or_else(|| {
                    MalformedMessage(format!("cost field `{name}` is not a number: {value}"))
                })?;
                if !cost.is_finite() || cost < 0.0 {
                    return Err(MalformedMessage(format!(
                        "cost field `{name}` holds invalid value {cost}"
                    )));
                }
                return Ok(Some((cost, name)));
            }
        }
    }
    Ok(None)
}

fn str_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).map(String::from)
}

fn parse_terminal(fields: &Map<String, Value>) -> Result<TerminalMessage, MalformedMessage> {
    let subtype = str_field(fields, "subtype")
        .ok_or_else(|| MalformedMessage("terminal message has no `subtype`".to_string()))?;
    let session_id = str_field(fields, "session_id")
        .ok_or_else(|| MalformedMessage("terminal message has no `session_id`".to_string()))?;
    let (cost_usd, cost_field) = resolve_cost(fields)?.ok_or_else(|| {
        MalformedMessage(format!(
            "terminal message carries none of the cost fields {}",
            COST_FIELDS.join(", ")
        ))
    })?;

    let is_error = fields
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| subtype.starts_with("error"));

    Ok(TerminalMessage {
        subtype,
        cost_usd,
        cost_field,
        duration_ms: fields.get("duration_ms").and_then(Value::as_u64),
        is_error,
        num_turns: fields
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        session_id,
        result: str_field(fields, "result"),
    })
}

/// Classify one raw message.
///
/// Only a `result` message can be malformed; anything unrecognized is kept
/// as [`AgentMessage::Other`].
pub fn normalize_message(raw: Value) -> Result<AgentMessage, MalformedMessage> {
    let Some(fields) = raw.as_object() else {
        return Ok(AgentMessage::Other { kind: None, raw });
    };

    let kind = str_field(fields, "type");
    let subtype = str_field(fields, "subtype");
    let session_id = str_field(fields, "session_id");

    let message = match kind.as_deref() {
        Some("result") => AgentMessage::Result(parse_terminal(fields)?),
        Some("system") => AgentMessage::System {
            subtype,
            session_id,
            raw,
        },
        Some("assistant") => AgentMessage::Assistant { session_id, raw },
        Some("user") => AgentMessage::User { session_id, raw },
        _ => AgentMessage::Other { kind, raw },
    };
    Ok(message)
}
