//! Wire vocabulary shared by the core and view sides.
//!
//! Both endpoints exchange `{ type, payload }`-shaped JSON messages,
//! optionally decorated with a `meta.sync` provenance block. This module
//! defines those shapes plus the message-kind vocabulary; it carries no
//! behavior beyond construction helpers.

pub mod envelope;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[allow(unused_imports)]
pub use envelope::{attach, extract, has_sync_metadata, new_operation_id, PartialMetadata};

// ── Message kinds ───────────────────────────────────────────────

/// Well-known message kinds exchanged between the core and the view.
///
/// Inbound traffic is not restricted to this list — unknown kinds are a
/// normal occurrence and are reported as unmapped, not rejected.
pub mod kinds {
    /// Incremental reasoning text streamed from the core.
    pub const THINKING_DELTA: &str = "thinking_delta";
    /// Incremental response text streamed from the core.
    pub const ASSISTANT_DELTA: &str = "assistant_delta";
    /// A full session-state refresh.
    pub const SESSION_UPDATE: &str = "session_update";
    /// The user changed a setting on one side.
    pub const SETTINGS_CHANGED: &str = "settings_changed";
    /// The receiving side confirms a settings application.
    pub const SETTINGS_ECHO: &str = "settings_echo";
    /// An external collaborator acknowledged a forwarded change.
    pub const EXTERNAL_ACK: &str = "external_ack";
    /// A long-running task finished; pure signal, no payload required.
    pub const TASK_COMPLETED: &str = "task_completed";
    /// A previously saved session was restored wholesale.
    pub const SESSION_RESTORED: &str = "session_restored";
    /// Token-usage counters changed.
    pub const USAGE_UPDATE: &str = "usage_update";
}

// ── Sides and directions ────────────────────────────────────────

/// Originating side of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The view process (panel/webview side).
    View,
    /// The core process (host side).
    Core,
    /// Neither side — e.g. a bulk reload injected from outside.
    External,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Core => "core",
            Self::External => "external",
        }
    }
}

/// Direction a sync operation travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Core-side change being forwarded to the view.
    ToView,
    /// View-side change being forwarded to the core.
    ToCore,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::ToView => Self::ToCore,
            Self::ToCore => Self::ToView,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToView => "to_view",
            Self::ToCore => "to_core",
        }
    }
}

// ── Provenance metadata ─────────────────────────────────────────

/// Provenance stamped on every action that crossed the bridge.
///
/// Downstream consumers use this to recognize an action's sync lineage
/// without re-deriving it; the coordinator uses `operation_id` to reject
/// replays of the same logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Which side originated the change.
    pub source: Source,
    /// Globally unique id for this logical sync attempt.
    pub operation_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Set by a caller that knows the change must not propagate further.
    #[serde(default)]
    pub skip_sync: bool,
}

/// Metadata block carried under `meta` on messages and actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncMetadata>,
}

// ── Wire message and store action ───────────────────────────────

/// A message as it crosses the core↔view channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

impl WireMessage {
    pub fn new(kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            meta: None,
        }
    }

    /// The sync provenance attached to this message, if any.
    pub fn sync_meta(&self) -> Option<&SyncMetadata> {
        self.meta.as_ref().and_then(|m| m.sync.as_ref())
    }
}

/// An action handed to a store's dispatch function.
///
/// Same shape as [`WireMessage`]; kept as a distinct type so the mapper's
/// input and output cannot be confused at the store boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

impl Action {
    pub fn new(kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            meta: None,
        }
    }

    /// The sync provenance attached to this action, if any.
    pub fn sync_meta(&self) -> Option<&SyncMetadata> {
        self.meta.as_ref().and_then(|m| m.sync.as_ref())
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_message_serialization_roundtrip() {
        let msg = WireMessage::new(kinds::SETTINGS_CHANGED, Some(json!({"theme": "dark"})));

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"settings_changed\""));

        let parsed: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn payload_and_meta_omitted_when_absent() {
        let msg = WireMessage::new(kinds::TASK_COMPLETED, None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("payload"));
        assert!(!json.contains("meta"));
    }

    #[test]
    fn sync_meta_reads_through_meta_block() {
        let mut msg = WireMessage::new(kinds::SESSION_UPDATE, None);
        assert!(msg.sync_meta().is_none());

        msg.meta = Some(MessageMeta {
            sync: Some(SyncMetadata {
                source: Source::Core,
                operation_id: "op-1".into(),
                timestamp: 1_000,
                skip_sync: false,
            }),
        });
        assert_eq!(msg.sync_meta().unwrap().operation_id, "op-1");
    }

    #[test]
    fn direction_opposite_flips() {
        assert_eq!(Direction::ToView.opposite(), Direction::ToCore);
        assert_eq!(Direction::ToCore.opposite(), Direction::ToView);
    }

    #[test]
    fn skip_sync_defaults_to_false() {
        let parsed: SyncMetadata = serde_json::from_str(
            r#"{"source":"view","operation_id":"op-2","timestamp":5}"#,
        )
        .unwrap();
        assert!(!parsed.skip_sync);
        assert_eq!(parsed.source, Source::View);
    }
}
