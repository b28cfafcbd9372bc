//! Inbound message → store action translation.
//!
//! A static routing table declares, per message kind, how an inbound
//! message becomes an action for the other side's store: pass-through,
//! payload transform, or custom handler. Unknown kinds are a normal
//! occurrence (foreign traffic shares the channel) and are reported as
//! unmapped rather than treated as errors. A single switch disables the
//! whole table so an operator can kill translation without redeploying.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::clock::Clock;
use crate::config::MappingConfig;
use crate::protocol::envelope::{attach, PartialMetadata};
use crate::protocol::{kinds, Action, WireMessage};

/// Attempt log high-water mark; trimmed to [`ATTEMPT_LOG_TRIM`] on overflow.
const ATTEMPT_LOG_MAX: usize = 1000;

/// Attempt log size after a trim.
const ATTEMPT_LOG_TRIM: usize = 500;

// ── Routing table ───────────────────────────────────────────────

/// Reshape an inbound payload before the action is built. Returning
/// `Ok(None)` yields an action with no payload.
pub type PayloadTransform =
    Box<dyn Fn(Option<Value>) -> Result<Option<Value>, String> + Send + Sync>;

/// Build an action from the raw message, or decline with `Ok(None)` when
/// the kind is recognized but not representable as a single action.
pub type CustomHandler =
    Box<dyn Fn(&WireMessage) -> Result<Option<Action>, String> + Send + Sync>;

/// Check an inbound payload's shape before any routing runs.
pub type PayloadValidator = Box<dyn Fn(Option<&Value>) -> Result<(), String> + Send + Sync>;

/// How one message kind routes to an action.
enum Route {
    /// Pass the payload through unchanged.
    Direct,
    /// Reshape the payload first.
    Transform(PayloadTransform),
    /// Hand the whole message to a handler.
    Handler(CustomHandler),
}

/// One entry of the routing table.
pub struct MappingEntry {
    route: Route,
    validator: Option<PayloadValidator>,
}

/// Routing table, populated once at startup and read-only thereafter.
#[derive(Default)]
pub struct MappingTable {
    entries: HashMap<String, MappingEntry>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass-through entry: the action is the message, unchanged.
    pub fn direct(mut self, kind: &str) -> Self {
        self.entries.insert(
            kind.to_string(),
            MappingEntry {
                route: Route::Direct,
                validator: None,
            },
        );
        self
    }

    /// Entry with a payload transform.
    pub fn transform(
        mut self,
        kind: &str,
        f: impl Fn(Option<Value>) -> Result<Option<Value>, String> + Send + Sync + 'static,
    ) -> Self {
        self.entries.insert(
            kind.to_string(),
            MappingEntry {
                route: Route::Transform(Box::new(f)),
                validator: None,
            },
        );
        self
    }

    /// Entry with a custom handler.
    pub fn handler(
        mut self,
        kind: &str,
        f: impl Fn(&WireMessage) -> Result<Option<Action>, String> + Send + Sync + 'static,
    ) -> Self {
        self.entries.insert(
            kind.to_string(),
            MappingEntry {
                route: Route::Handler(Box::new(f)),
                validator: None,
            },
        );
        self
    }

    /// Attach a payload validator to the most recently added entry for
    /// `kind`. No-op when the kind has no entry.
    pub fn validate(
        mut self,
        kind: &str,
        v: impl Fn(Option<&Value>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        if let Some(entry) = self.entries.get_mut(kind) {
            entry.validator = Some(Box::new(v));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Map result ──────────────────────────────────────────────────

/// Outcome of one mapping attempt.
#[derive(Debug)]
pub enum MapResult {
    /// Translated into a single store action.
    Mapped(Action),
    /// No routing entry for this kind — normal for foreign traffic.
    Unmapped,
    /// A handler recognized the kind but declined to produce one action;
    /// the caller must apply type-specific fallback logic elsewhere.
    Declined,
    /// A validator, transform or handler failed.
    Failed { message: String },
    /// The master mapping switch is off.
    Disabled,
}

impl MapResult {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }

    pub fn into_action(self) -> Option<Action> {
        match self {
            Self::Mapped(action) => Some(action),
            _ => None,
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            Self::Mapped(_) => "mapped",
            Self::Unmapped => "unmapped",
            Self::Declined => "declined",
            Self::Failed { .. } => "failed",
            Self::Disabled => "disabled",
        }
    }
}

// ── Diagnostics ─────────────────────────────────────────────────

/// Running mapping counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MapperStats {
    pub attempts: u64,
    pub mapped: u64,
    pub failures: u64,
    /// Kinds seen without a routing entry (each recorded once).
    pub unmapped_kinds: BTreeSet<String>,
}

/// One line of the rolling attempt log.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub kind: String,
    pub outcome: &'static str,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// JSON-serializable snapshot for the diagnostics panel.
#[derive(Debug, Clone, Serialize)]
pub struct ActionLogSnapshot {
    pub generated_at: String,
    pub stats: MapperStats,
    pub attempts: Vec<AttemptRecord>,
}

struct MapperState {
    stats: MapperStats,
    attempt_log: VecDeque<AttemptRecord>,
}

// ── Action mapper ───────────────────────────────────────────────

/// Stateless-per-call translation with running statistics.
pub struct ActionMapper {
    table: MappingTable,
    enabled: AtomicBool,
    log_unmapped: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<MapperState>,
}

impl ActionMapper {
    pub fn new(table: MappingTable, config: &MappingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            table,
            enabled: AtomicBool::new(config.enabled),
            log_unmapped: config.log_unmapped,
            clock,
            state: Mutex::new(MapperState {
                stats: MapperStats::default(),
                attempt_log: VecDeque::new(),
            }),
        }
    }

    /// Operator kill switch: when off, every call returns
    /// [`MapResult::Disabled`] without consulting the table.
    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Translate one inbound message. When `meta` is supplied, a successful
    /// result is wrapped by the sync envelope before being returned.
    pub fn map(&self, message: &WireMessage, meta: Option<PartialMetadata>) -> MapResult {
        if !self.is_enabled() {
            return MapResult::Disabled;
        }

        let result = match self.table.entries.get(&message.kind) {
            None => MapResult::Unmapped,
            Some(entry) => self.apply_entry(entry, message),
        };

        let result = match result {
            MapResult::Mapped(action) => {
                let action = match meta {
                    Some(partial) => attach(action, partial, self.clock.now_ms()),
                    None => action,
                };
                MapResult::Mapped(action)
            }
            other => other,
        };

        self.record(&message.kind, &result);
        result
    }

    fn apply_entry(&self, entry: &MappingEntry, message: &WireMessage) -> MapResult {
        if let Some(validator) = &entry.validator {
            if let Err(message) = validator(message.payload.as_ref()) {
                return MapResult::Failed { message };
            }
        }

        match &entry.route {
            Route::Direct => MapResult::Mapped(Action::new(
                message.kind.clone(),
                message.payload.clone(),
            )),
            Route::Transform(transform) => match transform(message.payload.clone()) {
                Ok(payload) => MapResult::Mapped(Action::new(message.kind.clone(), payload)),
                Err(message) => MapResult::Failed { message },
            },
            Route::Handler(handler) => match handler(message) {
                Ok(Some(action)) => MapResult::Mapped(action),
                Ok(None) => MapResult::Declined,
                Err(message) => MapResult::Failed { message },
            },
        }
    }

    fn record(&self, kind: &str, result: &MapResult) {
        let mut state = self.state.lock();
        state.stats.attempts += 1;

        let detail = match result {
            MapResult::Mapped(_) => {
                state.stats.mapped += 1;
                None
            }
            MapResult::Unmapped => {
                let first_seen = state.stats.unmapped_kinds.insert(kind.to_string());
                if first_seen && self.log_unmapped {
                    tracing::debug!(kind, "no mapping entry for inbound kind");
                }
                None
            }
            MapResult::Declined => {
                state.stats.failures += 1;
                Some("handler produced no action".to_string())
            }
            MapResult::Failed { message } => {
                state.stats.failures += 1;
                tracing::warn!(kind, error = %message, "mapping attempt failed");
                Some(message.clone())
            }
            // Disabled short-circuits before record().
            MapResult::Disabled => None,
        };

        state.attempt_log.push_back(AttemptRecord {
            kind: kind.to_string(),
            outcome: result.outcome_label(),
            timestamp: self.clock.now_ms(),
            detail,
        });
        if state.attempt_log.len() > ATTEMPT_LOG_MAX {
            while state.attempt_log.len() > ATTEMPT_LOG_TRIM {
                state.attempt_log.pop_front();
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> MapperStats {
        self.state.lock().stats.clone()
    }

    /// Snapshot the rolling attempt log for the diagnostics panel.
    pub fn export_action_log(&self) -> ActionLogSnapshot {
        let state = self.state.lock();
        ActionLogSnapshot {
            generated_at: chrono::Utc::now().to_rfc3339(),
            stats: state.stats.clone(),
            attempts: state.attempt_log.iter().cloned().collect(),
        }
    }
}

// ── Default tables ──────────────────────────────────────────────

/// Routing tables for the stock core↔view vocabulary.
pub mod defaults {
    use super::*;

    fn require_object(payload: Option<&Value>) -> Result<(), String> {
        match payload {
            Some(Value::Object(_)) => Ok(()),
            Some(other) => Err(format!("expected object payload, got {other}")),
            None => Err("missing payload".to_string()),
        }
    }

    /// Messages arriving from the view, translated for the core store.
    pub fn view_to_core() -> MappingTable {
        MappingTable::new()
            .direct(kinds::SETTINGS_CHANGED)
            .validate(kinds::SETTINGS_CHANGED, require_object)
            .direct(kinds::SESSION_UPDATE)
            .direct(kinds::EXTERNAL_ACK)
            .transform(kinds::USAGE_UPDATE, |payload| {
                let payload = payload.ok_or_else(|| "missing usage payload".to_string())?;
                let input = payload.get("input_tokens").cloned();
                let output = payload.get("output_tokens").cloned();
                match (input, output) {
                    (Some(input), Some(output)) => Ok(Some(json!({
                        "input_tokens": input,
                        "output_tokens": output,
                    }))),
                    _ => Err("usage payload missing token counts".to_string()),
                }
            })
            // A wholesale restore expands into several store actions; the
            // session layer replays it, not the mapper.
            .handler(kinds::SESSION_RESTORED, |_message| Ok(None))
    }

    /// Messages arriving from the core, translated for the view store.
    pub fn core_to_view() -> MappingTable {
        MappingTable::new()
            .direct(kinds::THINKING_DELTA)
            .direct(kinds::ASSISTANT_DELTA)
            .direct(kinds::SESSION_UPDATE)
            .direct(kinds::SETTINGS_ECHO)
            // Pure completion signal — the action needs no payload.
            .transform(kinds::TASK_COMPLETED, |_payload| Ok(None))
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::envelope::extract;
    use crate::protocol::Source;
    use serde_json::json;

    fn make_mapper(table: MappingTable) -> ActionMapper {
        ActionMapper::new(
            table,
            &MappingConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[test]
    fn direct_entries_pass_messages_through_unchanged() {
        let mapper = make_mapper(defaults::view_to_core());
        let payload = json!({"theme": "dark", "font_size": 14});
        let msg = WireMessage::new(kinds::SETTINGS_CHANGED, Some(payload.clone()));

        let action = mapper.map(&msg, None).into_action().expect("mapped");
        assert_eq!(action.kind, kinds::SETTINGS_CHANGED);
        assert_eq!(action.payload, Some(payload));
        assert!(action.meta.is_none());
    }

    #[test]
    fn disabled_switch_short_circuits_everything() {
        let mapper = make_mapper(defaults::view_to_core());
        mapper.set_enabled(false);

        let known = WireMessage::new(kinds::SETTINGS_CHANGED, Some(json!({})));
        let unknown = WireMessage::new("never_declared", None);

        assert!(matches!(mapper.map(&known, None), MapResult::Disabled));
        assert!(matches!(mapper.map(&unknown, None), MapResult::Disabled));
        // Disabled calls do not count as attempts.
        assert_eq!(mapper.stats().attempts, 0);

        mapper.set_enabled(true);
        assert!(mapper.map(&known, None).is_mapped());
    }

    #[test]
    fn unknown_kind_is_unmapped_not_an_error() {
        let mapper = make_mapper(defaults::view_to_core());
        let msg = WireMessage::new("some_foreign_kind", None);

        assert!(matches!(mapper.map(&msg, None), MapResult::Unmapped));
        // Seen again: still unmapped, recorded once in the kind set.
        assert!(matches!(mapper.map(&msg, None), MapResult::Unmapped));

        let stats = mapper.stats();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.failures, 0);
        assert!(stats.unmapped_kinds.contains("some_foreign_kind"));
        assert_eq!(stats.unmapped_kinds.len(), 1);
    }

    #[test]
    fn handler_decline_is_distinct_from_unmapped() {
        let mapper = make_mapper(defaults::view_to_core());
        let msg = WireMessage::new(kinds::SESSION_RESTORED, Some(json!({"entries": []})));

        assert!(matches!(mapper.map(&msg, None), MapResult::Declined));
        let stats = mapper.stats();
        assert!(stats.unmapped_kinds.is_empty());
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn transform_error_is_caught_and_reported() {
        let mapper = make_mapper(defaults::view_to_core());
        let msg = WireMessage::new(kinds::USAGE_UPDATE, Some(json!({"input_tokens": 10})));

        match mapper.map(&msg, None) {
            MapResult::Failed { message } => assert!(message.contains("token counts")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn transform_may_drop_the_payload() {
        let mapper = make_mapper(defaults::core_to_view());
        let msg = WireMessage::new(kinds::TASK_COMPLETED, Some(json!({"elapsed_ms": 1234})));

        let action = mapper.map(&msg, None).into_action().expect("mapped");
        assert_eq!(action.kind, kinds::TASK_COMPLETED);
        assert!(action.payload.is_none());
    }

    #[test]
    fn validator_rejects_malformed_payloads() {
        let mapper = make_mapper(defaults::view_to_core());
        let msg = WireMessage::new(kinds::SETTINGS_CHANGED, Some(json!("not an object")));

        assert!(matches!(mapper.map(&msg, None), MapResult::Failed { .. }));
        assert_eq!(mapper.stats().failures, 1);
    }

    #[test]
    fn meta_is_attached_on_success_only() {
        let mapper = make_mapper(defaults::view_to_core());
        let msg = WireMessage::new(kinds::SETTINGS_CHANGED, Some(json!({})));

        let partial = PartialMetadata {
            source: Some(Source::View),
            operation_id: Some("op-map".into()),
            ..Default::default()
        };
        let action = mapper.map(&msg, Some(partial)).into_action().unwrap();

        let meta = extract(&action).expect("envelope attached");
        assert_eq!(meta.operation_id, "op-map");
        assert_eq!(meta.source, Source::View);
        assert_eq!(meta.timestamp, 1_000);
    }

    #[test]
    fn attempt_log_trims_on_overflow() {
        let mapper = make_mapper(defaults::view_to_core());
        let msg = WireMessage::new(kinds::SESSION_UPDATE, None);

        for _ in 0..=ATTEMPT_LOG_MAX {
            mapper.map(&msg, None);
        }

        let snapshot = mapper.export_action_log();
        assert_eq!(snapshot.attempts.len(), ATTEMPT_LOG_TRIM);
        assert_eq!(snapshot.stats.attempts, (ATTEMPT_LOG_MAX + 1) as u64);
        assert!(snapshot
            .attempts
            .iter()
            .all(|record| record.outcome == "mapped"));
    }

    #[test]
    fn custom_handler_builds_actions() {
        let table = MappingTable::new().handler("composite_change", |message| {
            let count = message
                .payload
                .as_ref()
                .and_then(|p| p.get("count"))
                .and_then(Value::as_u64)
                .ok_or_else(|| "missing count".to_string())?;
            Ok(Some(Action::new("change_applied", Some(json!({ "count": count })))))
        });
        let mapper = make_mapper(table);

        let msg = WireMessage::new("composite_change", Some(json!({"count": 3})));
        let action = mapper.map(&msg, None).into_action().unwrap();
        assert_eq!(action.kind, "change_applied");

        let bad = WireMessage::new("composite_change", None);
        assert!(matches!(mapper.map(&bad, None), MapResult::Failed { .. }));
    }

    #[test]
    fn export_snapshot_is_json_serializable() {
        let mapper = make_mapper(defaults::view_to_core());
        mapper.map(&WireMessage::new("mystery", None), None);

        let snapshot = mapper.export_action_log();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["stats"]["attempts"].as_u64().unwrap() >= 1);
        assert_eq!(json["attempts"][0]["outcome"], "unmapped");
    }
}
