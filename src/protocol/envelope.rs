//! Attach and extract sync provenance on store actions.
//!
//! Pure functions: the caller supplies the current clock reading, so the
//! envelope itself holds no state and no time source.

use super::{Action, MessageMeta, Source, SyncMetadata};

/// Fields a caller wants stamped onto an action; anything left `None`
/// falls back to the action's existing metadata, then to a generated
/// default.
#[derive(Debug, Clone, Default)]
pub struct PartialMetadata {
    pub source: Option<Source>,
    pub operation_id: Option<String>,
    pub timestamp: Option<u64>,
    pub skip_sync: bool,
}

impl From<&SyncMetadata> for PartialMetadata {
    fn from(meta: &SyncMetadata) -> Self {
        Self {
            source: Some(meta.source),
            operation_id: Some(meta.operation_id.clone()),
            timestamp: Some(meta.timestamp),
            skip_sync: meta.skip_sync,
        }
    }
}

/// Freshly generated operation id (UUID v4).
pub fn new_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Merge `partial` into the action's `meta.sync` block.
///
/// Precedence per field: caller-supplied value, then the action's existing
/// metadata, then a generated default (`operation_id` → fresh UUID,
/// `timestamp` → `now_ms`, `source` → `External`). `skip_sync` is sticky:
/// once either side sets it, it stays set.
pub fn attach(mut action: Action, partial: PartialMetadata, now_ms: u64) -> Action {
    let existing = action.meta.as_ref().and_then(|m| m.sync.as_ref());

    let sync = SyncMetadata {
        source: partial
            .source
            .or_else(|| existing.map(|m| m.source))
            .unwrap_or(Source::External),
        operation_id: partial
            .operation_id
            .or_else(|| existing.map(|m| m.operation_id.clone()))
            .unwrap_or_else(new_operation_id),
        timestamp: partial
            .timestamp
            .or_else(|| existing.map(|m| m.timestamp))
            .unwrap_or(now_ms),
        skip_sync: partial.skip_sync || existing.is_some_and(|m| m.skip_sync),
    };

    action.meta.get_or_insert_with(MessageMeta::default).sync = Some(sync);
    action
}

/// The sync metadata carried by an action, if any.
pub fn extract(action: &Action) -> Option<&SyncMetadata> {
    action.sync_meta()
}

/// Whether an action carries sync provenance.
pub fn has_sync_metadata(action: &Action) -> bool {
    action.sync_meta().is_some()
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::kinds;
    use serde_json::json;

    #[test]
    fn attach_generates_defaults() {
        let action = Action::new(kinds::SESSION_UPDATE, Some(json!({"v": 1})));
        let stamped = attach(
            action,
            PartialMetadata {
                source: Some(Source::Core),
                ..Default::default()
            },
            42_000,
        );

        let meta = extract(&stamped).expect("metadata attached");
        assert_eq!(meta.source, Source::Core);
        assert_eq!(meta.timestamp, 42_000);
        assert!(!meta.operation_id.is_empty());
        assert!(!meta.skip_sync);
        assert!(has_sync_metadata(&stamped));
    }

    #[test]
    fn attach_preserves_supplied_fields() {
        let action = Action::new(kinds::SETTINGS_CHANGED, None);
        let stamped = attach(
            action,
            PartialMetadata {
                source: Some(Source::View),
                operation_id: Some("op-7".into()),
                timestamp: Some(99),
                skip_sync: true,
            },
            42_000,
        );

        let meta = extract(&stamped).unwrap();
        assert_eq!(meta.operation_id, "op-7");
        assert_eq!(meta.timestamp, 99);
        assert!(meta.skip_sync);
    }

    #[test]
    fn attach_merges_over_existing_metadata() {
        let action = Action::new(kinds::SETTINGS_CHANGED, None);
        let first = attach(
            action,
            PartialMetadata {
                source: Some(Source::View),
                operation_id: Some("op-first".into()),
                timestamp: Some(10),
                skip_sync: true,
            },
            10,
        );

        // Re-attach with only a new source: the other fields survive,
        // including the sticky skip flag.
        let second = attach(
            first,
            PartialMetadata {
                source: Some(Source::Core),
                ..Default::default()
            },
            20,
        );

        let meta = extract(&second).unwrap();
        assert_eq!(meta.source, Source::Core);
        assert_eq!(meta.operation_id, "op-first");
        assert_eq!(meta.timestamp, 10);
        assert!(meta.skip_sync);
    }

    #[test]
    fn extract_absent_metadata() {
        let action = Action::new(kinds::SESSION_UPDATE, None);
        assert!(extract(&action).is_none());
        assert!(!has_sync_metadata(&action));
    }

    #[test]
    fn generated_operation_ids_are_unique() {
        let a = new_operation_id();
        let b = new_operation_id();
        assert_ne!(a, b);
    }

    #[test]
    fn partial_from_full_metadata() {
        let full = SyncMetadata {
            source: Source::View,
            operation_id: "op-9".into(),
            timestamp: 7,
            skip_sync: false,
        };
        let partial = PartialMetadata::from(&full);
        assert_eq!(partial.operation_id.as_deref(), Some("op-9"));
        assert_eq!(partial.timestamp, Some(7));
    }
}
