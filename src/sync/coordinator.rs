//! Sync admission control — the loop-prevention engine.
//!
//! `begin_sync` decides whether a forwarding attempt may proceed; the
//! rules run in order and short-circuit on the first rejection:
//!
//! 1. Explicit skip flag on the supplied metadata
//! 2. Directional mutual exclusion (the primary loop breaker)
//! 3. Circular operation id (replay within the recent-operation window)
//! 4. Duplicate content (same kind + payload within the duplicate window)
//! 5. Hot declared pattern
//! 6. Chain anomaly (kind repetition or pattern subsequence)
//!
//! Rule 2 alone stops the classic two-hop ping-pong; rules 3–6 catch
//! slower content-level and chain-level cycles where directions never
//! overlap instantaneously. Routine rejections log at debug; pattern and
//! chain detections indicate a real anomaly and log at warn.
//!
//! Every shared structure lives behind one mutex, so no two admission
//! checks interleave mid-decision even on a multi-threaded runtime.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::protocol::envelope::new_operation_id;
use crate::protocol::{kinds, Direction, Source, SyncMetadata};
use crate::sync::loop_detect::{
    ChainTable, ContentHashIndex, LoopPattern, PatternSet, PatternSpec, RecentOperationWindow,
    KIND_REPEAT_LIMIT, OPERATION_TTL_MS,
};
use crate::telemetry::PerformanceMonitor;

// ── In-flight context ───────────────────────────────────────────

/// Handle for one admitted, in-flight sync operation. Created by
/// `begin_sync`, consumed exactly once by `complete_sync`/`fail_sync`.
#[derive(Debug)]
pub struct SyncContext {
    pub operation_id: String,
    pub direction: Direction,
    pub message_kind: String,
    pub source: Source,
    pub started_at: u64,
}

/// Diagnostic view of an in-flight operation.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub operation_id: String,
    pub direction: Direction,
    pub message_kind: String,
    pub started_at: u64,
}

/// Counts exposed by [`SyncCoordinator::loop_detection_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct LoopDetectionStats {
    pub tracked_hashes: usize,
    pub active_chains: usize,
    pub recent_operations: usize,
    pub hot_patterns: usize,
    pub detected_patterns: Vec<LoopPattern>,
}

struct Hold {
    operation_id: String,
    since: u64,
}

struct CoordinatorState {
    holds_to_view: Vec<Hold>,
    holds_to_core: Vec<Hold>,
    active: HashMap<String, ActiveOperation>,
    window: RecentOperationWindow,
    hashes: ContentHashIndex,
    chains: ChainTable,
    patterns: PatternSet,
}

impl CoordinatorState {
    fn holds(&self, direction: Direction) -> &Vec<Hold> {
        match direction {
            Direction::ToView => &self.holds_to_view,
            Direction::ToCore => &self.holds_to_core,
        }
    }

    fn holds_mut(&mut self, direction: Direction) -> &mut Vec<Hold> {
        match direction {
            Direction::ToView => &mut self.holds_to_view,
            Direction::ToCore => &mut self.holds_to_core,
        }
    }
}

// ── Coordinator ─────────────────────────────────────────────────

/// Governs whether a given (direction, kind, payload) may be forwarded.
///
/// One instance per core↔view channel pair; independent pairs get
/// independent coordinators.
pub struct SyncCoordinator {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    monitor: Arc<PerformanceMonitor>,
    state: Mutex<CoordinatorState>,
}

impl SyncCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        patterns: Vec<PatternSpec>,
        monitor: Arc<PerformanceMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let duplicate_window_ms = config.duplicate_window_ms;
        Self {
            config,
            clock,
            monitor,
            state: Mutex::new(CoordinatorState {
                holds_to_view: Vec::new(),
                holds_to_core: Vec::new(),
                active: HashMap::new(),
                window: RecentOperationWindow::new(OPERATION_TTL_MS),
                hashes: ContentHashIndex::new(duplicate_window_ms),
                chains: ChainTable::new(),
                patterns: PatternSet::new(patterns),
            }),
        }
    }

    /// The monitor this coordinator records completions into.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Admission check. Returns `None` when the operation must not be
    /// forwarded; otherwise the context to pass back to `complete_sync`.
    pub fn begin_sync(
        &self,
        direction: Direction,
        kind: &str,
        meta: Option<&SyncMetadata>,
        payload: Option<&Value>,
    ) -> Option<SyncContext> {
        // Rule 1: the caller already knows not to propagate.
        if meta.is_some_and(|m| m.skip_sync) {
            tracing::debug!(kind, direction = direction.as_str(), "skip flag set, not syncing");
            return None;
        }

        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        self.reclaim_stale_holds(&mut state, now);

        // Rule 2: a change observed while forwarding in the other direction
        // is downstream of that forwarding and must not bounce back.
        if !state.holds(direction.opposite()).is_empty() {
            tracing::debug!(
                kind,
                direction = direction.as_str(),
                "opposite direction in progress, not syncing"
            );
            return None;
        }

        // Rule 3: the same logical operation is being re-admitted.
        if let Some(meta) = meta {
            if state.window.contains(&meta.operation_id, now) {
                tracing::debug!(
                    kind,
                    operation_id = %meta.operation_id,
                    "circular operation id, not syncing"
                );
                return None;
            }
        }

        // Rule 4: identical content twice in quick succession.
        if state.hashes.check_and_record(kind, payload, now) {
            tracing::debug!(kind, "duplicate content within window, not syncing");
            return None;
        }

        // Rule 5: a declared loop pattern is hot.
        if let Some(pattern_id) = state.patterns.observe(kind, now) {
            tracing::warn!(
                kind,
                pattern = %pattern_id,
                "hot loop pattern, blocking message kind"
            );
            return None;
        }

        let operation_id = meta
            .map(|m| m.operation_id.clone())
            .unwrap_or_else(new_operation_id);

        // Rule 6: track the operation in the active chain and inspect the
        // chain's kind history.
        let chain_index = state.chains.record(&operation_id, kind, now);
        let chain = state.chains.get(chain_index);
        if chain.kind_count(kind) > KIND_REPEAT_LIMIT {
            tracing::warn!(
                kind,
                chain_id = %chain.chain_id,
                count = chain.kind_count(kind),
                "message kind repeating within operation chain, not syncing"
            );
            return None;
        }
        if let Some(pattern) = state.patterns.sequence_match(&chain.message_kinds) {
            tracing::warn!(
                kind,
                chain_id = %chain.chain_id,
                pattern = %pattern.id,
                "operation chain contains declared loop pattern, not syncing"
            );
            return None;
        }

        // Admitted: raise the directional flag and remember the operation.
        let source = meta.map(|m| m.source).unwrap_or(match direction {
            Direction::ToView => Source::Core,
            Direction::ToCore => Source::View,
        });

        state.holds_mut(direction).push(Hold {
            operation_id: operation_id.clone(),
            since: now,
        });
        state.window.insert(operation_id.clone(), now);
        state.active.insert(
            operation_id.clone(),
            ActiveOperation {
                operation_id: operation_id.clone(),
                direction,
                message_kind: kind.to_string(),
                started_at: now,
            },
        );

        Some(SyncContext {
            operation_id,
            direction,
            message_kind: kind.to_string(),
            source,
            started_at: now,
        })
    }

    /// Begin a core→view forward.
    pub fn begin_to_view(
        &self,
        kind: &str,
        meta: Option<&SyncMetadata>,
        payload: Option<&Value>,
    ) -> Option<SyncContext> {
        self.begin_sync(Direction::ToView, kind, meta, payload)
    }

    /// Begin a view→core forward.
    pub fn begin_to_core(
        &self,
        kind: &str,
        meta: Option<&SyncMetadata>,
        payload: Option<&Value>,
    ) -> Option<SyncContext> {
        self.begin_sync(Direction::ToCore, kind, meta, payload)
    }

    /// Mark an admitted operation finished: clear its directional hold and
    /// record its duration.
    pub fn complete_sync(&self, ctx: SyncContext) {
        self.finish(ctx, false);
    }

    /// Like `complete_sync`, but records the operation as errored.
    pub fn fail_sync(&self, ctx: SyncContext, reason: &str) {
        tracing::warn!(
            kind = %ctx.message_kind,
            operation_id = %ctx.operation_id,
            reason,
            "sync operation failed"
        );
        self.finish(ctx, true);
    }

    fn finish(&self, ctx: SyncContext, error: bool) {
        let now = self.clock.now_ms();
        let duration_ms = now.saturating_sub(ctx.started_at);

        {
            let mut state = self.state.lock();
            let holds = state.holds_mut(ctx.direction);
            if let Some(pos) = holds
                .iter()
                .position(|h| h.operation_id == ctx.operation_id)
            {
                holds.remove(pos);
            } else {
                // The watchdog reclaimed this hold while the operation ran.
                tracing::debug!(
                    operation_id = %ctx.operation_id,
                    "completing operation whose hold was already reclaimed"
                );
            }
            state.active.remove(&ctx.operation_id);
        }

        self.monitor
            .record(&ctx.message_kind, ctx.direction, duration_ms, error);

        if duration_ms > self.config.slow_sync_warn_ms {
            tracing::warn!(
                kind = %ctx.message_kind,
                direction = ctx.direction.as_str(),
                duration_ms,
                "slow sync operation"
            );
        }
    }

    /// Drop directional holds whose owner never called `complete_sync`.
    /// An abandoned hold would otherwise block the opposite direction
    /// forever.
    fn reclaim_stale_holds(&self, state: &mut CoordinatorState, now: u64) {
        let timeout = self.config.watchdog_timeout_ms;
        for direction in [Direction::ToView, Direction::ToCore] {
            let stale: Vec<String> = state
                .holds(direction)
                .iter()
                .filter(|h| now.saturating_sub(h.since) >= timeout)
                .map(|h| h.operation_id.clone())
                .collect();
            for operation_id in stale {
                tracing::warn!(
                    operation_id = %operation_id,
                    direction = direction.as_str(),
                    timeout_ms = timeout,
                    "reclaiming stale sync hold — operation never completed"
                );
                state
                    .holds_mut(direction)
                    .retain(|h| h.operation_id != operation_id);
                state.active.remove(&operation_id);
            }
        }
    }

    // ── Utility surface ─────────────────────────────────────────

    /// Whether any sync operation is in flight.
    pub fn is_syncing(&self) -> bool {
        let state = self.state.lock();
        !state.holds_to_view.is_empty() || !state.holds_to_core.is_empty()
    }

    /// Whether a sync operation is in flight in the given direction.
    pub fn is_syncing_direction(&self, direction: Direction) -> bool {
        !self.state.lock().holds(direction).is_empty()
    }

    /// Snapshot of every in-flight operation.
    pub fn active_operations(&self) -> Vec<ActiveOperation> {
        self.state.lock().active.values().cloned().collect()
    }

    /// Build provenance metadata for an operation originating on `source`.
    pub fn create_sync_metadata(&self, source: Source, skip_sync: bool) -> SyncMetadata {
        SyncMetadata {
            source,
            operation_id: new_operation_id(),
            timestamp: self.clock.now_ms(),
            skip_sync,
        }
    }

    /// Counts of tracked hashes, chains and hot patterns for diagnostics.
    pub fn loop_detection_stats(&self) -> LoopDetectionStats {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        LoopDetectionStats {
            tracked_hashes: state.hashes.len(),
            active_chains: state.chains.len(),
            recent_operations: state.window.len(),
            hot_patterns: state.patterns.hot_count(now),
            detected_patterns: state.patterns.snapshot(),
        }
    }

    /// Clear hashes, chains, the recent-operation window and pattern
    /// counters, keeping the pattern definitions. Call after a deliberate
    /// bulk state reload that would otherwise false-positive as a loop.
    pub fn reset_loop_detection(&self) {
        let mut state = self.state.lock();
        state.hashes.clear();
        state.chains.clear();
        state.window.clear();
        state.patterns.reset_counters();
        tracing::debug!("loop detection state reset");
    }
}

/// Stock loop patterns for the default vocabulary: the settings echo
/// bounce and the session-update rebound through an external ack.
pub fn default_patterns() -> Vec<PatternSpec> {
    vec![
        PatternSpec {
            id: "settings_echo_bounce".into(),
            sequence: vec![
                kinds::SETTINGS_CHANGED.into(),
                kinds::SETTINGS_ECHO.into(),
                kinds::SETTINGS_CHANGED.into(),
            ],
            window_ms: 1_000,
        },
        PatternSpec {
            id: "session_update_rebound".into(),
            sequence: vec![
                kinds::SESSION_UPDATE.into(),
                kinds::EXTERNAL_ACK.into(),
                kinds::SESSION_UPDATE.into(),
            ],
            window_ms: 1_000,
        },
    ]
}

// ── Tests ───────────────────────────────────────────────────────
