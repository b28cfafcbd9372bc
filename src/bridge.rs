//! End-to-end wiring for one core↔view channel pair.
//!
//! Inbound: message → coordinator admission → mapper → envelope → store
//! dispatch. Outbound: change → debounce queue → coordinator admission
//! (opposite direction, at flush time) → channel sink. Multiple channel
//! pairs are simply multiple [`SyncBridge`] instances — nothing here is
//! global.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::{system_clock, Clock};
use crate::config::BridgeConfig;
use crate::debounce::{Debouncer, FlushReceipt, OutboundSink};
use crate::mapper::{defaults, ActionLogSnapshot, ActionMapper, MapResult, MappingTable};
use crate::protocol::envelope::PartialMetadata;
use crate::protocol::{Action, Direction, SyncMetadata, WireMessage};
use crate::sync::coordinator::{default_patterns, SyncCoordinator};
use crate::telemetry::{MetricsSnapshot, PerformanceMonitor};
use serde_json::Value;

/// Target-store seam. Dispatch is synchronous and, from the bridge's
/// point of view, side-effect-free; reducer correctness is the store's
/// problem.
pub trait StoreDispatch: Send + Sync {
    fn dispatch(&self, action: Action);
}

/// The stores and channel sinks one bridge connects.
pub struct BridgeWiring {
    pub core_store: Arc<dyn StoreDispatch>,
    pub view_store: Arc<dyn StoreDispatch>,
    pub to_view_sink: Arc<dyn OutboundSink>,
    pub to_core_sink: Arc<dyn OutboundSink>,
}

/// Mapping tables for both directions.
pub struct BridgeTables {
    pub view_to_core: MappingTable,
    pub core_to_view: MappingTable,
}

impl Default for BridgeTables {
    fn default() -> Self {
        Self {
            view_to_core: defaults::view_to_core(),
            core_to_view: defaults::core_to_view(),
        }
    }
}

/// Outcome of handling one inbound message.
#[derive(Debug)]
pub enum InboundOutcome {
    /// Admitted, translated and dispatched into the target store.
    Dispatched { operation_id: String },
    /// Loop prevention declined the operation; nothing was dispatched.
    NotAdmitted,
    /// Admitted, but the mapper produced no dispatchable action
    /// (unmapped, declined, failed or disabled).
    NotMapped(MapResult),
}

impl InboundOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched { .. })
    }
}

/// One bidirectional core↔view synchronization bridge.
pub struct SyncBridge {
    coordinator: Arc<SyncCoordinator>,
    view_to_core: ActionMapper,
    core_to_view: ActionMapper,
    core_store: Arc<dyn StoreDispatch>,
    view_store: Arc<dyn StoreDispatch>,
    to_view_queue: Debouncer,
    to_core_queue: Debouncer,
    log_transitions: bool,
    clock: Arc<dyn Clock>,
}

impl SyncBridge {
    pub fn new(config: BridgeConfig, wiring: BridgeWiring) -> Self {
        Self::with_parts(config, wiring, BridgeTables::default(), system_clock())
    }

    /// Full-control constructor: custom tables and clock (tests inject a
    /// manual clock here).
    pub fn with_parts(
        config: BridgeConfig,
        wiring: BridgeWiring,
        tables: BridgeTables,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new(&config.telemetry, clock.clone()));
        let coordinator = Arc::new(SyncCoordinator::new(
            config.coordinator.clone(),
            default_patterns(),
            monitor,
            clock.clone(),
        ));

        let to_view_queue = Debouncer::new(
            &config.debounce,
            Arc::new(GuardedSink {
                coordinator: coordinator.clone(),
                direction: Direction::ToView,
                inner: wiring.to_view_sink,
            }),
            clock.clone(),
        );
        let to_core_queue = Debouncer::new(
            &config.debounce,
            Arc::new(GuardedSink {
                coordinator: coordinator.clone(),
                direction: Direction::ToCore,
                inner: wiring.to_core_sink,
            }),
            clock.clone(),
        );

        Self {
            view_to_core: ActionMapper::new(tables.view_to_core, &config.mapping, clock.clone()),
            core_to_view: ActionMapper::new(tables.core_to_view, &config.mapping, clock.clone()),
            coordinator,
            core_store: wiring.core_store,
            view_store: wiring.view_store,
            to_view_queue,
            to_core_queue,
            log_transitions: config.mapping.log_transitions,
            clock,
        }
    }

    // ── Inbound ─────────────────────────────────────────────────

    /// Handle a message arriving from the view side: admit, translate,
    /// dispatch into the core store.
    pub fn handle_from_view(&self, message: &WireMessage) -> InboundOutcome {
        self.handle_inbound(message, Direction::ToCore)
    }

    /// Handle a message arriving from the core side: admit, translate,
    /// dispatch into the view store.
    pub fn handle_from_core(&self, message: &WireMessage) -> InboundOutcome {
        self.handle_inbound(message, Direction::ToView)
    }

    fn handle_inbound(&self, message: &WireMessage, direction: Direction) -> InboundOutcome {
        let Some(ctx) = self.coordinator.begin_sync(
            direction,
            &message.kind,
            message.sync_meta(),
            message.payload.as_ref(),
        ) else {
            return InboundOutcome::NotAdmitted;
        };

        let mapper = match direction {
            Direction::ToCore => &self.view_to_core,
            Direction::ToView => &self.core_to_view,
        };

        // Stamp the admitted operation's provenance so downstream
        // consumers recognize the action's lineage; an echo carrying this
        // operation id back is rejected as circular.
        let provenance = SyncMetadata {
            source: ctx.source,
            operation_id: ctx.operation_id.clone(),
            timestamp: self.clock.now_ms(),
            skip_sync: false,
        };

        match mapper.map(message, Some(PartialMetadata::from(&provenance))) {
            MapResult::Mapped(action) => {
                if self.log_transitions {
                    tracing::info!(
                        kind = %action.kind,
                        direction = direction.as_str(),
                        operation_id = %ctx.operation_id,
                        "dispatching synced action"
                    );
                }
                let store = match direction {
                    Direction::ToCore => &self.core_store,
                    Direction::ToView => &self.view_store,
                };
                store.dispatch(action);
                let operation_id = ctx.operation_id.clone();
                self.coordinator.complete_sync(ctx);
                InboundOutcome::Dispatched { operation_id }
            }
            MapResult::Failed { message } => {
                self.coordinator.fail_sync(ctx, &message);
                InboundOutcome::NotMapped(MapResult::Failed { message })
            }
            other => {
                // Unmapped/declined/disabled traffic is normal; the
                // operation still completes cleanly.
                self.coordinator.complete_sync(ctx);
                InboundOutcome::NotMapped(other)
            }
        }
    }

    // ── Outbound ────────────────────────────────────────────────

    /// Queue a core-side change for debounced delivery to the view.
    pub fn send_to_view(&self, kind: &str, payload: Option<Value>) -> Option<FlushReceipt> {
        self.to_view_queue.enqueue(kind, payload)
    }

    /// Queue a view-side change for debounced delivery to the core.
    pub fn send_to_core(&self, kind: &str, payload: Option<Value>) -> Option<FlushReceipt> {
        self.to_core_queue.enqueue(kind, payload)
    }

    /// Send to the view right away, bypassing the debounce buffer.
    pub fn send_to_view_immediate(
        &self,
        kind: &str,
        payload: Option<Value>,
    ) -> Option<FlushReceipt> {
        self.to_view_queue.enqueue_immediate(kind, payload)
    }

    /// Send to the core right away, bypassing the debounce buffer.
    pub fn send_to_core_immediate(
        &self,
        kind: &str,
        payload: Option<Value>,
    ) -> Option<FlushReceipt> {
        self.to_core_queue.enqueue_immediate(kind, payload)
    }

    /// Force-flush both outbound queues (explicit barrier point).
    pub async fn flush_all(&self) {
        self.to_view_queue.flush_all().await;
        self.to_core_queue.flush_all().await;
    }

    /// Flush everything, then refuse further outbound traffic.
    pub async fn shutdown(&self) {
        self.to_view_queue.shutdown().await;
        self.to_core_queue.shutdown().await;
    }

    // ── Diagnostics ─────────────────────────────────────────────

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Mapper translating view-side messages for the core store.
    pub fn view_to_core_mapper(&self) -> &ActionMapper {
        &self.view_to_core
    }

    /// Mapper translating core-side messages for the view store.
    pub fn core_to_view_mapper(&self) -> &ActionMapper {
        &self.core_to_view
    }

    /// Performance snapshot for the diagnostics panel.
    pub fn export_metrics(&self) -> MetricsSnapshot {
        self.coordinator.monitor().export_metrics()
    }

    /// Attempt logs for both directions.
    pub fn export_action_logs(&self) -> (ActionLogSnapshot, ActionLogSnapshot) {
        (
            self.view_to_core.export_action_log(),
            self.core_to_view.export_action_log(),
        )
    }
}

// ── Guarded sink ────────────────────────────────────────────────

/// Runs the coordinator's admission check on every flushed message
/// before it reaches the real channel. A rejected message is dropped —
/// by construction it is loop traffic.
struct GuardedSink {
    coordinator: Arc<SyncCoordinator>,
    direction: Direction,
    inner: Arc<dyn OutboundSink>,
}

#[async_trait]
impl OutboundSink for GuardedSink {
    async fn send(&self, message: WireMessage) -> anyhow::Result<()> {
        let Some(ctx) = self.coordinator.begin_sync(
            self.direction,
            &message.kind,
            message.sync_meta(),
            message.payload.as_ref(),
        ) else {
            tracing::debug!(
                kind = %message.kind,
                direction = self.direction.as_str(),
                "outbound message not admitted, dropping"
            );
            return Ok(());
        };

        let result = self.inner.send(message).await;
        match &result {
            Ok(()) => self.coordinator.complete_sync(ctx),
            Err(error) => self.coordinator.fail_sync(ctx, &error.to_string()),
        }
        result
    }
}

// ── Tests ───────────────────────────────────────────────────────
