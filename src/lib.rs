//! viewbridge — loop-safe state synchronization between a core process
//! and its view layer.
//!
//! Two independently updated state stores talk over a bidirectional
//! in-process message channel. Naive forwarding loops forever: A's update
//! triggers a message to B, which re-derives an update that re-triggers a
//! message to A. This crate is the synchronization discipline between
//! them:
//!
//! - **`protocol`** — the wire vocabulary and the sync-provenance envelope
//! - **`mapper`** — routing-table translation of inbound messages into
//!   store actions, with a runtime kill switch
//! - **`sync`** — the loop-prevention coordinator: directional mutual
//!   exclusion, replay/duplicate/pattern/chain rejection
//! - **`debounce`** — trailing-edge coalescing of high-frequency outbound
//!   traffic (streamed text above all), with completion receipts
//! - **`telemetry`** — a sampling performance monitor with exact
//!   aggregates and health thresholds
//! - **`bridge`** — the end-to-end wiring for one channel pair
//!
//! Nothing here is global: each channel pair is one [`SyncBridge`] (or a
//! hand-wired [`SyncCoordinator`]) instance, and every time-based window
//! runs off an injectable [`clock::Clock`].

pub mod bridge;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod error;
pub mod mapper;
pub mod protocol;
pub mod sync;
pub mod telemetry;

pub use bridge::{BridgeTables, BridgeWiring, InboundOutcome, StoreDispatch, SyncBridge};
pub use config::BridgeConfig;
pub use debounce::{DebouncePolicy, Debouncer, FlushReceipt, MergeStrategy, OutboundSink};
pub use error::BridgeError;
pub use mapper::{ActionMapper, MapResult, MappingTable};
pub use protocol::{Action, Direction, Source, SyncMetadata, WireMessage};
pub use sync::{PatternSpec, SyncContext, SyncCoordinator};
pub use telemetry::PerformanceMonitor;
