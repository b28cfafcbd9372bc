//! Loop-prevention engine.
//!
//! Admission control for bidirectional core↔view forwarding:
//!
//! - Directional mutual exclusion — the primary loop breaker
//! - Recent-operation window — replay rejection by operation id
//! - Content-hash index — duplicate-payload suppression
//! - Declared loop patterns — known bounce shapes, blocked when hot
//! - Operation chains — repetition and subsequence anomaly detection
//!
//! The coordinator orchestrates the rules; `loop_detect` owns the
//! self-pruning state structures behind them.

pub mod coordinator;
pub mod loop_detect;

#[allow(unused_imports)]
pub use coordinator::{
    default_patterns, ActiveOperation, LoopDetectionStats, SyncContext, SyncCoordinator,
};
#[allow(unused_imports)]
pub use loop_detect::{LoopPattern, OperationChain, PatternSpec};
