//! Loop-detection state: recent-operation window, content-hash index,
//! operation chains and declared loop patterns.
//!
//! All structures evict by comparing stored deadlines against the caller's
//! clock reading — no per-entry timers. The coordinator owns one instance
//! of each behind its mutex and passes `now_ms` through on every call.

use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation ids are remembered for this long; a replay inside the window
/// is rejected as circular.
pub(crate) const OPERATION_TTL_MS: u64 = 5_000;

/// Content-hash pruning kicks in past this many tracked hashes.
const HASH_PRUNE_THRESHOLD: usize = 1_000;

/// Hashes older than this are dropped during a prune pass.
const HASH_PRUNE_CUTOFF_MS: u64 = 60_000;

/// Operations join the active chain when they arrive within this window
/// of the chain's last update.
const CHAIN_JOIN_WINDOW_MS: u64 = 5_000;

/// Chains idle for this long are pruned.
const CHAIN_IDLE_PRUNE_MS: u64 = 60_000;

/// Oldest chains are evicted past this count.
const MAX_CHAINS: usize = 50;

/// A pattern is hot (blocking) at this many occurrences.
const HOT_THRESHOLD: u32 = 3;

/// A kind repeating more than this often within one chain is an anomaly.
pub(crate) const KIND_REPEAT_LIMIT: usize = 2;

// ── Recent-operation window ─────────────────────────────────────

/// Set of operation ids with a fixed TTL, for rejecting replays of the
/// same logical operation. Hash set plus a min-heap of expiry deadlines.
pub(crate) struct RecentOperationWindow {
    ttl_ms: u64,
    seen: HashSet<String>,
    expiries: BinaryHeap<Reverse<(u64, String)>>,
}

impl RecentOperationWindow {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            seen: HashSet::new(),
            expiries: BinaryHeap::new(),
        }
    }

    fn evict(&mut self, now_ms: u64) {
        while self
            .expiries
            .peek()
            .is_some_and(|Reverse((deadline, _))| *deadline <= now_ms)
        {
            if let Some(Reverse((_, id))) = self.expiries.pop() {
                self.seen.remove(&id);
            }
        }
    }

    pub fn contains(&mut self, id: &str, now_ms: u64) -> bool {
        self.evict(now_ms);
        self.seen.contains(id)
    }

    pub fn insert(&mut self, id: String, now_ms: u64) {
        self.evict(now_ms);
        self.expiries.push(Reverse((now_ms + self.ttl_ms, id.clone())));
        self.seen.insert(id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.expiries.clear();
    }
}

// ── Content-hash index ──────────────────────────────────────────

fn content_hash(kind: &str, payload: Option<&Value>) -> u64 {
    let mut hasher = DefaultHasher::new();
    kind.hash(&mut hasher);
    if let Some(payload) = payload {
        // serde_json renders maps in a stable order, so equal payloads
        // hash equally regardless of construction order.
        payload.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

/// Suppresses exact duplicate payloads sent twice in quick succession.
/// Distinct from the operation-id window: two different operations can
/// carry identical content.
pub(crate) struct ContentHashIndex {
    duplicate_window_ms: u64,
    last_seen: HashMap<u64, u64>,
}

impl ContentHashIndex {
    pub fn new(duplicate_window_ms: u64) -> Self {
        Self {
            duplicate_window_ms,
            last_seen: HashMap::new(),
        }
    }

    /// Returns `true` when `(kind, payload)` was seen within the duplicate
    /// window. Fresh content is recorded; a duplicate is not re-recorded,
    /// so a steady stream of the same content stays pinned to its first
    /// sighting until the window lapses.
    pub fn check_and_record(&mut self, kind: &str, payload: Option<&Value>, now_ms: u64) -> bool {
        let hash = content_hash(kind, payload);
        if let Some(&seen_at) = self.last_seen.get(&hash) {
            if now_ms.saturating_sub(seen_at) <= self.duplicate_window_ms {
                return true;
            }
        }
        self.last_seen.insert(hash, now_ms);
        if self.last_seen.len() > HASH_PRUNE_THRESHOLD {
            self.prune(now_ms);
        }
        false
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(HASH_PRUNE_CUTOFF_MS);
        self.last_seen.retain(|_, &mut seen_at| seen_at >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

// ── Operation chains ────────────────────────────────────────────

/// Operations grouped by temporal proximity. Repetitions are retained
/// deliberately — they are the loop signal.
#[derive(Debug, Clone, Serialize)]
pub struct OperationChain {
    pub chain_id: String,
    pub operations: Vec<String>,
    pub message_kinds: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl OperationChain {
    /// How often `kind` appears in this chain.
    pub fn kind_count(&self, kind: &str) -> usize {
        self.message_kinds.iter().filter(|k| *k == kind).count()
    }
}

/// Chain table: one active chain at a time, older chains retained for
/// diagnostics until pruned.
pub(crate) struct ChainTable {
    chains: Vec<OperationChain>,
    next_id: u64,
}

impl ChainTable {
    pub fn new() -> Self {
        Self {
            chains: Vec::new(),
            next_id: 1,
        }
    }

    /// Record an operation into the chain updated within the join window,
    /// or start a new chain. Returns the index of the updated chain.
    pub fn record(&mut self, operation_id: &str, kind: &str, now_ms: u64) -> usize {
        self.prune(now_ms);

        let active = self
            .chains
            .iter()
            .position(|c| now_ms.saturating_sub(c.updated_at) <= CHAIN_JOIN_WINDOW_MS);

        match active {
            Some(index) => {
                let chain = &mut self.chains[index];
                chain.operations.push(operation_id.to_string());
                chain.message_kinds.push(kind.to_string());
                chain.updated_at = now_ms;
                index
            }
            None => {
                let chain = OperationChain {
                    chain_id: format!("chain-{}", self.next_id),
                    operations: vec![operation_id.to_string()],
                    message_kinds: vec![kind.to_string()],
                    created_at: now_ms,
                    updated_at: now_ms,
                };
                self.next_id += 1;
                self.chains.push(chain);
                self.chains.len() - 1
            }
        }
    }

    pub fn get(&self, index: usize) -> &OperationChain {
        &self.chains[index]
    }

    fn prune(&mut self, now_ms: u64) {
        self.chains
            .retain(|c| now_ms.saturating_sub(c.updated_at) < CHAIN_IDLE_PRUNE_MS);
        while self.chains.len() > MAX_CHAINS {
            // Chains are stored in creation order; drop the oldest.
            self.chains.remove(0);
        }
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }
}

// ── Loop patterns ───────────────────────────────────────────────

/// Statically declared loop shape: a message-kind sequence plus the window
/// within which repeated sightings count as one ongoing loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSpec {
    pub id: String,
    pub sequence: Vec<String>,
    pub window_ms: u64,
}

/// A declared pattern with its live counters.
#[derive(Debug, Clone, Serialize)]
pub struct LoopPattern {
    pub id: String,
    pub sequence: Vec<String>,
    pub window_ms: u64,
    pub occurrences: u32,
    /// Clock reading of the last sighting; 0 = never seen.
    pub last_seen: u64,
}

impl LoopPattern {
    fn involves(&self, kind: &str) -> bool {
        self.sequence.iter().any(|k| k == kind)
    }

    fn is_hot(&self, now_ms: u64) -> bool {
        self.occurrences >= HOT_THRESHOLD
            && now_ms.saturating_sub(self.last_seen) <= self.window_ms
    }
}

/// True when `pattern` appears as a contiguous subsequence of `kinds`.
pub(crate) fn contains_sequence(kinds: &[String], pattern: &[String]) -> bool {
    if pattern.is_empty() || kinds.len() < pattern.len() {
        return false;
    }
    kinds
        .windows(pattern.len())
        .any(|window| window.iter().zip(pattern).all(|(a, b)| a == b))
}

/// The declared patterns plus their counters.
pub(crate) struct PatternSet {
    patterns: Vec<LoopPattern>,
}

impl PatternSet {
    pub fn new(specs: Vec<PatternSpec>) -> Self {
        Self {
            patterns: specs
                .into_iter()
                .map(|spec| LoopPattern {
                    id: spec.id,
                    sequence: spec.sequence,
                    window_ms: spec.window_ms,
                    occurrences: 0,
                    last_seen: 0,
                })
                .collect(),
        }
    }

    /// Check whether any pattern involving `kind` is already hot, then
    /// record the sighting. The sighting is recorded even when hot — loop
    /// traffic that keeps arriving keeps the pattern hot.
    ///
    /// Returns the id of a hot pattern when the kind must be blocked.
    pub fn observe(&mut self, kind: &str, now_ms: u64) -> Option<String> {
        let mut hot_id = None;
        for pattern in &mut self.patterns {
            if !pattern.involves(kind) {
                continue;
            }
            if hot_id.is_none() && pattern.is_hot(now_ms) {
                hot_id = Some(pattern.id.clone());
            }
            if pattern.last_seen != 0
                && now_ms.saturating_sub(pattern.last_seen) <= pattern.window_ms
            {
                pattern.occurrences += 1;
            } else {
                pattern.occurrences = 1;
            }
            pattern.last_seen = now_ms;
        }
        hot_id
    }

    /// The declared pattern (if any) appearing as a contiguous subsequence
    /// of a chain's kind history.
    pub fn sequence_match(&self, kinds: &[String]) -> Option<&LoopPattern> {
        self.patterns
            .iter()
            .find(|p| contains_sequence(kinds, &p.sequence))
    }

    pub fn hot_count(&self, now_ms: u64) -> usize {
        self.patterns.iter().filter(|p| p.is_hot(now_ms)).count()
    }

    /// Zero every counter but keep the pattern definitions.
    pub fn reset_counters(&mut self) {
        for pattern in &mut self.patterns {
            pattern.occurrences = 0;
            pattern.last_seen = 0;
        }
    }

    pub fn snapshot(&self) -> Vec<LoopPattern> {
        self.patterns.clone()
    }
}

// ── Tests ───────────────────────────────────────────────────────
