// =============================================================================
// Cool-down throttle — suppresses immediate reversals and low-conviction
// stacking after an executed trade
// =============================================================================
//
// After a trade on pair P with side S, for the duration of the window:
//   - any signal on P with the opposite side is suppressed outright,
//   - a same-side signal needs combined confidence of at least the normal
//     threshold plus a stacking margin.
//
// Consulted in Phase 3 after ranking, so a suppressed opportunity's
// allocation is free to flow to eligible ones. State is in-process only.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Pair, Side};

/// Extra confidence required to stack onto an existing position within the
/// window.
const STACKING_MARGIN: f64 = 15.0;

/// Last executed trade per pair.
#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    executed_at: Instant,
    side: Side,
}

/// The throttle's answer for one candidate trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CooldownVerdict {
    Allow,
    /// Opposite side within the window.
    SuppressReversal,
    /// Same side within the window with insufficient conviction.
    SuppressStacking { required_confidence: f64 },
}

impl CooldownVerdict {
    pub fn allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

pub struct CooldownThrottle {
    window: Duration,
    entries: RwLock<HashMap<Pair, CooldownEntry>>,
}

impl CooldownThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate a candidate trade against the throttle state.
    pub fn check(
        &self,
        pair: &Pair,
        side: Side,
        confidence: f64,
        normal_threshold: f64,
        now: Instant,
    ) -> CooldownVerdict {
        let entries = self.entries.read();
        let entry = match entries.get(pair) {
            Some(e) => *e,
            None => return CooldownVerdict::Allow,
        };

        if now.duration_since(entry.executed_at) >= self.window {
            return CooldownVerdict::Allow;
        }

        if side == entry.side.opposite() {
            debug!(%pair, %side, "cool-down: reversal suppressed");
            return CooldownVerdict::SuppressReversal;
        }

        let required = normal_threshold + STACKING_MARGIN;
        if confidence < required {
            debug!(
                %pair,
                %side,
                confidence,
                required,
                "cool-down: stacking suppressed"
            );
            return CooldownVerdict::SuppressStacking {
                required_confidence: required,
            };
        }

        CooldownVerdict::Allow
    }

    /// Record an executed trade; starts (or restarts) the pair's window.
    pub fn record_trade(&self, pair: &Pair, side: Side, now: Instant) {
        self.entries.write().insert(
            pair.clone(),
            CooldownEntry {
                executed_at: now,
                side,
            },
        );
    }

    /// Number of pairs currently inside their window.
    pub fn active_count(&self, now: Instant) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| now.duration_since(e.executed_at) < self.window)
            .count()
    }
}

impl std::fmt::Debug for CooldownThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownThrottle")
            .field("window", &self.window)
            .field("tracked_pairs", &self.entries.read().len())
            .finish()
    }
}
