//! Split-message consolidation (§4.4, `SPEC_FULL.md` §14).
//!
//! The actual line-splitting of long SMS text happens above this core (out
//! of scope per spec §1); this only tracks the "parts-left" countdown on a
//! parent message and rolls its children's outcomes up into one final
//! status once the last child completes. Grounded on `bb_smscconn.c`'s
//! `handle_split`.

use dashmap::DashMap;
use uuid::Uuid;

use crate::message::SplitStatus;

struct ParentState {
    parts_left: u32,
    status: SplitStatus,
}

/// Tracks in-flight split parents by internal id.
#[derive(Default)]
pub struct SplitTracker {
    parents: DashMap<Uuid, ParentState>,
}

impl SplitTracker {
    pub fn new() -> Self {
        SplitTracker { parents: DashMap::new() }
    }

    /// Idempotent: the first child of a split to arrive creates the parent's
    /// countdown, later children just find it already there.
    pub fn register(&self, parent_id: Uuid, parts: u32) {
        self.parents.entry(parent_id).or_insert_with(|| ParentState { parts_left: parts, status: SplitStatus::Success });
    }

    /// Records one child's outcome. Returns `Some(rollup_status)` once every
    /// child has reported (parts_left hits zero); the caller then emits a
    /// single `on_sent`/`on_send_failed` for the parent. Priority, highest
    /// first: malformed, discarded, rejected, other failure, success —
    /// `SplitStatus`'s derived `Ord` encodes exactly that order.
    pub fn child_done(&self, parent_id: Uuid, outcome: SplitStatus) -> Option<SplitStatus> {
        let mut done = None;
        if let Some(mut entry) = self.parents.get_mut(&parent_id) {
            entry.status = entry.status.max(outcome);
            entry.parts_left = entry.parts_left.saturating_sub(1);
            if entry.parts_left == 0 {
                done = Some(entry.status);
            }
        }
        if done.is_some() {
            self.parents.remove(&parent_id);
        }
        done
    }
}
