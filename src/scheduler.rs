//! Scheduled-call queue
//!
//! Holds pending calls ordered by absolute timestamp, ties broken by
//! insertion order. Two scheduling modes:
//! - relative: `now + delay`, jittered
//! - chained (negative delay): `cursor + |delay|`, jittered, where the cursor
//!   is the target of the previous chained call. Chains accumulate from the
//!   first chained call's "now" regardless of how late earlier calls ran.

use crate::clock::{self, Ts};
use crate::pq::MinPq;
use crate::rng::DetRng;

/// Handle to a queued call, used for cancellation.
///
/// Handles are never reused; cancelling an executed or already-cancelled call
/// is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SchedHandle(u64);

/// Timestamp-ordered queue of pending calls of type `F`.
pub struct SchedQueue<F> {
    pq: MinPq<F>,
    next_id: u64,
    /// Target of the last chained call; `None` until the first one.
    last_order_ts: Option<Ts>,
    rng: DetRng,
}

impl<F> SchedQueue<F> {
    pub fn new(rng: DetRng) -> Self {
        Self {
            pq: MinPq::new(),
            next_id: 0,
            last_order_ts: None,
            rng,
        }
    }

    /// Compute the target timestamp for a call scheduled at `now`.
    ///
    /// `delay_ms < 0` requests chained scheduling and advances the cursor.
    /// Targets saturate at the ends of the timestamp range.
    pub fn target_ts(&mut self, now: Ts, delay_ms: i64, jitter_pct: u32) -> Ts {
        if delay_ms < 0 {
            let after = delay_ms.checked_neg().unwrap_or(i64::MAX);
            let base = *self.last_order_ts.get_or_insert(now);
            let ts = base
                .saturating_add(after)
                .saturating_add(clock::jitter_offset(after, jitter_pct, &mut self.rng));
            self.last_order_ts = Some(ts);
            ts
        } else {
            now.saturating_add(delay_ms)
                .saturating_add(clock::jitter_offset(delay_ms, jitter_pct, &mut self.rng))
        }
    }

    /// Queue `call` to run after `delay_ms` (see module docs for negative delays).
    pub fn schedule(&mut self, delay_ms: i64, jitter_pct: u32, call: F) -> (SchedHandle, Ts) {
        let ts = self.target_ts(clock::now_ms(), delay_ms, jitter_pct);
        (self.schedule_at(ts, call), ts)
    }

    /// Queue `call` at an absolute timestamp.
    pub fn schedule_at(&mut self, ts: Ts, call: F) -> SchedHandle {
        let id = self.next_id;
        self.next_id += 1;
        // Ids grow monotonically, so they double as the insertion-order tie.
        self.pq.add(id, ts, id, call);
        SchedHandle(id)
    }

    /// Remove a pending call. Returns false if it already ran or was cancelled.
    pub fn cancel(&mut self, handle: SchedHandle) -> bool {
        self.pq.remove(handle.0).is_some()
    }

    pub fn is_pending(&self, handle: SchedHandle) -> bool {
        self.pq.contains(handle.0)
    }

    /// Earliest pending timestamp.
    pub fn peek_next_timestamp(&mut self) -> Option<Ts> {
        self.pq.peek_deadline()
    }

    /// Remove the earliest call; the caller executes it.
    pub fn pop_earliest(&mut self) -> Option<(Ts, F)> {
        self.pq.pop().map(|(_, ts, call)| (ts, call))
    }

    /// Discard every pending call without running it.
    pub fn clear(&mut self) {
        self.pq.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pq.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pq.len()
    }
}
