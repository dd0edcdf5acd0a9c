//! Completion markers ("done items")
//!
//! A marker is a named condition the test must see resolved before its
//! deadline and, when it declares an `order`, at exactly that position among
//! all ordered markers. Deadlines stay relative until the loop anchors them
//! at the start of `run()`; anchoring arms a timeout call in the queue whose
//! handle is kept so resolution can cancel it.

use crate::clock::Ts;
use crate::error::{Failure, UsageError};
use crate::scheduler::{SchedHandle, SchedQueue};
use std::collections::BTreeMap;

/// Tag of the implicit marker targeted by untagged `resolve`/`fail`.
pub const DEFAULT_TAG: &str = "_default";

/// Declaration of a marker, with typed options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Done {
    tag: String,
    timeout_ms: Option<u64>,
    order: u32,
}

impl Done {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            timeout_ms: None,
            order: 0,
        }
    }

    /// The implicit `_default` marker.
    pub fn default_done() -> Self {
        Self::new(DEFAULT_TAG)
    }

    /// Deadline relative to the start of the run (or to registration, when
    /// added while running). Unset means the loop's default.
    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Required 1-based position among ordered markers; 0 means unordered.
    pub fn order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Per-marker state. Transitions out of `Pending` happen at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoneState {
    Pending,
    Success,
    Error,
    /// The loop was aborted while the marker was still pending.
    Aborted,
}

#[derive(Debug)]
struct DoneItem {
    state: DoneState,
    timeout_ms: u64,
    /// Absolute deadline, set when anchored.
    deadline: Option<Ts>,
    order: u32,
    timer: Option<SchedHandle>,
}

/// Registry of markers keyed by unique tag.
#[derive(Debug)]
pub struct DoneTracker {
    items: BTreeMap<String, DoneItem>,
    default_timeout_ms: u64,
    /// Number of ordered markers resolved so far.
    last_ordered_no: u32,
}

impl DoneTracker {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            items: BTreeMap::new(),
            default_timeout_ms,
            last_ordered_no: 0,
        }
    }

    /// Registry holding only the implicit `_default` marker.
    pub fn with_default(default_timeout_ms: u64) -> Self {
        let mut tracker = Self::new(default_timeout_ms);
        tracker.insert(Done::default_done());
        tracker
    }

    /// Register a marker. Its deadline is not armed yet.
    pub fn register(&mut self, done: Done) -> Result<(), UsageError> {
        if done.tag.is_empty() {
            return Err(UsageError::EmptyTag);
        }
        if self.items.contains_key(&done.tag) {
            return Err(UsageError::DuplicateTag(done.tag));
        }
        self.insert(done);
        Ok(())
    }

    fn insert(&mut self, done: Done) {
        let item = DoneItem {
            state: DoneState::Pending,
            timeout_ms: done.timeout_ms.unwrap_or(self.default_timeout_ms),
            deadline: None,
            order: done.order,
            timer: None,
        };
        self.items.insert(done.tag, item);
    }

    /// Anchor every not-yet-armed deadline to `now` and arm its timeout.
    ///
    /// `arm(tag, deadline)` queues the timeout call and returns its handle.
    /// Markers that already left `Pending` get a deadline but no timeout.
    pub fn anchor_all(&mut self, now: Ts, mut arm: impl FnMut(&str, Ts) -> SchedHandle) {
        for (tag, item) in self.items.iter_mut() {
            if item.deadline.is_some() {
                continue;
            }
            let timeout = Ts::try_from(item.timeout_ms).unwrap_or(Ts::MAX);
            let deadline = now.saturating_add(timeout);
            item.deadline = Some(deadline);
            if item.state == DoneState::Pending {
                item.timer = Some(arm(tag, deadline));
            }
        }
    }

    /// Resolve a marker.
    ///
    /// `Err` is a usage error; `Ok(Some(_))` is a test failure the caller
    /// must record against `tag`.
    pub fn resolve<F>(
        &mut self,
        tag: &str,
        queue: &mut SchedQueue<F>,
    ) -> Result<Option<Failure>, UsageError> {
        let item = self
            .items
            .get_mut(tag)
            .ok_or_else(|| UsageError::UnknownTag(tag.to_string()))?;
        if item.state != DoneState::Pending {
            return Ok(Some(Failure::AlreadyResolved));
        }
        if let Some(timer) = item.timer.take() {
            queue.cancel(timer);
        }
        if item.order > 0 {
            self.last_ordered_no += 1;
            if item.order != self.last_ordered_no {
                return Ok(Some(Failure::OutOfOrder {
                    expected: item.order,
                    actual: self.last_ordered_no,
                }));
            }
        }
        item.state = DoneState::Success;
        Ok(None)
    }

    /// Mark a pending marker as failed. Resolved markers keep their state.
    pub fn mark_error(&mut self, tag: &str) -> Result<(), UsageError> {
        let item = self
            .items
            .get_mut(tag)
            .ok_or_else(|| UsageError::UnknownTag(tag.to_string()))?;
        if item.state == DoneState::Pending {
            item.state = DoneState::Error;
        }
        Ok(())
    }

    /// Move every still-pending marker to `Aborted`.
    pub fn abort_pending(&mut self) {
        for item in self.items.values_mut() {
            if item.state == DoneState::Pending {
                item.state = DoneState::Aborted;
            }
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.items.contains_key(tag)
    }

    pub fn state(&self, tag: &str) -> Option<DoneState> {
        self.items.get(tag).map(|i| i.state)
    }

    pub fn deadline(&self, tag: &str) -> Option<Ts> {
        self.items.get(tag).and_then(|i| i.deadline)
    }

    pub fn timeout_ms(&self, tag: &str) -> Option<u64> {
        self.items.get(tag).map(|i| i.timeout_ms)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::DetRng;
    use rstest::rstest;

    fn queue() -> SchedQueue<()> {
        SchedQueue::new(DetRng::new("done"))
    }

    fn armed(dones: Vec<Done>, q: &mut SchedQueue<()>) -> DoneTracker {
        let mut t = DoneTracker::new(2000);
        for d in dones {
            t.register(d).unwrap();
        }
        t.anchor_all(1_000, |_, deadline| q.schedule_at(deadline, ()));
        t
    }

    #[test]
    fn test_duplicate_and_empty_tags() {
        let mut t = DoneTracker::new(2000);
        t.register(Done::new("a")).unwrap();
        assert_eq!(
            t.register(Done::new("a").order(1)),
            Err(UsageError::DuplicateTag("a".into()))
        );
        assert_eq!(t.register(Done::new("")), Err(UsageError::EmptyTag));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_with_default() {
        let t = DoneTracker::with_default(750);
        assert!(t.contains(DEFAULT_TAG));
        assert_eq!(t.timeout_ms(DEFAULT_TAG), Some(750));
        assert_eq!(t.state(DEFAULT_TAG), Some(DoneState::Pending));
    }

    #[test]
    fn test_default_timeout_inherited() {
        let mut q = queue();
        let t = armed(vec![Done::new("a"), Done::new("b").timeout(500)], &mut q);
        assert_eq!(t.timeout_ms("a"), Some(2000));
        assert_eq!(t.deadline("a"), Some(3_000));
        assert_eq!(t.deadline("b"), Some(1_500));
        assert_eq!(q.len(), 2);
        assert_eq!(q.peek_next_timestamp(), Some(1_500));
    }

    #[test]
    fn test_anchor_is_done_once() {
        let mut q = queue();
        let mut t = armed(vec![Done::new("a")], &mut q);
        t.register(Done::new("late").timeout(10)).unwrap();
        t.anchor_all(5_000, |_, deadline| q.schedule_at(deadline, ()));
        assert_eq!(t.deadline("a"), Some(3_000));
        assert_eq!(t.deadline("late"), Some(5_010));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_resolve_cancels_timeout() {
        let mut q = queue();
        let mut t = armed(vec![Done::default_done()], &mut q);
        assert_eq!(t.resolve(DEFAULT_TAG, &mut q), Ok(None));
        assert_eq!(t.state(DEFAULT_TAG), Some(DoneState::Success));
        assert!(q.is_empty());
    }

    #[test]
    fn test_double_resolve_is_a_failure() {
        let mut q = queue();
        let mut t = armed(vec![Done::default_done()], &mut q);
        t.resolve(DEFAULT_TAG, &mut q).unwrap();
        assert_eq!(
            t.resolve(DEFAULT_TAG, &mut q),
            Ok(Some(Failure::AlreadyResolved))
        );
        t.mark_error(DEFAULT_TAG).unwrap();
        assert_eq!(t.state(DEFAULT_TAG), Some(DoneState::Success));
    }

    #[test]
    fn test_unknown_tag() {
        let mut q = queue();
        let mut t = armed(vec![Done::new("a")], &mut q);
        assert_eq!(
            t.resolve("b", &mut q),
            Err(UsageError::UnknownTag("b".into()))
        );
        assert_eq!(t.mark_error("b"), Err(UsageError::UnknownTag("b".into())));
    }

    #[rstest]
    #[case::in_order(&["a", "b", "c"], None)]
    #[case::unordered_between(&["a", "free", "b", "c"], None)]
    #[case::swapped(&["b"], Some((2, 1)))]
    #[case::skipped(&["a", "c"], Some((3, 2)))]
    fn test_order_checks(#[case] resolves: &[&str], #[case] expect: Option<(u32, u32)>) {
        let mut q = queue();
        let mut t = armed(
            vec![
                Done::new("a").order(1),
                Done::new("b").order(2),
                Done::new("c").order(3),
                Done::new("free"),
            ],
            &mut q,
        );
        let mut failure = None;
        for tag in resolves {
            if let Some(f) = t.resolve(tag, &mut q).unwrap() {
                failure = Some(f);
                break;
            }
        }
        let expected = expect.map(|(expected, actual)| Failure::OutOfOrder { expected, actual });
        assert_eq!(failure, expected);
    }

    #[test]
    fn test_resolved_before_anchor_arms_nothing() {
        let mut q = queue();
        let mut t = DoneTracker::with_default(2000);
        t.register(Done::new("open")).unwrap();
        assert_eq!(t.resolve(DEFAULT_TAG, &mut q), Ok(None));

        t.anchor_all(1_000, |_, deadline| q.schedule_at(deadline, ()));
        assert_eq!(t.deadline(DEFAULT_TAG), Some(3_000));
        assert_eq!(q.len(), 1, "only the pending marker is armed");
        assert_eq!(t.state(DEFAULT_TAG), Some(DoneState::Success));
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let mut q = queue();
        let t = armed(vec![Done::new("forever").timeout(u64::MAX)], &mut q);
        assert_eq!(t.deadline("forever"), Some(Ts::MAX));
        assert_eq!(q.peek_next_timestamp(), Some(Ts::MAX));
    }

    #[test]
    fn test_abort_pending() {
        let mut q = queue();
        let mut t = armed(vec![Done::new("a"), Done::new("b")], &mut q);
        t.resolve("a", &mut q).unwrap();
        t.abort_pending();
        assert_eq!(t.state("a"), Some(DoneState::Success));
        assert_eq!(t.state("b"), Some(DoneState::Aborted));
    }
}
