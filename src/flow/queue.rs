//! Child queues and the feed capability.
//!
//! A [`WorkQueue`] is owned by exactly one scope (lane or pool); everyone
//! else mutates it only through the narrow [`FeedHandle`] capability, which
//! routes back to the owning scope so the owner stays the sole mutator.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::errors::Result;
use crate::flow::unit::Executable;

struct QueueInner {
    items: Vec<Arc<dyn Executable>>,
    cursor: usize,
}

/// Ordered child queue with a read cursor.
///
/// The cursor advances when an item is dequeued, so between executions it
/// equals the number of children already completed.
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
}

impl WorkQueue {
    pub fn new(items: Vec<Arc<dyn Executable>>) -> Self {
        Self {
            inner: Mutex::new(QueueInner { items, cursor: 0 }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.inner.lock().cursor
    }

    /// Whether every queued item has been dequeued
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.cursor == inner.items.len()
    }

    /// Snapshot of the queued items in declaration order
    pub fn items(&self) -> Vec<Arc<dyn Executable>> {
        self.inner.lock().items.clone()
    }

    /// Append to the end; returns the new length
    pub(crate) fn push(&self, unit: Arc<dyn Executable>) -> usize {
        let mut inner = self.inner.lock();
        inner.items.push(unit);
        inner.items.len()
    }

    /// Insert at the cursor so the item is dequeued next, immediately after
    /// whatever is currently running; returns the new length
    pub(crate) fn insert_at_cursor(&self, unit: Arc<dyn Executable>) -> usize {
        let mut inner = self.inner.lock();
        let at = inner.cursor;
        inner.items.insert(at, unit);
        inner.items.len()
    }

    /// Dequeue the item at the cursor and advance past it
    pub(crate) fn take_next(&self) -> Option<Arc<dyn Executable>> {
        let mut inner = self.inner.lock();
        if inner.cursor < inner.items.len() {
            let unit = Arc::clone(&inner.items[inner.cursor]);
            inner.cursor += 1;
            Some(unit)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkQueue")
            .field("len", &inner.items.len())
            .field("cursor", &inner.cursor)
            .finish()
    }
}

/// The scope-side surface of the feed capability. Implementations guard
/// against mutation once the scope is terminal.
pub trait FeedTarget: Send + Sync {
    /// Add a unit to the end of the scope's queue
    fn append(&self, unit: Arc<dyn Executable>) -> Result<()>;

    /// Insert a unit so it executes immediately after whatever is running
    fn insert_next(&self, unit: Arc<dyn Executable>) -> Result<()>;
}

/// Narrow capability handed to running actions: append/insert into whatever
/// queue feeds them, nothing else.
#[derive(Clone)]
pub struct FeedHandle {
    target: Arc<dyn FeedTarget>,
}

impl FeedHandle {
    pub fn new(target: Arc<dyn FeedTarget>) -> Self {
        Self { target }
    }

    pub fn append(&self, unit: Arc<dyn Executable>) -> Result<()> {
        self.target.append(unit)
    }

    pub fn insert_next(&self, unit: Arc<dyn Executable>) -> Result<()> {
        self.target.insert_next(unit)
    }
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandle").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::unit::{ActionCtx, UnitAction, UnitOptions, WorkUnit};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Noop;

    #[async_trait]
    impl UnitAction for Noop {
        async fn run(&self, _ctx: ActionCtx) -> anyhow::Result<Value> {
            Ok(json!(null))
        }
    }

    fn unit(description: &str) -> Arc<WorkUnit> {
        WorkUnit::new(
            Arc::new(Noop),
            UnitOptions {
                description: description.to_string(),
                ..UnitOptions::default()
            },
        )
    }

    #[test]
    fn test_dequeue_advances_cursor() {
        let queue = WorkQueue::new(vec![unit("a"), unit("b")]);
        assert_eq!(queue.cursor(), 0);
        assert!(!queue.is_drained());

        let first = queue.take_next().unwrap();
        assert_eq!(first.core().description(), "a");
        assert_eq!(queue.cursor(), 1);

        let second = queue.take_next().unwrap();
        assert_eq!(second.core().description(), "b");
        assert!(queue.is_drained());
        assert!(queue.take_next().is_none());
    }

    #[test]
    fn test_insert_at_cursor_runs_next() {
        let queue = WorkQueue::new(vec![unit("a"), unit("b"), unit("c")]);
        // "a" is in flight
        queue.take_next().unwrap();
        queue.insert_at_cursor(unit("x"));

        let order: Vec<String> = std::iter::from_fn(|| queue.take_next())
            .map(|u| u.core().description().to_string())
            .collect();
        assert_eq!(order, vec!["x", "b", "c"]);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_push_appends_after_drain() {
        let queue = WorkQueue::new(vec![unit("a")]);
        queue.take_next().unwrap();
        assert!(queue.is_drained());

        assert_eq!(queue.push(unit("late")), 2);
        assert!(!queue.is_drained());
        assert_eq!(
            queue.take_next().unwrap().core().description(),
            "late"
        );
    }
}
