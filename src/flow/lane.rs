//! Sequential lane: drains its queue strictly in order, threading a running
//! state and the previous child's result through each step, and parks at
//! exhaustion until resumed (the idle protocol).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::core::errors::{ConvoyError, Result};
use crate::flow::events::Signal;
use crate::flow::queue::{FeedHandle, FeedTarget, WorkQueue};
use crate::flow::unit::{Executable, UnitCore};

use async_trait::async_trait;

/// The single mutable accumulator a lane threads across all of its children
pub type SharedState = Arc<Mutex<Value>>;

/// Construction-time configuration for a lane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneOptions {
    pub description: String,
    /// Whether the lane parks at queue exhaustion instead of returning.
    /// Fixed pipelines leave this off; pool-member lanes start paused.
    pub start_paused: bool,
}

impl Default for LaneOptions {
    fn default() -> Self {
        Self {
            description: "lane".to_string(),
            start_paused: false,
        }
    }
}

/// Execution context a lane hands to each of its children
#[derive(Debug, Clone)]
pub struct LaneCtx {
    /// Shared accumulator threaded across all children of the lane
    pub running_state: SharedState,
    /// The prior child's result; `Null` sentinel for the first child
    pub previous_result: Value,
    /// Capability for injecting more work into whatever queue feeds the
    /// running unit
    pub feed: FeedHandle,
}

/// Sequential executor over an ordered child queue.
///
/// Within one lane, child N+1 never starts before child N fully settles.
pub struct Lane {
    core: Arc<UnitCore>,
    queue: WorkQueue,
    paused: AtomicBool,
    idle: AtomicBool,
    wake: Notify,
    feed_redirect: Mutex<Option<FeedHandle>>,
    weak: Weak<Lane>,
}

impl Lane {
    pub fn new(children: Vec<Arc<dyn Executable>>, options: LaneOptions) -> Arc<Self> {
        let total = children.len() as u64;
        Arc::new_cyclic(|weak| Self {
            core: Arc::new(UnitCore::new(options.description, true, total)),
            queue: WorkQueue::new(children),
            paused: AtomicBool::new(options.start_paused),
            idle: AtomicBool::new(false),
            wake: Notify::new(),
            feed_redirect: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Queue exhausted and no child in flight; the lane may still receive
    /// more work before terminating
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Keep the lane parked at its next queue exhaustion
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clear the pause flag and wake the lane so it can either pick up newly
    /// fed work or terminate
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Point the feed capability of units running on this lane at the
    /// owning pool instead of the lane itself
    pub(crate) fn redirect_feed(&self, feed: FeedHandle) {
        *self.feed_redirect.lock() = Some(feed);
    }

    /// The feed capability handed to units running on this lane: the
    /// redirect target when owned by a pool, otherwise the lane itself
    pub fn feed_handle(&self) -> FeedHandle {
        if let Some(feed) = self.feed_redirect.lock().clone() {
            return feed;
        }
        let lane = self.weak.upgrade().expect("lane is alive while borrowed");
        FeedHandle::new(lane)
    }

    async fn run(&self) -> Result<Value> {
        let running_state: SharedState = Arc::new(Mutex::new(json!({})));
        let mut previous = Value::Null;
        loop {
            match self.queue.take_next() {
                Some(child) => {
                    self.idle.store(false, Ordering::SeqCst);
                    let child_id = child.core().id().to_string();

                    // bubble the child's lifecycle under relabeled names
                    let parent = Arc::clone(&self.core);
                    let label = child_id.clone();
                    child.core().signals().subscribe(move |envelope| {
                        if let Some(signal) = envelope.signal.relabel_for_parent(&label) {
                            parent.signals().emit(signal);
                        }
                    });

                    let ctx = LaneCtx {
                        running_state: Arc::clone(&running_state),
                        previous_result: previous.clone(),
                        feed: self.feed_handle(),
                    };
                    debug!(
                        lane = %self.core.id(),
                        child = %child_id,
                        position = self.queue.cursor(),
                        "lane executing child"
                    );
                    previous = child.execute(Value::Null, Some(ctx)).await?;
                    self.core.report_progress(self.queue.cursor() as u64);
                }
                None => {
                    self.idle.store(true, Ordering::SeqCst);
                    debug!(lane = %self.core.id(), "lane idle");
                    // the sole notification point at which a feeder may
                    // append more work
                    self.core.signals().emit(Signal::Idle);
                    loop {
                        if !self.queue.is_drained() {
                            // fed while idling; keep draining even if the
                            // pause flag is still set
                            break;
                        }
                        if !self.is_paused() {
                            info!(lane = %self.core.id(), "lane drained");
                            return Ok(previous);
                        }
                        self.wake.notified().await;
                    }
                }
            }
        }
    }
}

impl FeedTarget for Lane {
    fn append(&self, unit: Arc<dyn Executable>) -> Result<()> {
        let status = self.core.status();
        if status.is_terminal() {
            return Err(ConvoyError::sealed(self.core.description(), status));
        }
        let len = self.queue.push(unit);
        self.core.set_total_ticks(len as u64);
        self.idle.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        Ok(())
    }

    fn insert_next(&self, unit: Arc<dyn Executable>) -> Result<()> {
        let status = self.core.status();
        if status.is_terminal() {
            return Err(ConvoyError::sealed(self.core.description(), status));
        }
        let len = self.queue.insert_at_cursor(unit);
        self.core.set_total_ticks(len as u64);
        self.idle.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Executable for Lane {
    fn core(&self) -> &Arc<UnitCore> {
        &self.core
    }

    async fn execute(&self, _input: Value, _lane: Option<LaneCtx>) -> Result<Value> {
        self.core.begin()?;
        match self.run().await {
            Ok(result) => {
                self.core.complete(result.clone());
                Ok(result)
            }
            Err(error) => {
                self.core.fail(error.clone());
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("core", &self.core)
            .field("queue", &self.queue)
            .field("paused", &self.is_paused())
            .field("idle", &self.is_idle())
            .finish()
    }
}
