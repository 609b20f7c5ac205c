//! Lane pool: a bounded distributor that routes its queue across a fixed
//! pool of sequential lanes, feeding whichever lane goes idle first.
//!
//! There is no central lock around the routing state: the drain cursor and
//! lane bookkeeping are touched only inside signal handlers that run
//! synchronously on the executing context.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::core::errors::{ConvoyError, Result};
use crate::flow::events::Signal;
use crate::flow::lane::{Lane, LaneCtx, LaneOptions};
use crate::flow::queue::{FeedHandle, FeedTarget, WorkQueue};
use crate::flow::unit::{Executable, UnitCore};

use async_trait::async_trait;

/// Result assembly override: runs over all leaf units (in declaration
/// order) and the pool's input once every lane has settled
pub type Collector = Arc<dyn Fn(&[Arc<dyn Executable>], &Value) -> anyhow::Result<Value> + Send + Sync>;

/// Construction-time configuration for a lane pool
#[derive(Clone)]
pub struct PoolOptions {
    /// Fixed number of lanes; the pool never resizes
    pub parallelism: usize,
    pub description: String,
    pub collector: Option<Collector>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            parallelism: 3,
            description: "pool".to_string(),
            collector: None,
        }
    }
}

impl PoolOptions {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(ConvoyError::configuration(
                "parallelism must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptions")
            .field("parallelism", &self.parallelism)
            .field("description", &self.description)
            .field("collector", &self.collector.is_some())
            .finish()
    }
}

/// Bounded-parallelism distributor over a fixed pool of lanes.
///
/// Work assignment is idle-driven: whichever lane exhausts its queue first
/// receives the next unit, so faster lanes absorb proportionally more work.
/// The pool completes only once its queue is drained and every lane is
/// simultaneously idle (or already settled by a failure).
pub struct LanePool {
    core: Arc<UnitCore>,
    queue: WorkQueue,
    parallelism: usize,
    lanes: Mutex<Vec<Arc<Lane>>>,
    /// Ids of units routed by this pool, so bubbled grandchild completions
    /// are not counted as pool ticks
    routed: DashMap<String, ()>,
    collector: Option<Collector>,
    weak: Weak<LanePool>,
}

impl LanePool {
    pub fn new(children: Vec<Arc<dyn Executable>>, options: PoolOptions) -> Result<Arc<Self>> {
        options.validate()?;
        let routed = DashMap::new();
        for child in &children {
            routed.insert(child.core().id().to_string(), ());
        }
        let total = children.len() as u64;
        Ok(Arc::new_cyclic(|weak| Self {
            core: Arc::new(UnitCore::new(options.description, true, total)),
            queue: WorkQueue::new(children),
            parallelism: options.parallelism,
            lanes: Mutex::new(Vec::new()),
            routed,
            collector: options.collector,
            weak: weak.clone(),
        }))
    }

    /// Snapshot of the lane pool; empty until the first run
    pub fn lanes(&self) -> Vec<Arc<Lane>> {
        self.lanes.lock().clone()
    }

    /// Create the fixed pool on first run: each lane starts paused, feeds
    /// from this pool, and has its bubbled signals observed for routing,
    /// tick accounting and transparent re-emission.
    fn build_lanes(&self, pool: &Arc<LanePool>) -> Vec<Arc<Lane>> {
        let mut lanes = self.lanes.lock();
        if lanes.is_empty() {
            for index in 0..self.parallelism {
                let lane = Lane::new(
                    vec![],
                    LaneOptions {
                        description: format!("{}:lane-{}", self.core.description(), index),
                        start_paused: true,
                    },
                );
                lane.redirect_feed(FeedHandle::new(Arc::clone(pool) as Arc<dyn FeedTarget>));

                let pool_ref = Weak::clone(&self.weak);
                let lane_ref = Arc::downgrade(&lane);
                lane.core().signals().subscribe(move |envelope| {
                    let Some(pool) = pool_ref.upgrade() else {
                        return;
                    };
                    match &envelope.signal {
                        Signal::Idle => {
                            if let Some(lane) = lane_ref.upgrade() {
                                pool.on_lane_idle(&lane);
                            }
                        }
                        // a failed lane never goes idle again; re-check so
                        // surviving idle lanes are not stranded
                        Signal::Error { .. } => pool.check_completion(),
                        Signal::ChildDone { child, .. } => {
                            if pool.routed.contains_key(child) {
                                pool.core.advance_tick();
                            }
                            pool.core.signals().emit(envelope.signal.clone());
                        }
                        Signal::ChildExecuting { .. }
                        | Signal::ChildProgress { .. }
                        | Signal::ChildError { .. } => {
                            pool.core.signals().emit(envelope.signal.clone());
                        }
                        // a lane's own lifecycle stays private to the pool
                        _ => {}
                    }
                });
                lanes.push(lane);
            }
        }
        lanes.clone()
    }

    /// Distribution rule: one unit per idle signal; once the queue is
    /// drained, fall through to the completion check.
    fn on_lane_idle(&self, lane: &Arc<Lane>) {
        if let Some(unit) = self.queue.take_next() {
            debug!(
                pool = %self.core.id(),
                lane = %lane.core().id(),
                unit = %unit.core().id(),
                "routing unit to idle lane"
            );
            // feeding and resuming are independent: the fed lane wakes to
            // drain but parks again at its next exhaustion
            if let Err(error) = lane.append(Arc::clone(&unit)) {
                warn!(%error, "idle lane refused work; requeueing");
                self.queue.insert_at_cursor(unit);
            }
            return;
        }
        self.check_completion();
    }

    /// Termination: queue drained and every lane idle or already settled →
    /// resume all lanes simultaneously so their loops observe no further
    /// work and return.
    fn check_completion(&self) {
        if !self.queue.is_drained() {
            return;
        }
        let lanes = self.lanes.lock();
        let all_settled = lanes
            .iter()
            .all(|lane| lane.is_idle() || lane.core().status().is_terminal());
        if all_settled {
            debug!(pool = %self.core.id(), "queue drained and all lanes idle; resuming pool");
            for lane in lanes.iter() {
                lane.resume();
            }
        }
    }

    async fn run(&self, input: Value) -> Result<Value> {
        let pool = self
            .weak
            .upgrade()
            .ok_or_else(|| ConvoyError::internal("pool dropped before run"))?;
        let lanes = self.build_lanes(&pool);
        info!(
            pool = %self.core.id(),
            parallelism = self.parallelism,
            queued = self.queue.len(),
            "pool executing"
        );

        // all lanes run interleaved on this task; a failure in one lane
        // does not cancel the others (await and discard)
        let outcomes = join_all(lanes.iter().map(|lane| {
            let lane = Arc::clone(lane);
            async move { lane.execute(Value::Null, None).await }
        }))
        .await;

        for outcome in outcomes {
            if let Err(error) = outcome {
                return Err(error);
            }
        }

        let leaves = self.queue.items();
        match &self.collector {
            Some(collector) => collector(&leaves, &input).map_err(|source| {
                ConvoyError::action(self.core.id(), self.core.description(), source)
            }),
            None => Ok(Value::Array(
                leaves
                    .iter()
                    .map(|unit| unit.core().result().unwrap_or(Value::Null))
                    .collect(),
            )),
        }
    }
}

impl FeedTarget for LanePool {
    fn append(&self, unit: Arc<dyn Executable>) -> Result<()> {
        let status = self.core.status();
        if status.is_terminal() {
            return Err(ConvoyError::sealed(self.core.description(), status));
        }
        self.routed.insert(unit.core().id().to_string(), ());
        let len = self.queue.push(unit);
        self.core.set_total_ticks(len as u64);
        Ok(())
    }

    fn insert_next(&self, unit: Arc<dyn Executable>) -> Result<()> {
        let status = self.core.status();
        if status.is_terminal() {
            return Err(ConvoyError::sealed(self.core.description(), status));
        }
        self.routed.insert(unit.core().id().to_string(), ());
        let len = self.queue.insert_at_cursor(unit);
        self.core.set_total_ticks(len as u64);
        Ok(())
    }
}

#[async_trait]
impl Executable for LanePool {
    fn core(&self) -> &Arc<UnitCore> {
        &self.core
    }

    async fn execute(&self, input: Value, _lane: Option<LaneCtx>) -> Result<Value> {
        self.core.begin()?;
        match self.run(input).await {
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

impl std::fmt::Debug for LanePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanePool")
            .field("core", &self.core)
            .field("queue", &self.queue)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}
