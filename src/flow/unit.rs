//! Work units: the atomic wrapped action with a lifecycle state machine.
//!
//! The reference hierarchy (unit → queued unit → lane/pool) is flattened
//! into a shared state record ([`UnitCore`]) plus capability traits:
//! [`Executable`] for anything that can be driven to completion, and the
//! queue/feed surfaces in [`crate::flow::queue`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::errors::{ConvoyError, Result};
use crate::flow::events::{Signal, SignalHub};
use crate::flow::lane::LaneCtx;

/// Lifecycle states of a unit.
///
/// Transitions only ever run `Created → Executing → {Done | Failed}`; once
/// terminal, the stored outcome never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Created,
    Executing,
    Done,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Failed)
    }
}

#[derive(Debug)]
struct UnitState {
    status: UnitStatus,
    ticks: u64,
    total_ticks: u64,
    outcome: Option<std::result::Result<Value, ConvoyError>>,
}

/// Shared lifecycle state record backing every executable entity.
///
/// Leaf units, lanes and pools all compose one of these instead of
/// inheriting from each other; it owns the status machine, the progress
/// counters, the settled outcome and the unit's [`SignalHub`].
pub struct UnitCore {
    id: String,
    description: String,
    tracks_progress: bool,
    state: Mutex<UnitState>,
    hub: SignalHub,
    settled_tx: watch::Sender<bool>,
    settled_rx: watch::Receiver<bool>,
}

impl UnitCore {
    pub fn new(description: impl Into<String>, tracks_progress: bool, total_ticks: u64) -> Self {
        let id = cuid2::create_id();
        let description = description.into();
        let (settled_tx, settled_rx) = watch::channel(false);
        Self {
            hub: SignalHub::new(id.clone()),
            id,
            description,
            tracks_progress,
            state: Mutex::new(UnitState {
                status: UnitStatus::Created,
                ticks: 0,
                total_ticks,
                outcome: None,
            }),
            settled_tx,
            settled_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tracks_progress(&self) -> bool {
        self.tracks_progress
    }

    /// The hub on which this unit's lifecycle signals are emitted
    pub fn signals(&self) -> &SignalHub {
        &self.hub
    }

    pub fn status(&self) -> UnitStatus {
        self.state.lock().status
    }

    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    pub fn total_ticks(&self) -> u64 {
        self.state.lock().total_ticks
    }

    /// The stored result, set iff the unit is `Done`
    pub fn result(&self) -> Option<Value> {
        match &self.state.lock().outcome {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The stored failure, set iff the unit is `Failed`
    pub fn error(&self) -> Option<ConvoyError> {
        match &self.state.lock().outcome {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    fn outcome(&self) -> Option<Result<Value>> {
        self.state.lock().outcome.clone()
    }

    /// Transition `Created → Executing` and announce it. Entities are
    /// single-use, so any other starting state is a structural error.
    pub(crate) fn begin(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.status != UnitStatus::Created {
                return Err(ConvoyError::already_started(&self.description));
            }
            state.status = UnitStatus::Executing;
        }
        debug!(unit = %self.id, description = %self.description, "unit executing");
        self.hub.emit(Signal::Executing);
        Ok(())
    }

    /// Transition `Executing → Done`, store the result, announce it and
    /// release every waiter.
    pub(crate) fn complete(&self, result: Value) {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                warn!(unit = %self.id, "ignoring completion of a settled unit");
                return;
            }
            state.status = UnitStatus::Done;
            state.outcome = Some(Ok(result.clone()));
        }
        debug!(unit = %self.id, description = %self.description, "unit done");
        self.hub.emit(Signal::Done { result });
        self.settled_tx.send_replace(true);
    }

    /// Transition `Executing → Failed`, store the error, announce it and
    /// release every waiter.
    pub(crate) fn fail(&self, error: ConvoyError) {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                warn!(unit = %self.id, "ignoring failure of a settled unit");
                return;
            }
            state.status = UnitStatus::Failed;
            state.outcome = Some(Err(error.clone()));
        }
        debug!(unit = %self.id, description = %self.description, %error, "unit failed");
        self.hub.emit(Signal::Error { error });
        self.settled_tx.send_replace(true);
    }

    /// Move the progress counter and announce it. Ticks never decrease;
    /// a lower report is clamped to the current value.
    pub fn report_progress(&self, ticks: u64) {
        let (ticks, total) = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                warn!(unit = %self.id, "ignoring progress on a settled unit");
                return;
            }
            state.ticks = state.ticks.max(ticks);
            (state.ticks, state.total_ticks)
        };
        self.hub.emit(Signal::Progress { ticks, total });
    }

    /// Advance the progress counter by one and announce it
    pub(crate) fn advance_tick(&self) {
        let (ticks, total) = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                warn!(unit = %self.id, "ignoring progress on a settled unit");
                return;
            }
            state.ticks += 1;
            (state.ticks, state.total_ticks)
        };
        self.hub.emit(Signal::Progress { ticks, total });
    }

    /// Keep `total_ticks` in lockstep with the owning scope's queue length
    pub(crate) fn set_total_ticks(&self, total: u64) {
        self.state.lock().total_ticks = total;
    }

    /// Wait for the unit to settle. An already-settled unit resolves
    /// immediately with the stored outcome.
    pub async fn wait(&self) -> Result<Value> {
        let mut rx = self.settled_rx.clone();
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            // settled_tx lives on self, so the channel only closes once the
            // core itself is going away
            if rx.changed().await.is_err() {
                return self
                    .outcome()
                    .unwrap_or_else(|| Err(ConvoyError::internal("settle channel closed")));
            }
        }
    }
}

impl std::fmt::Debug for UnitCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UnitCore")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("status", &state.status)
            .field("ticks", &state.ticks)
            .field("total_ticks", &state.total_ticks)
            .finish()
    }
}

/// Construction-time configuration for a leaf unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOptions {
    pub description: String,
    pub tracks_progress: bool,
    pub total_ticks: u64,
}

impl Default for UnitOptions {
    fn default() -> Self {
        Self {
            description: "unit".to_string(),
            tracks_progress: false,
            total_ticks: 0,
        }
    }
}

/// Narrow view of a unit handed to its own action, exposing progress
/// reporting and identity but none of the lifecycle transitions
#[derive(Clone, Debug)]
pub struct UnitHandle {
    core: Arc<UnitCore>,
}

impl UnitHandle {
    pub(crate) fn new(core: Arc<UnitCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn description(&self) -> &str {
        self.core.description()
    }

    pub fn ticks(&self) -> u64 {
        self.core.ticks()
    }

    pub fn total_ticks(&self) -> u64 {
        self.core.total_ticks()
    }

    /// Report progress from inside the action body
    pub fn report_progress(&self, ticks: u64) {
        self.core.report_progress(ticks);
    }
}

/// Execution context passed to a unit's action
pub struct ActionCtx {
    /// The raw input the unit was executed with (`Null` when started
    /// through `await_result`)
    pub input: Value,
    /// The unit itself, for mid-flight progress reporting
    pub unit: UnitHandle,
    /// Present when the unit is being driven by a lane
    pub lane: Option<LaneCtx>,
}

/// The wrapped action a leaf unit runs
#[async_trait]
pub trait UnitAction: Send + Sync {
    async fn run(&self, ctx: ActionCtx) -> anyhow::Result<Value>;
}

/// Capability trait for anything that can be driven to completion:
/// leaf units, lanes and pools
#[async_trait]
pub trait Executable: Send + Sync {
    /// The shared lifecycle state of this entity
    fn core(&self) -> &Arc<UnitCore>;

    /// Drive this entity to completion with the given input
    async fn execute(&self, input: Value, lane: Option<LaneCtx>) -> Result<Value>;

    /// Start-or-wait: if never started, begin execution with a `Null`
    /// input; otherwise wait for the in-flight or stored outcome.
    async fn await_result(&self) -> Result<Value> {
        if self.core().status() == UnitStatus::Created {
            match self.execute(Value::Null, None).await {
                // lost a start race; fall back to waiting on the winner
                Err(ConvoyError::AlreadyStarted { .. }) => self.core().wait().await,
                outcome => outcome,
            }
        } else {
            self.core().wait().await
        }
    }
}

/// A leaf unit: one wrapped action plus its lifecycle record
pub struct WorkUnit {
    core: Arc<UnitCore>,
    action: Arc<dyn UnitAction>,
}

impl WorkUnit {
    pub fn new(action: Arc<dyn UnitAction>, options: UnitOptions) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(UnitCore::new(
                options.description,
                options.tracks_progress,
                options.total_ticks,
            )),
            action,
        })
    }
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnit").field("core", &self.core).finish()
    }
}

#[async_trait]
impl Executable for WorkUnit {
    fn core(&self) -> &Arc<UnitCore> {
        &self.core
    }

    async fn execute(&self, input: Value, lane: Option<LaneCtx>) -> Result<Value> {
        self.core.begin()?;
        let ctx = ActionCtx {
            input,
            unit: UnitHandle::new(Arc::clone(&self.core)),
            lane,
        };
        match self.action.run(ctx).await {
            Ok(result) => {
                self.core.complete(result.clone());
                Ok(result)
            }
            Err(source) => {
                let error = ConvoyError::action(self.core.id(), self.core.description(), source);
                self.core.fail(error.clone());
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::events::SignalLog;
    use anyhow::anyhow;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl UnitAction for Doubler {
        async fn run(&self, ctx: ActionCtx) -> anyhow::Result<Value> {
            let n = ctx.input.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        }
    }

    struct Explode;

    #[async_trait]
    impl UnitAction for Explode {
        async fn run(&self, _ctx: ActionCtx) -> anyhow::Result<Value> {
            Err(anyhow!("boom"))
        }
    }

    struct Stepper;

    #[async_trait]
    impl UnitAction for Stepper {
        async fn run(&self, ctx: ActionCtx) -> anyhow::Result<Value> {
            for step in 1..=3 {
                ctx.unit.report_progress(step);
            }
            Ok(json!("stepped"))
        }
    }

    #[tokio::test]
    async fn test_successful_lifecycle() {
        let unit = WorkUnit::new(
            Arc::new(Doubler),
            UnitOptions {
                description: "double".to_string(),
                ..UnitOptions::default()
            },
        );
        let log = SignalLog::new();
        log.attach(unit.core().signals());

        assert_eq!(unit.core().status(), UnitStatus::Created);
        let result = unit.execute(json!(21), None).await.unwrap();
        assert_eq!(result, json!(42));
        assert_eq!(unit.core().status(), UnitStatus::Done);
        assert_eq!(unit.core().result(), Some(json!(42)));
        assert!(unit.core().error().is_none());

        let signals = log.signals();
        assert!(matches!(signals[0], Signal::Executing));
        assert!(matches!(signals[1], Signal::Done { .. }));
    }

    #[tokio::test]
    async fn test_failure_lifecycle() {
        let unit = WorkUnit::new(
            Arc::new(Explode),
            UnitOptions {
                description: "explode".to_string(),
                ..UnitOptions::default()
            },
        );
        let log = SignalLog::new();
        log.attach(unit.core().signals());

        let err = unit.execute(Value::Null, None).await.unwrap_err();
        assert_eq!(err.category(), "action");
        assert_eq!(unit.core().status(), UnitStatus::Failed);
        assert_eq!(unit.core().error(), Some(err.clone()));
        assert!(unit.core().result().is_none());
        assert!(log
            .signals()
            .iter()
            .any(|s| matches!(s, Signal::Error { .. })));

        // every later read observes the same stored failure
        let again = unit.await_result().await.unwrap_err();
        assert_eq!(again, err);
    }

    #[tokio::test]
    async fn test_units_are_single_use() {
        let unit = WorkUnit::new(Arc::new(Doubler), UnitOptions::default());
        unit.execute(json!(1), None).await.unwrap();
        let err = unit.execute(json!(2), None).await.unwrap_err();
        assert!(matches!(err, ConvoyError::AlreadyStarted { .. }));
        // the stored outcome is untouched
        assert_eq!(unit.core().result(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_await_result_starts_created_unit_with_null_input() {
        let unit = WorkUnit::new(Arc::new(Doubler), UnitOptions::default());
        // Null input doubles to zero
        assert_eq!(unit.await_result().await.unwrap(), json!(0));
        // and resolves immediately once terminal
        assert_eq!(unit.await_result().await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn test_action_reports_progress_through_handle() {
        let unit = WorkUnit::new(
            Arc::new(Stepper),
            UnitOptions {
                description: "stepper".to_string(),
                tracks_progress: true,
                total_ticks: 3,
            },
        );
        let log = SignalLog::new();
        log.attach(unit.core().signals());

        unit.execute(Value::Null, None).await.unwrap();
        let progress: Vec<u64> = log
            .signals()
            .iter()
            .filter_map(|s| match s {
                Signal::Progress { ticks, .. } => Some(*ticks),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1, 2, 3]);
        assert_eq!(unit.core().ticks(), 3);
        assert_eq!(unit.core().total_ticks(), 3);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let core = UnitCore::new("clamp", true, 10);
        core.begin().unwrap();
        core.report_progress(5);
        core.report_progress(3);
        assert_eq!(core.ticks(), 5);
    }
}
