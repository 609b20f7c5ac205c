pub mod events;
pub mod lane;
pub mod pool;
pub mod queue;
pub mod unit;

pub use events::{Signal, SignalEnvelope, SignalHub, SignalLog};
pub use lane::{Lane, LaneCtx, LaneOptions, SharedState};
pub use pool::{Collector, LanePool, PoolOptions};
pub use queue::{FeedHandle, FeedTarget, WorkQueue};
pub use unit::{
    ActionCtx, Executable, UnitAction, UnitCore, UnitHandle, UnitOptions, UnitStatus, WorkUnit,
};
