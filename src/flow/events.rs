//! Signal system for lifecycle observation
//!
//! Provides typed signal emission for unit lifecycle activity, plus the
//! relabeling step ancestors use to bubble descendant activity.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::errors::ConvoyError;

/// Lifecycle signal types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    /// The unit transitioned into execution
    Executing,
    /// The unit's progress counter moved
    Progress { ticks: u64, total: u64 },
    /// The unit settled successfully
    Done { result: Value },
    /// The unit settled with a failure
    Error { error: ConvoyError },
    /// A lane exhausted its queue; the sole point at which a feeder may
    /// append more work
    Idle,
    /// A descendant transitioned into execution
    ChildExecuting { child: String },
    /// A descendant's progress counter moved
    ChildProgress {
        child: String,
        ticks: u64,
        total: u64,
    },
    /// A descendant settled successfully
    ChildDone { child: String, result: Value },
    /// A descendant settled with a failure
    ChildError { child: String, error: ConvoyError },
}

impl Signal {
    /// The explicit forwarding step a composing ancestor performs when it
    /// re-emits a child's signal on its own hub.
    ///
    /// Base lifecycle signals are relabeled to their `Child*` forms; signals
    /// that are already bubbled pass through unchanged, so nesting depth
    /// does not change observability. `Idle` stays private to the scope that
    /// emitted it.
    pub fn relabel_for_parent(&self, child: &str) -> Option<Signal> {
        match self {
            Signal::Executing => Some(Signal::ChildExecuting {
                child: child.to_string(),
            }),
            Signal::Progress { ticks, total } => Some(Signal::ChildProgress {
                child: child.to_string(),
                ticks: *ticks,
                total: *total,
            }),
            Signal::Done { result } => Some(Signal::ChildDone {
                child: child.to_string(),
                result: result.clone(),
            }),
            Signal::Error { error } => Some(Signal::ChildError {
                child: child.to_string(),
                error: error.clone(),
            }),
            Signal::ChildExecuting { .. }
            | Signal::ChildProgress { .. }
            | Signal::ChildDone { .. }
            | Signal::ChildError { .. } => Some(self.clone()),
            Signal::Idle => None,
        }
    }
}

/// Signal envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub sequence: u64,
    /// Id of the unit whose hub emitted this envelope
    pub source: String,
    pub emitted_at: DateTime<Utc>,
    pub signal: Signal,
}

/// Global sequence counter for envelopes
static SIGNAL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Get the next envelope sequence number
pub fn next_sequence() -> u64 {
    SIGNAL_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Callback invoked for every envelope emitted on a hub
pub type SignalCallback = dyn Fn(&SignalEnvelope) + Send + Sync;

/// Per-unit observer registry.
///
/// Callbacks run synchronously on the emitting context, which is what keeps
/// pool routing free of a central lock: all routing state is mutated inside
/// handlers that never overlap.
pub struct SignalHub {
    source: String,
    subscribers: DashMap<u64, Arc<SignalCallback>>,
    next_token: AtomicU64,
}

impl SignalHub {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            subscribers: DashMap::new(),
            next_token: AtomicU64::new(0),
        }
    }

    /// Id of the unit this hub belongs to
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Register an observer; returns a token for `unsubscribe`
    pub fn subscribe<F>(&self, callback: F) -> u64
    where
        F: Fn(&SignalEnvelope) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(token, Arc::new(callback));
        token
    }

    /// Remove an observer; returns whether it was registered
    pub fn unsubscribe(&self, token: u64) -> bool {
        self.subscribers.remove(&token).is_some()
    }

    /// Wrap the signal in an envelope and deliver it to every observer
    pub fn emit(&self, signal: Signal) {
        let envelope = SignalEnvelope {
            sequence: next_sequence(),
            source: self.source.clone(),
            emitted_at: Utc::now(),
            signal,
        };
        // Collect first so no shard lock is held while callbacks run;
        // a callback may subscribe to this same hub.
        let callbacks: Vec<Arc<SignalCallback>> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for callback in callbacks {
            callback(&envelope);
        }
    }
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub")
            .field("source", &self.source)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// A buffering observer that records every envelope it sees.
///
/// Attach it to any hub to capture the signal stream for assertions or
/// diagnostics.
#[derive(Clone, Default)]
pub struct SignalLog {
    envelopes: Arc<parking_lot::RwLock<Vec<SignalEnvelope>>>,
}

impl SignalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe this log to a hub; returns the subscription token
    pub fn attach(&self, hub: &SignalHub) -> u64 {
        let envelopes = Arc::clone(&self.envelopes);
        hub.subscribe(move |envelope| {
            envelopes.write().push(envelope.clone());
        })
    }

    pub fn envelopes(&self) -> Vec<SignalEnvelope> {
        self.envelopes.read().clone()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.envelopes
            .read()
            .iter()
            .map(|e| e.signal.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.envelopes.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relabel_base_signals() {
        let done = Signal::Done { result: json!(7) };
        match done.relabel_for_parent("c1") {
            Some(Signal::ChildDone { child, result }) => {
                assert_eq!(child, "c1");
                assert_eq!(result, json!(7));
            }
            other => panic!("unexpected relabel: {:?}", other),
        }
        assert!(matches!(
            Signal::Executing.relabel_for_parent("c1"),
            Some(Signal::ChildExecuting { .. })
        ));
        assert!(Signal::Idle.relabel_for_parent("c1").is_none());
    }

    #[test]
    fn test_relabel_is_transparent_for_bubbled_signals() {
        let bubbled = Signal::ChildDone {
            child: "grandchild".to_string(),
            result: json!(null),
        };
        match bubbled.relabel_for_parent("middle") {
            Some(Signal::ChildDone { child, .. }) => assert_eq!(child, "grandchild"),
            other => panic!("unexpected relabel: {:?}", other),
        }
    }

    #[test]
    fn test_hub_delivery_and_unsubscribe() {
        let hub = SignalHub::new("unit-1");
        let log = SignalLog::new();
        let token = log.attach(&hub);

        hub.emit(Signal::Executing);
        hub.emit(Signal::Done { result: json!(1) });
        assert_eq!(log.envelopes().len(), 2);
        assert_eq!(log.envelopes()[0].source, "unit-1");

        assert!(hub.unsubscribe(token));
        hub.emit(Signal::Idle);
        assert_eq!(log.envelopes().len(), 2);
        assert!(!hub.unsubscribe(token));
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let hub = SignalHub::new("unit-2");
        let log = SignalLog::new();
        log.attach(&hub);

        for _ in 0..5 {
            hub.emit(Signal::Executing);
        }
        let seqs: Vec<u64> = log.envelopes().iter().map(|e| e.sequence).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}
