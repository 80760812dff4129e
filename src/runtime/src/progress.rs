//! Monotonic completion fraction for long-running operations.

use std::sync::Arc;
use tokio::sync::watch;
use vmbridge_core::event::{events, BridgeEvent};
use vmbridge_core::EventEmitter;

/// Fraction in `0.0..=1.0` that never decreases.
///
/// Clones share the same value. Updates are published on a watch channel
/// and, when attached, as `vm.install.progress` events.
#[derive(Clone)]
pub struct Progress {
    tx: Arc<watch::Sender<f64>>,
    telemetry: Option<(EventEmitter, String)>,
}

impl Progress {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0.0);
        Self {
            tx: Arc::new(tx),
            telemetry: None,
        }
    }

    /// Also publish updates as events tagged with `subject` (usually a VM id).
    pub fn with_events(mut self, emitter: EventEmitter, subject: impl Into<String>) -> Self {
        self.telemetry = Some((emitter, subject.into()));
        self
    }

    /// Record progress. Values below the current fraction are ignored and
    /// values outside `0.0..=1.0` are clamped. Returns the current fraction.
    pub fn update(&self, fraction: f64) -> f64 {
        if fraction.is_nan() {
            return self.fraction();
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let advanced = self.tx.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
        if advanced {
            if let Some((emitter, subject)) = &self.telemetry {
                emitter.emit(BridgeEvent::with_fields(
                    events::VM_INSTALL_PROGRESS,
                    [
                        ("subject", serde_json::json!(subject)),
                        ("fraction", serde_json::json!(fraction)),
                    ],
                ));
            }
        }
        self.fraction()
    }

    pub fn finish(&self) {
        self.update(1.0);
    }

    pub fn fraction(&self) -> f64 {
        *self.tx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.fraction() >= 1.0
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.tx.subscribe()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress").field("fraction", &self.fraction()).finish()
    }
}
