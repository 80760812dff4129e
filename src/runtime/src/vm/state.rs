//! VM lifecycle states and the state-change fan-out.

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use vmbridge_core::{Handle, HandleRegistry};

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Saving,
    Restoring,
    /// Terminal; the VM must be recreated.
    Error,
}

impl VmState {
    pub fn can_start(self) -> bool {
        self == VmState::Stopped
    }

    pub fn can_pause(self) -> bool {
        self == VmState::Running
    }

    pub fn can_resume(self) -> bool {
        self == VmState::Paused
    }

    pub fn can_request_stop(self) -> bool {
        self == VmState::Running
    }

    pub fn can_stop(self) -> bool {
        matches!(self, VmState::Running | VmState::Paused)
    }

    pub fn can_save(self) -> bool {
        matches!(self, VmState::Running | VmState::Paused)
    }

    pub fn can_restore(self) -> bool {
        self == VmState::Stopped
    }

    /// Intermediate states that always settle into another state.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            VmState::Starting
                | VmState::Pausing
                | VmState::Resuming
                | VmState::Stopping
                | VmState::Saving
                | VmState::Restoring
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Stopped => "stopped",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Pausing => "pausing",
            VmState::Paused => "paused",
            VmState::Resuming => "resuming",
            VmState::Stopping => "stopping",
            VmState::Saving => "saving",
            VmState::Restoring => "restoring",
            VmState::Error => "error",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivers every state to every subscriber, in registration order.
///
/// Each subscriber owns an unbounded channel, so a slow consumer never
/// causes another to miss or coalesce transitions.
pub(crate) struct StateFanout {
    subscribers: HandleRegistry<VmState, bool>,
    order: Mutex<Vec<Handle>>,
}

impl StateFanout {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: HandleRegistry::new("state-subscribers"),
            order: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> StateSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self
            .subscribers
            .register_persistent(move |state| tx.send(state).is_ok());
        self.order.lock().push(handle);
        StateSubscription {
            handle,
            stream: UnboundedReceiverStream::new(rx),
        }
    }

    pub(crate) fn unsubscribe(&self, handle: Handle) -> bool {
        self.order.lock().retain(|h| *h != handle);
        self.subscribers.unregister(handle)
    }

    /// Must only be called from the VM queue.
    pub(crate) fn publish(&self, state: VmState) {
        let handles = self.order.lock().clone();
        let mut gone = Vec::new();
        for handle in handles {
            match self.subscribers.notify(handle, state) {
                Ok(true) => {}
                _ => gone.push(handle),
            }
        }
        for handle in gone {
            self.unsubscribe(handle);
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.order.lock().len()
    }
}

/// Stream of state changes for one subscriber.
pub struct StateSubscription {
    handle: Handle,
    stream: UnboundedReceiverStream<VmState>,
}

impl StateSubscription {
    /// Handle to pass to `VirtualMachine::unsubscribe`.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Next state, or `None` once the VM is gone or unsubscribed.
    pub async fn recv(&mut self) -> Option<VmState> {
        futures::StreamExt::next(&mut self.stream).await
    }

    /// Wait until the VM reaches `target`, returning every state seen on the way.
    pub async fn wait_for(&mut self, target: VmState) -> Option<Vec<VmState>> {
        let mut seen = Vec::new();
        while let Some(state) = self.recv().await {
            seen.push(state);
            if state == target {
                return Some(seen);
            }
        }
        None
    }
}

impl Stream for StateSubscription {
    type Item = VmState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<VmState>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}
