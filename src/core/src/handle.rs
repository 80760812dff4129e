//! Handle registry: opaque tokens for in-flight native operations.
//!
//! The native side never sees a Rust closure. It is handed a [`Handle`] and
//! later calls back with it; the registry maps the token to the continuation
//! (one-shot) or callback (persistent) that should receive the result.

use crate::error::{BridgeError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Process-wide counter so handles are unique across every registry.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique token for one pending operation or one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    fn next() -> Self {
        Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild a handle from the raw value the native side carried.
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

type OnceFn<T> = Box<dyn FnOnce(T) + Send>;
type PersistentFn<T, R> = Arc<dyn Fn(T) -> R + Send + Sync>;

enum Entry<T, R> {
    // Mutex only makes the boxed FnOnce `Sync`; it is never contended because
    // the entry is removed from the map before it is invoked.
    Once(Mutex<OnceFn<T>>),
    Persistent(PersistentFn<T, R>),
}

/// Maps handles to continuations.
///
/// `T` is the value delivered to a continuation, `R` what a persistent
/// callback returns to the native caller (an accept decision, for example).
/// Sharded via `DashMap`, and continuations are always invoked after their
/// entry has left the map, so resolves on distinct handles never wait on
/// each other.
pub struct HandleRegistry<T, R = ()> {
    name: &'static str,
    entries: DashMap<Handle, Entry<T, R>>,
}

impl<T, R> HandleRegistry<T, R>
where
    T: 'static,
    R: 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
        }
    }

    /// Register a one-shot continuation, released when resolved.
    pub fn register(&self, continuation: impl FnOnce(T) + Send + 'static) -> Handle {
        let handle = Handle::next();
        self.entries
            .insert(handle, Entry::Once(Mutex::new(Box::new(continuation))));
        tracing::trace!(registry = self.name, %handle, "registered one-shot handle");
        handle
    }

    /// Register a long-lived callback, released only by [`unregister`](Self::unregister).
    pub fn register_persistent(&self, callback: impl Fn(T) -> R + Send + Sync + 'static) -> Handle {
        let handle = Handle::next();
        self.entries
            .insert(handle, Entry::Persistent(Arc::new(callback)));
        tracing::trace!(registry = self.name, %handle, "registered persistent handle");
        handle
    }

    /// Deliver `value` to the one-shot continuation under `handle`.
    ///
    /// The entry is removed atomically with the lookup, so a second resolve
    /// of the same handle fails with `UnknownHandle`.
    pub fn resolve(&self, handle: Handle, value: T) -> Result<()> {
        let removed = self
            .entries
            .remove_if(&handle, |_, entry| matches!(entry, Entry::Once(_)));
        match removed {
            Some((_, Entry::Once(continuation))) => {
                tracing::trace!(registry = self.name, %handle, "resolving handle");
                (continuation.into_inner())(value);
                Ok(())
            }
            _ => Err(BridgeError::UnknownHandle(handle)),
        }
    }

    /// Invoke the persistent callback under `handle`; it stays registered.
    pub fn notify(&self, handle: Handle, value: T) -> Result<R> {
        let callback = match self.entries.get(&handle).as_deref() {
            Some(Entry::Persistent(callback)) => Arc::clone(callback),
            _ => return Err(BridgeError::UnknownHandle(handle)),
        };
        Ok(callback(value))
    }

    /// Release a handle of either kind. Returns whether it was registered.
    pub fn unregister(&self, handle: Handle) -> bool {
        let existed = self.entries.remove(&handle).is_some();
        if existed {
            tracing::trace!(registry = self.name, %handle, "unregistered handle");
        }
        existed
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Number of live handles of both kinds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Force-resolve every outstanding one-shot handle.
    ///
    /// Used when the owner of the operations goes away (device removed, VM
    /// stopped) so that no awaiting caller is left parked forever.
    /// Persistent callbacks are left alone. Returns how many were resolved.
    pub fn resolve_all(&self, mut make: impl FnMut() -> T) -> usize {
        let pending: Vec<Handle> = self
            .entries
            .iter()
            .filter(|entry| matches!(entry.value(), Entry::Once(_)))
            .map(|entry| *entry.key())
            .collect();

        let mut resolved = 0;
        for handle in pending {
            if self.resolve(handle, make()).is_ok() {
                resolved += 1;
            }
        }
        if resolved > 0 {
            tracing::debug!(registry = self.name, resolved, "force-resolved pending handles");
        }
        resolved
    }
}

impl<T> HandleRegistry<Result<T>>
where
    T: Send + 'static,
{
    /// Register a one-shot handle whose result is observed through a [`Pending`].
    pub fn register_pending(&self) -> Pending<T> {
        let (tx, rx) = oneshot::channel();
        let handle = self.register(move |result| {
            // Receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        });
        Pending { handle, rx }
    }
}

impl<T, R> std::fmt::Debug for HandleRegistry<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("name", &self.name)
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Result of an asynchronous native operation.
///
/// Await it, or call [`wait`](Self::wait) from synchronous code. If the
/// continuation is dropped without being resolved (its registry was torn
/// down) the result is an `OperationFailed` error rather than a hang.
#[must_use = "a pending operation does nothing observable unless awaited"]
pub struct Pending<T> {
    handle: Handle,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// The handle the native side resolves.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Block the current thread until the operation resolves.
    ///
    /// Must not be called from the queue that resolves the handle.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }

    /// Non-blocking check; `None` while still in flight.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(abandoned(self.handle))),
        }
    }
}

fn abandoned(handle: Handle) -> BridgeError {
    BridgeError::failed(format!("operation {handle} was abandoned before completion"))
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let handle = self.handle;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(abandoned(handle))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("handle", &self.handle).finish()
    }
}
