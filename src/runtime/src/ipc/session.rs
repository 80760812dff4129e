//! Message sessions between two peers.

use super::requirement::PeerIdentity;
use super::value::IpcValue;
use crate::host::{Feature, Host};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::{DispatchQueue, Handle, HandleRegistry, Pending, RichError};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; inbound messages are buffered until activation.
    Inactive,
    Active,
    /// Terminal.
    Cancelled,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionState::Inactive => "inactive",
            SessionState::Active => "active",
            SessionState::Cancelled => "cancelled",
        })
    }
}

enum Frame {
    Message { body: IpcValue, reply: Option<Handle> },
    Reply { to: Handle, result: std::result::Result<IpcValue, RichError> },
    Cancel,
}

struct Inbound {
    state: SessionState,
    backlog: VecDeque<Frame>,
}

struct SessionInner {
    name: String,
    queue: DispatchQueue,
    peer: OnceLock<Weak<SessionInner>>,
    peer_identity: PeerIdentity,
    inbound: Mutex<Inbound>,
    message_handlers: HandleRegistry<IpcValue, Option<IpcValue>>,
    message_handler: Mutex<Option<Handle>>,
    cancel_handlers: HandleRegistry<RichError>,
    cancel_handler: Mutex<Option<Handle>>,
    replies: Arc<HandleRegistry<Result<IpcValue>>>,
    reply_timeout: Option<Duration>,
}

/// One end of a bidirectional message channel.
///
/// Inbound messages are handled one at a time on the session's own queue,
/// in the order the peer sent them. Cloning yields another reference to the
/// same session; dropping the last one cancels it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Two connected, inactive sessions. `a` sees `b_identity` as its peer
    /// and the other way round.
    pub(crate) fn pair(
        host: &Host,
        name: &str,
        a_identity: PeerIdentity,
        b_identity: PeerIdentity,
    ) -> Result<(Session, Session)> {
        host.check_available(Feature::IpcSession)?;
        let timeout = host.config().ipc.reply_timeout();
        let a = Session::new(format!("{name}.client"), b_identity, timeout)?;
        let b = Session::new(format!("{name}.server"), a_identity, timeout)?;
        let _ = a.inner.peer.set(Arc::downgrade(&b.inner));
        let _ = b.inner.peer.set(Arc::downgrade(&a.inner));
        tracing::debug!(session = name, "created session pair");
        Ok((a, b))
    }

    fn new(name: String, peer_identity: PeerIdentity, reply_timeout: Option<Duration>) -> Result<Self> {
        let queue = DispatchQueue::new(format!("vmbridge.ipc.{name}"))?;
        Ok(Self {
            inner: Arc::new(SessionInner {
                name,
                queue,
                peer: OnceLock::new(),
                peer_identity,
                inbound: Mutex::new(Inbound {
                    state: SessionState::Inactive,
                    backlog: VecDeque::new(),
                }),
                message_handlers: HandleRegistry::new("ipc-message-handler"),
                message_handler: Mutex::new(None),
                cancel_handlers: HandleRegistry::new("ipc-cancel-handler"),
                cancel_handler: Mutex::new(None),
                replies: Arc::new(HandleRegistry::new("ipc-replies")),
                reply_timeout,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> SessionState {
        self.inner.inbound.lock().state
    }

    pub fn peer_identity(&self) -> &PeerIdentity {
        &self.inner.peer_identity
    }

    /// Handle every inbound message. A returned value answers a message
    /// sent with [`send_message_with_reply`](Self::send_message_with_reply);
    /// for one-way messages it is discarded. Replaces any previous handler.
    pub fn set_incoming_message_handler(
        &self,
        handler: impl Fn(IpcValue) -> Option<IpcValue> + Send + Sync + 'static,
    ) {
        let handle = self.inner.message_handlers.register_persistent(handler);
        if let Some(previous) = self.inner.message_handler.lock().replace(handle) {
            self.inner.message_handlers.unregister(previous);
        }
    }

    /// Called once when the session is cancelled from either side.
    pub fn set_cancel_handler(&self, handler: impl Fn(RichError) + Send + Sync + 'static) {
        let handle = self.inner.cancel_handlers.register_persistent(handler);
        if let Some(previous) = self.inner.cancel_handler.lock().replace(handle) {
            self.inner.cancel_handlers.unregister(previous);
        }
    }

    /// Start delivering messages, including any that arrived before.
    pub fn activate(&self) -> Result<()> {
        let mut inbound = self.inner.inbound.lock();
        match inbound.state {
            SessionState::Active => return Ok(()),
            SessionState::Cancelled => {
                return Err(BridgeError::invalid_transition("activate session", inbound.state))
            }
            SessionState::Inactive => {}
        }
        inbound.state = SessionState::Active;
        let backlog = std::mem::take(&mut inbound.backlog);
        tracing::debug!(session = %self.inner.name, buffered = backlog.len(), "session activated");
        for frame in backlog {
            self.inner.dispatch(frame);
        }
        Ok(())
    }

    /// Tear the session down. Outstanding replies fail, the peer is told
    /// and the cancel handler runs. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        self.inner.cancel_local();
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            SessionState::Active => Ok(()),
            SessionState::Cancelled => Err(BridgeError::Ipc(RichError::permanent(format!(
                "session {} is cancelled",
                self.inner.name
            )))),
            state => Err(BridgeError::invalid_transition("send message", state)),
        }
    }

    /// Send without expecting a reply.
    pub fn send_message(&self, message: IpcValue) -> Result<()> {
        self.ensure_active()?;
        let body = message.duplicate()?;
        self.inner.send(Frame::Message { body, reply: None })
    }

    /// Send and resolve with the peer's reply, or with a [`RichError`]
    /// when the peer cancels, sends nothing back or the reply times out.
    pub fn send_message_with_reply(&self, message: IpcValue) -> Result<Pending<IpcValue>> {
        self.ensure_active()?;
        let body = message.duplicate()?;
        let pending = self.inner.replies.register_pending();
        let handle = pending.handle();
        if let Err(e) = self.inner.send(Frame::Message {
            body,
            reply: Some(handle),
        }) {
            self.inner.replies.unregister(handle);
            return Err(e);
        }
        if let Some(timeout) = self.inner.reply_timeout {
            arm_reply_timeout(Arc::downgrade(&self.inner.replies), handle, timeout);
        }
        tracing::trace!(session = %self.inner.name, %handle, "sent message expecting reply");
        Ok(pending)
    }
}

impl SessionInner {
    fn peer(&self) -> Option<Arc<SessionInner>> {
        self.peer.get()?.upgrade()
    }

    fn send(&self, frame: Frame) -> Result<()> {
        let peer = self.peer().ok_or_else(|| {
            BridgeError::Ipc(RichError::transient(format!("peer of {} is gone", self.name)))
        })?;
        peer.receive(frame);
        Ok(())
    }

    /// Accept a frame from the peer: buffered while inactive, queued once active.
    fn receive(self: &Arc<Self>, frame: Frame) {
        let mut inbound = self.inbound.lock();
        match inbound.state {
            SessionState::Inactive if matches!(frame, Frame::Cancel) => {
                drop(inbound);
                self.shut_down(RichError::transient(format!("peer cancelled session {}", self.name)));
            }
            SessionState::Inactive => inbound.backlog.push_back(frame),
            SessionState::Active => self.dispatch(frame),
            SessionState::Cancelled => {
                tracing::trace!(session = %self.name, "dropped frame for cancelled session");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        let session = Arc::clone(self);
        if let Err(e) = self.queue.submit(move || session.handle(frame)) {
            tracing::warn!(session = %self.name, error = %e, "session queue closed");
        }
    }

    fn handle(&self, frame: Frame) {
        match frame {
            Frame::Message { body, reply } => {
                let handler = *self.message_handler.lock();
                let response = match handler {
                    Some(handler) => self.message_handlers.notify(handler, body).ok().flatten(),
                    None => {
                        tracing::warn!(session = %self.name, "message arrived without a handler");
                        None
                    }
                };
                let Some(to) = reply else {
                    return;
                };
                let result = match response.map(|value| value.duplicate()) {
                    Some(Ok(value)) => Ok(value),
                    Some(Err(e)) => Err(RichError::permanent(format!("reply could not be sent: {e}"))),
                    None => Err(RichError::permanent("peer sent no reply")),
                };
                if let Err(e) = self.send(Frame::Reply { to, result }) {
                    tracing::debug!(session = %self.name, error = %e, "reply not delivered");
                }
            }
            Frame::Reply { to, result } => {
                if let Err(e) = self.replies.resolve(to, result.map_err(BridgeError::Ipc)) {
                    tracing::debug!(session = %self.name, error = %e, "reply for unknown request");
                }
            }
            Frame::Cancel => {
                self.shut_down(RichError::transient(format!("peer cancelled session {}", self.name)));
            }
        }
    }

    fn cancel_local(&self) {
        if self.shut_down(RichError::permanent(format!("session {} was cancelled", self.name))) {
            if let Some(peer) = self.peer() {
                peer.receive(Frame::Cancel);
            }
        }
    }

    /// Move to `Cancelled`. Returns false when already cancelled.
    fn shut_down(&self, reason: RichError) -> bool {
        {
            let mut inbound = self.inbound.lock();
            if inbound.state == SessionState::Cancelled {
                return false;
            }
            inbound.state = SessionState::Cancelled;
            inbound.backlog.clear();
        }
        let failed = self
            .replies
            .resolve_all(|| Err(BridgeError::Ipc(reason.clone())));
        tracing::debug!(session = %self.name, failed, reason = %reason.description, "session cancelled");

        if let Some(handler) = self.message_handler.lock().take() {
            self.message_handlers.unregister(handler);
        }
        if let Some(handler) = self.cancel_handler.lock().take() {
            let _ = self.cancel_handlers.notify(handler, reason);
            self.cancel_handlers.unregister(handler);
        }
        true
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel_local();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("peer", &self.inner.peer_identity)
            .finish()
    }
}

fn arm_reply_timeout(replies: Weak<HandleRegistry<Result<IpcValue>>>, handle: Handle, timeout: Duration) {
    let spawned = std::thread::Builder::new()
        .name("vmbridge-ipc-timeout".to_string())
        .spawn(move || {
            std::thread::sleep(timeout);
            let Some(replies) = replies.upgrade() else {
                return;
            };
            let timed_out = Err(BridgeError::Ipc(RichError::transient(format!(
                "no reply within {}ms",
                timeout.as_millis()
            ))));
            if replies.resolve(handle, timed_out).is_ok() {
                tracing::warn!(%handle, ?timeout, "reply timed out");
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to arm reply timeout");
    }
}
