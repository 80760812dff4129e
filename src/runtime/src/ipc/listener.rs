//! Named services that accept incoming sessions.

use super::bus::LocalBus;
use super::requirement::PeerRequirement;
use super::session::Session;
use crate::host::{Feature, Host};
use parking_lot::Mutex;
use std::sync::Arc;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::{Handle, HandleRegistry};

/// Verdict of a listener's delegate on an incoming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptDecision {
    Accept,
    Reject(String),
}

pub(crate) struct ListenerInner {
    service: String,
    requirement: Option<PeerRequirement>,
    delegates: HandleRegistry<Session, AcceptDecision>,
    delegate: Handle,
    /// Accepted sessions, held until the listener closes.
    sessions: Mutex<Vec<Session>>,
    active: Mutex<bool>,
}

impl ListenerInner {
    pub(crate) fn service(&self) -> &str {
        &self.service
    }

    /// Decide on a freshly created server-side session. On acceptance the
    /// session is activated and retained.
    pub(crate) fn offer(&self, session: Session) -> std::result::Result<(), String> {
        if !*self.active.lock() {
            return Err(format!("listener {} is closed", self.service));
        }
        if let Some(requirement) = &self.requirement {
            if let Err(reason) = requirement.evaluate(session.peer_identity()) {
                tracing::info!(service = %self.service, %reason, "peer failed requirement");
                return Err(reason);
            }
        }
        let decision = self
            .delegates
            .notify(self.delegate, session.clone())
            .map_err(|e| e.to_string())?;
        match decision {
            AcceptDecision::Accept => {
                session.activate().map_err(|e| e.to_string())?;
                tracing::debug!(service = %self.service, session = session.name(), "session accepted");
                self.sessions.lock().push(session);
                Ok(())
            }
            AcceptDecision::Reject(reason) => {
                tracing::info!(service = %self.service, %reason, "session rejected by delegate");
                session.cancel();
                Err(reason)
            }
        }
    }
}

/// A service endpoint on a [`LocalBus`].
///
/// The delegate sees every session that passes the peer requirement and
/// typically installs its handlers before answering
/// [`AcceptDecision::Accept`].
pub struct Listener {
    inner: Arc<ListenerInner>,
    bus: LocalBus,
}

impl Listener {
    pub fn new(
        host: &Host,
        bus: &LocalBus,
        service: impl Into<String>,
        requirement: Option<PeerRequirement>,
        delegate: impl Fn(Session) -> AcceptDecision + Send + Sync + 'static,
    ) -> Result<Self> {
        host.check_available(Feature::IpcListener)?;
        if requirement.is_some() {
            host.check_available(Feature::PeerRequirement)?;
        }
        let service = service.into();
        if service.is_empty() {
            return Err(BridgeError::InvalidFormat("service name is empty".to_string()));
        }
        let delegates = HandleRegistry::new("ipc-listener-delegate");
        let delegate = delegates.register_persistent(delegate);
        Ok(Self {
            inner: Arc::new(ListenerInner {
                service,
                requirement,
                delegates,
                delegate,
                sessions: Mutex::new(Vec::new()),
                active: Mutex::new(false),
            }),
            bus: bus.clone(),
        })
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Publish the service; connections are refused until this is called.
    pub fn activate(&self) -> Result<()> {
        let mut active = self.inner.active.lock();
        if *active {
            return Ok(());
        }
        self.bus.register(&self.inner)?;
        *active = true;
        tracing::info!(service = %self.inner.service, "listener active");
        Ok(())
    }

    /// Withdraw the service and cancel every session it accepted.
    pub fn close(&self) {
        {
            let mut active = self.inner.active.lock();
            if !*active {
                return;
            }
            *active = false;
        }
        self.bus.unregister(&self.inner.service);
        let sessions = std::mem::take(&mut *self.inner.sessions.lock());
        tracing::info!(service = %self.inner.service, sessions = sessions.len(), "listener closed");
        for session in sessions {
            session.cancel();
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
        self.inner.delegates.unregister(self.inner.delegate);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("service", &self.inner.service)
            .field("active", &*self.inner.active.lock())
            .finish()
    }
}
