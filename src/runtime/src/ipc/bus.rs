//! In-process service registry connecting clients to listeners.

use super::listener::ListenerInner;
use super::requirement::PeerIdentity;
use super::session::Session;
use crate::host::{Feature, Host};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::RichError;

/// Directory of active listeners keyed by service name.
#[derive(Clone, Default)]
pub struct LocalBus {
    services: Arc<DashMap<String, Weak<ListenerInner>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session to `service` as `identity`.
    ///
    /// The returned client session is inactive: install handlers, then
    /// call [`Session::activate`]. A missing service fails with a retryable
    /// error, a rejection with a permanent one.
    pub fn connect(&self, host: &Host, service: &str, identity: PeerIdentity) -> Result<Session> {
        host.check_available(Feature::IpcSession)?;
        let listener = self
            .services
            .get(service)
            .and_then(|entry| entry.upgrade())
            .ok_or_else(|| {
                BridgeError::Ipc(RichError::transient(format!("no listener for service {service}")))
            })?;
        let (client, server) = Session::pair(host, service, identity, PeerIdentity::current())?;
        if let Err(reason) = listener.offer(server) {
            client.cancel();
            return Err(BridgeError::Ipc(RichError::permanent(format!(
                "session rejected: {reason}"
            ))));
        }
        tracing::debug!(service, "session connected");
        Ok(client)
    }

    /// Names of the currently published services.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn register(&self, listener: &Arc<ListenerInner>) -> Result<()> {
        match self.services.entry(listener.service().to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().strong_count() > 0 {
                    return Err(BridgeError::failed(format!(
                        "service {} already has a listener",
                        listener.service()
                    )));
                }
                occupied.insert(Arc::downgrade(listener));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(listener));
            }
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, service: &str) {
        self.services.remove(service);
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("services", &self.services())
            .finish()
    }
}
