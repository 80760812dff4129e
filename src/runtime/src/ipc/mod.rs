//! IPC: typed message values, sessions, listeners and peer requirements.

mod bus;
mod listener;
mod requirement;
mod session;
mod value;

pub use bus::LocalBus;
pub use listener::{AcceptDecision, Listener};
pub use requirement::{PeerIdentity, PeerRequirement};
pub use session::{Session, SessionState};
pub use value::{EntryKey, IpcFd, IpcTag, IpcValue};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedHypervisor;
    use crate::host::Host;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vmbridge_core::config::SimulatorConfig;
    use vmbridge_core::{BridgeConfig, BridgeError};

    fn host() -> Host {
        let config = BridgeConfig::default();
        Host::new(SimulatedHypervisor::new(&config.simulator).unwrap(), config)
    }

    fn doubling_listener(host: &Host, bus: &LocalBus, requirement: Option<PeerRequirement>) -> Listener {
        let listener = Listener::new(host, bus, "com.example.double", requirement, |session| {
            session.set_incoming_message_handler(|message| {
                let n = message.get_i64("n").ok()??;
                let mut reply = message.create_reply().ok()?;
                reply.insert("n", n * 2).ok()?;
                Some(reply)
            });
            AcceptDecision::Accept
        })
        .unwrap();
        listener.activate().unwrap();
        listener
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let host = host();
        let bus = LocalBus::new();
        let listener = doubling_listener(&host, &bus, None);
        assert_eq!(bus.services(), vec!["com.example.double".to_string()]);

        let client = bus
            .connect(&host, "com.example.double", PeerIdentity::current())
            .unwrap();
        assert_eq!(client.state(), SessionState::Inactive);
        client.activate().unwrap();

        let mut request = IpcValue::dictionary();
        request.insert("n", 4i64).unwrap();
        let reply = client.send_message_with_reply(request).unwrap().await.unwrap();
        assert_eq!(reply.get_i64("n").unwrap(), Some(8));
        assert_eq!(listener.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_accepted_sessions() {
        let host = host();
        let bus = LocalBus::new();
        let listener = doubling_listener(&host, &bus, None);
        let client = bus
            .connect(&host, "com.example.double", PeerIdentity::current())
            .unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        client.set_cancel_handler(move |reason| {
            let _ = tx.send(reason);
        });
        client.activate().unwrap();

        listener.close();
        let reason = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(reason.can_retry);
        assert!(bus.services().is_empty());

        let err = bus
            .connect(&host, "com.example.double", PeerIdentity::current())
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_requirement_rejects_peer() {
        let host = host();
        let bus = LocalBus::new();
        let requirement = PeerRequirement::new().signing_identifier("com.example.trusted");
        let _listener = doubling_listener(&host, &bus, Some(requirement));

        let err = bus
            .connect(&host, "com.example.double", PeerIdentity::current())
            .unwrap_err();
        match err {
            BridgeError::Ipc(rich) => {
                assert!(!rich.can_retry);
                assert!(rich.description.contains("signing-identifier"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let trusted = PeerIdentity::current().with_signing_identifier("com.example.trusted");
        assert!(bus.connect(&host, "com.example.double", trusted).is_ok());
    }

    #[test]
    fn test_delegate_rejection() {
        let host = host();
        let bus = LocalBus::new();
        let offered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&offered);
        let listener = Listener::new(&host, &bus, "com.example.closed", None, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            AcceptDecision::Reject("maintenance".to_string())
        })
        .unwrap();
        listener.activate().unwrap();

        let err = bus
            .connect(&host, "com.example.closed", PeerIdentity::current())
            .unwrap_err();
        assert!(err.to_string().contains("maintenance"));
        assert_eq!(offered.load(Ordering::SeqCst), 1);
        assert_eq!(listener.session_count(), 0);
    }

    #[test]
    fn test_duplicate_service_refused() {
        let host = host();
        let bus = LocalBus::new();
        let _first = doubling_listener(&host, &bus, None);
        let second =
            Listener::new(&host, &bus, "com.example.double", None, |_| AcceptDecision::Accept)
                .unwrap();
        assert!(second.activate().is_err());
    }

    #[test]
    fn test_listener_needs_platform_support() {
        let config = BridgeConfig {
            simulator: SimulatorConfig {
                platform_version: "13.0".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let host = Host::new(SimulatedHypervisor::new(&config.simulator).unwrap(), config);
        let bus = LocalBus::new();
        let err = Listener::new(&host, &bus, "svc", None, |_| AcceptDecision::Accept).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedOnPlatform { .. }));
        assert!(bus.connect(&host, "svc", PeerIdentity::current()).is_err());
    }
}
