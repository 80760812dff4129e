//! vmnet interfaces: the batched packet datapath.

use super::config::Mode;
use super::network::Network;
use super::packet::PacketBuffer;
use super::stats::{DatapathCounters, DatapathStats};
use super::status::VmnetReturn;
use crate::backend::{InterfaceEvents, NativeInterface};
use crate::devices::MacAddress;
use crate::host::{Feature, Host};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::event::{events, BridgeEvent};
use vmbridge_core::{Handle, HandleRegistry};

/// Parameters requested when starting an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Have the host allocate a MAC address for the guest.
    pub allocate_mac_address: bool,
    pub enable_checksum_offload: bool,
    /// Block traffic between interfaces on the same network.
    pub enable_isolation: bool,
    pub enable_tso: bool,
    pub enable_virtio_header: bool,
}

impl Default for InterfaceDescriptor {
    fn default() -> Self {
        Self {
            allocate_mac_address: true,
            enable_checksum_offload: false,
            enable_isolation: false,
            enable_tso: false,
            enable_virtio_header: false,
        }
    }
}

/// Parameters negotiated with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceParameters {
    pub mac_address: Option<MacAddress>,
    pub mtu: u32,
    pub max_packet_size: usize,
    pub max_read_packet_count: usize,
    pub max_write_packet_count: usize,
}

/// What an interface attaches to.
#[derive(Debug, Clone)]
pub enum InterfaceTarget {
    /// The host's default network for a mode.
    Mode(Mode),
    /// A network created by [`Network::new`] or rebuilt from its serialization.
    Network(Network),
}

type PacketsAvailableFn = Arc<dyn Fn(usize) + Send + Sync>;

/// A started vmnet interface.
///
/// `read` and `write` never block: they move up to one batch and report
/// how many packets were transferred, `0` meaning the datapath would
/// block. The packets-available callback, or [`read_async`](Self::read_async),
/// is how callers learn there is more to read.
pub struct Interface {
    host: Host,
    native: Box<dyn NativeInterface>,
    parameters: InterfaceParameters,
    descriptor: InterfaceDescriptor,
    callbacks: Arc<HandleRegistry<usize>>,
    event_handle: Handle,
    user_callback: Arc<Mutex<Option<PacketsAvailableFn>>>,
    wake: Arc<Notify>,
    /// Signalled when a read drains packets or the interface stops.
    room: Notify,
    stopped: AtomicBool,
    counters: DatapathCounters,
}

impl Interface {
    pub fn start(host: &Host, target: InterfaceTarget, descriptor: InterfaceDescriptor) -> Result<Self> {
        if matches!(target, InterfaceTarget::Network(_)) {
            host.check_available(Feature::VmnetNetwork)?;
        }

        let callbacks = Arc::new(HandleRegistry::new("packets-available"));
        let native = host
            .backend()
            .start_interface(
                &target,
                &descriptor,
                InterfaceEvents {
                    registry: Arc::clone(&callbacks),
                },
            )
            .map_err(|status| BridgeError::failed_with("start interface failed", status))?;

        let limits = &host.config().datapath;
        let mut parameters = native.parameters();
        parameters.max_read_packet_count = parameters
            .max_read_packet_count
            .min(limits.max_read_packet_count)
            .max(1);
        parameters.max_write_packet_count = parameters
            .max_write_packet_count
            .min(limits.max_write_packet_count)
            .max(1);

        let wake = Arc::new(Notify::new());
        let user_callback: Arc<Mutex<Option<PacketsAvailableFn>>> = Arc::new(Mutex::new(None));
        let event_handle = {
            let wake = Arc::clone(&wake);
            let user_callback = Arc::clone(&user_callback);
            callbacks.register_persistent(move |estimate: usize| {
                wake.notify_one();
                let callback = user_callback.lock().clone();
                if let Some(callback) = callback {
                    callback(estimate);
                }
            })
        };
        native.set_event_callback(Some(event_handle));

        tracing::info!(
            mac = ?parameters.mac_address,
            mtu = parameters.mtu,
            max_packet_size = parameters.max_packet_size,
            max_read = parameters.max_read_packet_count,
            max_write = parameters.max_write_packet_count,
            "started vmnet interface"
        );

        Ok(Self {
            host: host.clone(),
            native,
            parameters,
            descriptor,
            callbacks,
            event_handle,
            user_callback,
            wake,
            room: Notify::new(),
            stopped: AtomicBool::new(false),
            counters: DatapathCounters::new(),
        })
    }

    pub fn parameters(&self) -> &InterfaceParameters {
        &self.parameters
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    pub fn max_packet_size(&self) -> usize {
        self.parameters.max_packet_size
    }

    /// Buffer sized for this interface's negotiated geometry.
    pub fn packet_buffer(&self) -> PacketBuffer {
        PacketBuffer::new(self.batch_slots(), self.parameters.max_packet_size)
    }

    /// Reallocate `buffer` if it was sized for a different interface.
    pub fn fit_buffer(&self, buffer: &mut PacketBuffer) {
        buffer.reallocate(self.batch_slots(), self.parameters.max_packet_size);
    }

    fn batch_slots(&self) -> usize {
        self.parameters
            .max_read_packet_count
            .max(self.parameters.max_write_packet_count)
    }

    /// Install the packets-available callback, replacing any previous one.
    pub fn set_packets_available(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        *self.user_callback.lock() = Some(Arc::new(callback));
    }

    pub fn clear_packets_available(&self) {
        *self.user_callback.lock() = None;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(BridgeError::failed("interface stopped"))
        } else {
            Ok(())
        }
    }

    /// Read up to `count` packets (capped by the negotiated batch size).
    /// Returns `0` when nothing is available.
    pub fn read(&self, buffer: &mut PacketBuffer, count: usize) -> Result<usize> {
        self.ensure_running()?;
        self.fit_buffer(buffer);
        let count = count.min(self.parameters.max_read_packet_count);
        if count == 0 {
            return Ok(0);
        }
        buffer.reset();
        match self.native.read(buffer, count) {
            Ok(read) => {
                let bytes = buffer.packets(read).map(<[u8]>::len).sum();
                self.counters.record_read(read, bytes);
                tracing::trace!(requested = count, read, bytes, "vmnet read");
                if read > 0 {
                    self.signal_room();
                }
                Ok(read)
            }
            Err(status) if status.is_would_block() => {
                self.counters.record_read(0, 0);
                Ok(0)
            }
            Err(status) => Err(BridgeError::failed_with("vmnet read failed", status)),
        }
    }

    /// Write the first `count` packets of `buffer` (capped by the negotiated
    /// batch size). Returns how many the host took; `0` means no room.
    pub fn write(&self, buffer: &PacketBuffer, count: usize) -> Result<usize> {
        self.ensure_running()?;
        let count = count.min(self.parameters.max_write_packet_count).min(buffer.slot_count());
        if count == 0 {
            return Ok(0);
        }
        if let Some(len) = buffer
            .packets(count)
            .map(<[u8]>::len)
            .find(|len| *len > self.parameters.max_packet_size)
        {
            return Err(BridgeError::failed_with(
                format!("packet of {len} bytes exceeds max packet size {}", self.parameters.max_packet_size),
                VmnetReturn::PacketTooBig,
            ));
        }
        match self.native.write(buffer, count) {
            Ok(written) => {
                let bytes = buffer.packets(written).map(<[u8]>::len).sum();
                self.counters.record_write(written, bytes);
                tracing::trace!(requested = count, written, bytes, "vmnet write");
                Ok(written)
            }
            Err(status) if status.is_would_block() => {
                self.counters.record_write(0, 0);
                Ok(0)
            }
            Err(status) => Err(BridgeError::failed_with("vmnet write failed", status)),
        }
    }

    /// Wait until at least one packet is read. Fails once the interface is stopped.
    pub async fn read_async(&self, buffer: &mut PacketBuffer, count: usize) -> Result<usize> {
        loop {
            let read = self.read(buffer, count)?;
            if read > 0 {
                return Ok(read);
            }
            self.wake.notified().await;
        }
    }

    /// Write, parking while the datapath would block until a read drains
    /// packets. Fails once the interface is stopped.
    pub async fn write_async(&self, buffer: &PacketBuffer, count: usize) -> Result<usize> {
        loop {
            let written = self.write(buffer, count)?;
            if written > 0 || count == 0 {
                return Ok(written);
            }
            tracing::trace!("vmnet write would block, waiting for room");
            self.room.notified().await;
        }
    }

    fn signal_room(&self) {
        self.room.notify_waiters();
        self.room.notify_one();
    }

    pub fn stats(&self) -> DatapathStats {
        self.counters.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the interface. Parked readers and writers wake with `OperationFailed`.
    /// Stopping twice is a no-op.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.native.set_event_callback(None);
        self.callbacks.unregister(self.event_handle);
        let status = self.native.stop();
        self.wake.notify_waiters();
        self.wake.notify_one();
        self.signal_room();

        let stats = self.counters.snapshot();
        tracing::info!(?status, packets_read = stats.packets_read, packets_written = stats.packets_written, "stopped vmnet interface");
        self.host.events().emit(BridgeEvent::with_fields(
            events::DATAPATH_STOPPED,
            [
                ("status", serde_json::json!(status)),
                ("packets_read", serde_json::json!(stats.packets_read)),
                ("packets_written", serde_json::json!(stats.packets_written)),
            ],
        ));
        status.into_result("stop interface")
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "failed to stop vmnet interface on drop");
        }
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("parameters", &self.parameters)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedHypervisor;
    use crate::vmnet::NetworkConfiguration;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use vmbridge_core::BridgeConfig;

    fn host() -> Host {
        let config = BridgeConfig::default();
        Host::new(SimulatedHypervisor::new(&config.simulator).unwrap(), config)
    }

    fn frame(seq: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seq.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_write_three_read_three() {
        let host = host();
        let config = NetworkConfiguration::new(&host, Mode::Shared).unwrap();
        let network = Network::new(&host, &config).unwrap();
        let iface = Interface::start(&host, InterfaceTarget::Network(network), InterfaceDescriptor::default()).unwrap();
        assert_eq!(iface.max_packet_size(), 1514);
        assert!(iface.parameters().mac_address.is_some());

        let payloads = [frame(1, 60), frame(2, 1514), frame(3, 342)];
        let mut out = iface.packet_buffer();
        for (i, payload) in payloads.iter().enumerate() {
            out.set_packet(i, payload).unwrap();
        }
        assert_eq!(iface.write(&out, 3).unwrap(), 3);

        let mut input = iface.packet_buffer();
        assert_eq!(iface.read(&mut input, 16).unwrap(), 3);
        for (i, payload) in payloads.iter().enumerate() {
            assert_eq!(input.packet(i), Some(payload.as_slice()));
        }
        assert_eq!(iface.read(&mut input, 16).unwrap(), 0);

        let stats = iface.stats();
        assert_eq!(stats.packets_written, 3);
        assert_eq!(stats.packets_read, 3);
        assert_eq!(stats.read_would_block, 1);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let host = host();
        let iface = Interface::start(&host, InterfaceTarget::Mode(Mode::Host), InterfaceDescriptor::default()).unwrap();
        let mut out = PacketBuffer::new(1, 4096);
        out.set_packet(0, &frame(0, 2000)).unwrap();
        assert!(iface.write(&out, 1).is_err());
    }

    #[test]
    fn test_stale_buffer_is_reallocated() {
        let host = host();
        let iface = Interface::start(&host, InterfaceTarget::Mode(Mode::Host), InterfaceDescriptor::default()).unwrap();
        let mut stale = PacketBuffer::new(2, 64);
        assert_eq!(iface.read(&mut stale, 2).unwrap(), 0);
        assert_eq!(stale.max_packet_size(), 1514);
    }

    #[test]
    fn test_interfaces_on_shared_network_see_each_other() {
        let host = host();
        let config = NetworkConfiguration::new(&host, Mode::Shared).unwrap();
        let network = Network::new(&host, &config).unwrap();
        let rebuilt = Network::new_with_serialization(&host, &network.copy_serialization().unwrap()).unwrap();

        let a = Interface::start(&host, InterfaceTarget::Network(network), InterfaceDescriptor::default()).unwrap();
        let b = Interface::start(&host, InterfaceTarget::Network(rebuilt), InterfaceDescriptor::default()).unwrap();

        let mut out = a.packet_buffer();
        out.set_packet(0, b"arp who-has").unwrap();
        assert_eq!(a.write(&out, 1).unwrap(), 1);

        let mut input = b.packet_buffer();
        assert_eq!(b.read(&mut input, 4).unwrap(), 1);
        assert_eq!(input.packet(0), Some(&b"arp who-has"[..]));
    }

    #[test]
    fn test_packets_available_callback() {
        let host = host();
        let iface = Interface::start(&host, InterfaceTarget::Mode(Mode::Shared), InterfaceDescriptor::default()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        iface.set_packets_available(move |estimate| {
            counter.fetch_add(estimate, Ordering::SeqCst);
        });

        let mut out = iface.packet_buffer();
        out.set_packet(0, b"one").unwrap();
        out.set_packet(1, b"two").unwrap();
        iface.write(&out, 2).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        iface.clear_packets_available();
        iface.write(&out, 1).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_wakes_parked_reader() {
        let host = host();
        let iface = Arc::new(
            Interface::start(&host, InterfaceTarget::Mode(Mode::Host), InterfaceDescriptor::default()).unwrap(),
        );
        let reader = {
            let iface = Arc::clone(&iface);
            tokio::spawn(async move {
                let mut buffer = iface.packet_buffer();
                iface.read_async(&mut buffer, 8).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        iface.stop().unwrap();
        iface.stop().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(BridgeError::OperationFailed { .. })));
        assert!(iface.write(&iface.packet_buffer(), 1).is_err());
    }

    #[tokio::test]
    async fn test_read_async_wakes_on_packets() {
        let host = host();
        let iface = Arc::new(
            Interface::start(&host, InterfaceTarget::Mode(Mode::Host), InterfaceDescriptor::default()).unwrap(),
        );
        let reader = {
            let iface = Arc::clone(&iface);
            tokio::spawn(async move {
                let mut buffer = iface.packet_buffer();
                let n = iface.read_async(&mut buffer, 8).await.unwrap();
                buffer.packet(n - 1).unwrap().to_vec()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut out = iface.packet_buffer();
        out.set_packet(0, b"wake").unwrap();
        iface.write(&out, 1).unwrap();

        let last = tokio::time::timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        assert_eq!(last, b"wake");
    }

    fn fill_backlog(iface: &Interface) -> PacketBuffer {
        let mut out = iface.packet_buffer();
        for i in 0..out.slot_count() {
            out.set_packet(i, &frame(i as u8, 64)).unwrap();
        }
        while iface.write(&out, out.slot_count()).unwrap() > 0 {}
        out
    }

    #[tokio::test]
    async fn test_write_async_parks_until_read_drains() {
        let host = host();
        let iface = Arc::new(
            Interface::start(&host, InterfaceTarget::Mode(Mode::Host), InterfaceDescriptor::default()).unwrap(),
        );
        let out = fill_backlog(&iface);
        let blocked_before = iface.stats().write_would_block;

        let writer = {
            let iface = Arc::clone(&iface);
            tokio::spawn(async move { iface.write_async(&out, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert_eq!(iface.stats().write_would_block, blocked_before + 1);

        let mut input = iface.packet_buffer();
        assert!(iface.read(&mut input, 8).unwrap() > 0);
        let written = tokio::time::timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
        assert_eq!(written.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_wakes_parked_writer() {
        let host = host();
        let iface = Arc::new(
            Interface::start(&host, InterfaceTarget::Mode(Mode::Host), InterfaceDescriptor::default()).unwrap(),
        );
        let out = fill_backlog(&iface);
        let writer = {
            let iface = Arc::clone(&iface);
            tokio::spawn(async move { iface.write_async(&out, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        iface.stop().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
        assert!(matches!(result, Err(BridgeError::OperationFailed { .. })));
    }
}
