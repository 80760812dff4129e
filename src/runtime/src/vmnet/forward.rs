//! Forward packets between an interface and a socket.
//!
//! On a byte stream each packet travels as a 4-byte big-endian length
//! followed by the frame. On a datagram socket each datagram is one frame.

use super::interface::Interface;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixDatagram;
use vmbridge_core::error::{BridgeError, Result};

/// Shuttle packets both ways until the stream closes or the interface stops.
///
/// Returns `Ok` when the peer closes the stream cleanly.
pub async fn forward_stream<S>(interface: Arc<Interface>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let max = interface.max_packet_size();

    let inbound = async {
        let mut out = interface.packet_buffer();
        let mut frame = vec![0u8; max];
        loop {
            let len = match reader.read_u32().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(BridgeError::from(e)),
            };
            if len == 0 || len > max {
                return Err(BridgeError::InvalidFormat(format!(
                    "frame length {len} outside 1..={max}"
                )));
            }
            reader.read_exact(&mut frame[..len]).await?;
            out.set_packet(0, &frame[..len])
                .map_err(|status| BridgeError::failed_with("stage frame", status))?;
            interface.write_async(&out, 1).await?;
        }
    };

    let outbound = async {
        let mut input = interface.packet_buffer();
        let batch = interface.parameters().max_read_packet_count;
        loop {
            let count = interface.read_async(&mut input, batch).await?;
            for packet in input.packets(count) {
                writer.write_u32(packet.len() as u32).await?;
                writer.write_all(packet).await?;
            }
            writer.flush().await?;
        }
    };

    let result: Result<()> = tokio::select! {
        result = inbound => result,
        result = outbound => result,
    };
    match &result {
        Ok(()) => tracing::debug!("packet stream closed by peer"),
        Err(e) => tracing::warn!(error = %e, "packet forwarding stopped"),
    }
    result
}

/// Connected datagram socket pair for a file handle network attachment.
///
/// The descriptor goes to `NetworkAttachment::file_handle`; the socket is
/// handed to [`forward_datagram`]. Must be called inside a Tokio runtime.
pub fn datagram_pair() -> Result<(UnixDatagram, OwnedFd)> {
    let (ours, theirs) = std::os::unix::net::UnixDatagram::pair()?;
    ours.set_nonblocking(true)?;
    Ok((UnixDatagram::from_std(ours)?, OwnedFd::from(theirs)))
}

/// Shuttle packets both ways between `interface` and a datagram socket,
/// one frame per datagram, until the interface stops or the socket fails.
pub async fn forward_datagram(interface: Arc<Interface>, socket: UnixDatagram) -> Result<()> {
    let max = interface.max_packet_size();

    let inbound = async {
        let mut out = interface.packet_buffer();
        // One spare byte so a truncated oversized datagram is detectable.
        let mut frame = vec![0u8; max + 1];
        loop {
            let len = socket.recv(&mut frame).await?;
            if len == 0 || len > max {
                return Err(BridgeError::InvalidFormat(format!(
                    "datagram of {len} bytes outside 1..={max}"
                )));
            }
            out.set_packet(0, &frame[..len])
                .map_err(|status| BridgeError::failed_with("stage frame", status))?;
            interface.write_async(&out, 1).await?;
        }
    };

    let outbound = async {
        let mut input = interface.packet_buffer();
        let batch = interface.parameters().max_read_packet_count;
        loop {
            let count = interface.read_async(&mut input, batch).await?;
            for packet in input.packets(count) {
                socket.send(packet).await?;
            }
        }
    };

    let result: Result<()> = tokio::select! {
        result = inbound => result,
        result = outbound => result,
    };
    if let Err(e) = &result {
        tracing::warn!(error = %e, "datagram forwarding stopped");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedHypervisor;
    use crate::host::Host;
    use crate::devices::NetworkAttachment;
    use crate::vmnet::{InterfaceDescriptor, InterfaceTarget, Mode};
    use std::time::Duration;
    use vmbridge_core::BridgeConfig;

    fn interface() -> Arc<Interface> {
        let config = BridgeConfig::default();
        let host = Host::new(SimulatedHypervisor::new(&config.simulator).unwrap(), config);
        Arc::new(
            Interface::start(&host, InterfaceTarget::Mode(Mode::Host), InterfaceDescriptor::default())
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_frames_are_forwarded_and_reflected() {
        let iface = interface();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(forward_stream(Arc::clone(&iface), remote));

        let (mut rx, mut tx) = tokio::io::split(local);
        tx.write_u32(5).await.unwrap();
        tx.write_all(b"hello").await.unwrap();

        let len = tokio::time::timeout(Duration::from_secs(5), rx.read_u32())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 5);
        let mut frame = [0u8; 5];
        rx.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"hello");

        drop(tx);
        drop(rx);
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(iface.stats().packets_written, 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let iface = interface();
        let (mut local, remote) = tokio::io::duplex(1024);
        let task = tokio::spawn(forward_stream(iface, remote));
        local.write_u32(65_000).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(BridgeError::InvalidFormat(_))));
    }

    #[tokio::test]
    async fn test_datagrams_are_forwarded_and_reflected() {
        let iface = interface();
        let (socket, fd) = datagram_pair().unwrap();
        let peer = std::os::unix::net::UnixDatagram::from(fd);
        peer.set_nonblocking(true).unwrap();
        let peer = tokio::net::UnixDatagram::from_std(peer).unwrap();
        let task = tokio::spawn(forward_datagram(Arc::clone(&iface), socket));

        peer.send(b"hello").await.unwrap();
        let mut frame = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(5), peer.recv(&mut frame))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..len], b"hello");
        assert_eq!(iface.stats().packets_written, 1);

        iface.stop().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(BridgeError::OperationFailed { .. })));
    }

    #[tokio::test]
    async fn test_oversized_datagram_is_rejected() {
        let iface = interface();
        let (socket, fd) = datagram_pair().unwrap();
        let peer = std::os::unix::net::UnixDatagram::from(fd);
        let task = tokio::spawn(forward_datagram(Arc::clone(&iface), socket));
        peer.send(&vec![0u8; iface.max_packet_size() + 1]).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(BridgeError::InvalidFormat(_))));
    }

    #[tokio::test]
    async fn test_pair_descriptor_backs_file_handle_attachment() {
        let (_socket, fd) = datagram_pair().unwrap();
        let mut attachment = NetworkAttachment::file_handle(fd);
        assert_eq!(attachment.kind(), "file-handle");
        assert!(attachment.set_mtu(9000).is_ok());
    }
}
