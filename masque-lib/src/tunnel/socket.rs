use super::TunnelHandle;
use crate::trace::*;
use bytes::Bytes;
use quinn::{AsyncUdpSocket, UdpPoller};
use quinn_udp::{RecvMeta, Transmit};
use std::{
  io::{self, IoSliceMut},
  net::{Ipv4Addr, SocketAddr},
  pin::Pin,
  task::{Context, Poll},
};

/// Adapter presenting a tunnel handle as the UDP socket of a quinn endpoint.
/// The inner QUIC connection is thus unaware that it runs over a tunnel.
#[derive(Debug)]
pub(crate) struct TunnelSocket {
  tunnel: TunnelHandle,
}

impl TunnelSocket {
  pub(crate) fn new(tunnel: TunnelHandle) -> Self {
    Self { tunnel }
  }
}

/// Sending never blocks since a congested tunnel drops packets
#[derive(Debug)]
struct AlwaysWritable;

impl UdpPoller for AlwaysWritable {
  fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Poll::Ready(Ok(()))
  }
}

impl AsyncUdpSocket for TunnelSocket {
  fn create_io_poller(self: std::sync::Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
    Box::pin(AlwaysWritable)
  }

  fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
    if transmit.destination != self.tunnel.peer_addr() {
      debug!(
        "Packet to {} is sent through the tunnel to {}",
        transmit.destination,
        self.tunnel.peer_addr()
      );
    }
    match transmit.segment_size {
      Some(segment_size) if segment_size > 0 => {
        for segment in transmit.contents.chunks(segment_size) {
          self.tunnel.try_send(Bytes::copy_from_slice(segment))?;
        }
        Ok(())
      }
      _ => self.tunnel.try_send(Bytes::copy_from_slice(transmit.contents)),
    }
  }

  fn poll_recv(&self, cx: &mut Context<'_>, bufs: &mut [IoSliceMut<'_>], meta: &mut [RecvMeta]) -> Poll<io::Result<usize>> {
    let (Some(buf), Some(meta)) = (bufs.first_mut(), meta.first_mut()) else {
      return Poll::Ready(Ok(0));
    };
    match self.tunnel.poll_recv(cx) {
      Poll::Ready(Some(packet)) => {
        let len = packet.len().min(buf.len());
        if len < packet.len() {
          warn!("Truncated a packet of {} bytes from the tunnel", packet.len());
        }
        buf[..len].copy_from_slice(&packet[..len]);
        meta.addr = self.tunnel.peer_addr();
        meta.len = len;
        meta.stride = len;
        meta.ecn = None;
        meta.dst_ip = None;
        Poll::Ready(Ok(1))
      }
      Poll::Ready(None) => Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel closed"))),
      Poll::Pending => Poll::Pending,
    }
  }

  fn local_addr(&self) -> io::Result<SocketAddr> {
    Ok(family_matched_local_addr(self.tunnel.local_addr(), self.tunnel.peer_addr()))
  }
}

/// The tunnel's local address is logical, so report it in the address family of the target.
/// quinn refuses remote addresses of another family than the local socket.
fn family_matched_local_addr(local: SocketAddr, peer: SocketAddr) -> SocketAddr {
  match (local, peer) {
    (SocketAddr::V4(v4), SocketAddr::V6(_)) => SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port()),
    (SocketAddr::V6(v6), SocketAddr::V4(_)) => {
      let ip = v6.ip().to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED);
      SocketAddr::new(ip.into(), v6.port())
    }
    _ => local,
  }
}
