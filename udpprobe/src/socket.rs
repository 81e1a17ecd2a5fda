//! Blocking UDP socket wrapper with deadline receives and statistics tracking.
use std::io::{Error as IoError, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::{Duration, Instant};

use crate::stats::SocketStats;

/// Receive buffer size that fits any UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Errors that can occur during socket operations.
#[derive(Debug)]
pub enum SocketError {
    Io(IoError),
    InvalidAddress,
    /// No datagram arrived before the read timeout or deadline.
    Timeout,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketError::Io(e) => write!(f, "IO error: {}", e),
            SocketError::InvalidAddress => write!(f, "Invalid address"),
            SocketError::Timeout => write!(f, "Receive timed out"),
        }
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SocketError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for SocketError {
    fn from(err: IoError) -> Self {
        match err.kind() {
            // Platforms disagree on which kind a read timeout reports
            ErrorKind::WouldBlock | ErrorKind::TimedOut => SocketError::Timeout,
            _ => SocketError::Io(err),
        }
    }
}

/// Blocking UDP socket with per-socket statistics.
pub struct ProbeSocket {
    socket: StdUdpSocket,
    stats: SocketStats,
}

impl ProbeSocket {
    /// Creates a new UDP socket bound to the specified address.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = StdUdpSocket::bind(addr)?;
        Ok(Self {
            socket,
            stats: SocketStats::default(),
        })
    }

    /// Binds an ephemeral port on the unspecified address of `peer`'s family.
    pub fn bind_for(peer: SocketAddr) -> Result<Self, SocketError> {
        let ip = match peer.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self::bind(SocketAddr::new(ip, 0))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        if addr.port() == 0 {
            return Err(SocketError::InvalidAddress);
        }
        let sent = self.socket.send_to(data, addr)?;
        self.stats.bytes_sent += sent as u64;
        self.stats.packets_sent += 1;
        Ok(sent)
    }

    /// Receives one datagram into `buf`, honouring the current read timeout.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        let (len, addr) = self.socket.recv_from(buf)?;
        self.stats.bytes_received += len as u64;
        self.stats.packets_received += 1;
        Ok((len, addr))
    }

    /// Receives one datagram, giving up once `deadline` has passed.
    pub fn recv_until(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<(usize, SocketAddr), SocketError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SocketError::Timeout);
        }
        self.set_read_timeout(Some(remaining))?;
        self.recv_from(buf)
    }

    /// Sets the read timeout. A zero duration is rejected by the OS, so it
    /// is clamped to one microsecond.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> Result<(), SocketError> {
        let dur = dur.map(|d| d.max(Duration::from_micros(1)));
        self.socket.set_read_timeout(dur)?;
        Ok(())
    }

    pub fn stats(&self) -> &SocketStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> ProbeSocket {
        ProbeSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_send_and_receive_update_stats() {
        let mut a = loopback();
        let mut b = loopback();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"hello", b_addr).unwrap();
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(2);
        let (len, from) = b.recv_until(&mut buf, deadline).unwrap();

        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().bytes_received, 5);
    }

    #[test]
    fn test_recv_until_times_out() {
        let mut socket = loopback();
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(
            socket.recv_until(&mut buf, deadline),
            Err(SocketError::Timeout)
        ));
        // Expired deadline returns immediately
        assert!(matches!(
            socket.recv_until(&mut buf, Instant::now()),
            Err(SocketError::Timeout)
        ));
    }

    #[test]
    fn test_bind_for_matches_family() {
        let socket = ProbeSocket::bind_for("127.0.0.1:9".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }

    #[test]
    fn test_port_zero_destination_rejected() {
        let mut socket = loopback();
        let target: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            socket.send_to(b"x", target),
            Err(SocketError::InvalidAddress)
        ));
    }
}
