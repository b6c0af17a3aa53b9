//! Byte-stream endpoints.
//!
//! [`StreamEndpoint`] is what the transports need from a connected socket:
//! readiness waits, single non-blocking reads and writes, addresses, and
//! half-close. Implemented for tokio TCP and Unix streams.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::{TcpStream, UnixStream};

use crate::upcall::fdpass;

/// Address of either end of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "family", content = "addr", rename_all = "snake_case")]
pub enum PeerAddr {
    Inet(SocketAddr),
    /// Unix-domain socket; `None` when unnamed.
    Local(Option<PathBuf>),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Local(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddr::Local(None) => f.write_str("unix:(unnamed)"),
        }
    }
}

#[async_trait]
pub trait StreamEndpoint: AsFd + Send + Sync {
    /// Wait until a read may make progress.
    async fn readable(&self) -> io::Result<()>;

    async fn writable(&self) -> io::Result<()>;

    /// One non-blocking read. `Ok(0)` means the peer closed.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn peer_addr(&self) -> io::Result<PeerAddr>;

    fn local_addr(&self) -> io::Result<PeerAddr>;

    /// Half- or fully close the underlying socket.
    ///
    /// Acts on the shared open socket, so any other holder of the descriptor
    /// (a handshake daemon, for one) observes it too.
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => nix::sys::socket::Shutdown::Read,
            Shutdown::Write => nix::sys::socket::Shutdown::Write,
            Shutdown::Both => nix::sys::socket::Shutdown::Both,
        };
        nix::sys::socket::shutdown(self.as_fd().as_raw_fd(), how).map_err(io::Error::from)
    }

    async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.writable().await?;
            match self.try_write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write `buf` with `fd` attached as ancillary data, then the remainder
    /// of `buf` normally. Only local sockets can carry descriptors.
    async fn write_all_with_fd(&self, buf: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
        let _ = (buf, fd);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "descriptor passing needs a local socket",
        ))
    }
}

#[async_trait]
impl StreamEndpoint for TcpStream {
    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        TcpStream::writable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn peer_addr(&self) -> io::Result<PeerAddr> {
        TcpStream::peer_addr(self).map(PeerAddr::Inet)
    }

    fn local_addr(&self) -> io::Result<PeerAddr> {
        TcpStream::local_addr(self).map(PeerAddr::Inet)
    }
}

#[async_trait]
impl StreamEndpoint for UnixStream {
    async fn readable(&self) -> io::Result<()> {
        UnixStream::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        UnixStream::writable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        UnixStream::try_write(self, buf)
    }

    fn peer_addr(&self) -> io::Result<PeerAddr> {
        let addr = UnixStream::peer_addr(self)?;
        Ok(PeerAddr::Local(addr.as_pathname().map(|p| p.to_path_buf())))
    }

    fn local_addr(&self) -> io::Result<PeerAddr> {
        let addr = UnixStream::local_addr(self)?;
        Ok(PeerAddr::Local(addr.as_pathname().map(|p| p.to_path_buf())))
    }

    async fn write_all_with_fd(&self, buf: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
        let sent = fdpass::send_with_fd(self, buf, fd).await?;
        StreamEndpoint::write_all(self, &buf[sent..]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unix_pair_reads_and_writes() {
        let (a, b) = UnixStream::pair().unwrap();
        StreamEndpoint::write_all(&a, b"ping").await.unwrap();

        StreamEndpoint::readable(&b).await.unwrap();
        let mut buf = [0u8; 8];
        let n = StreamEndpoint::try_read(&b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(StreamEndpoint::peer_addr(&b).unwrap(), PeerAddr::Local(None));
    }

    #[tokio::test]
    async fn read_shutdown_reports_eof_locally() {
        let (a, b) = UnixStream::pair().unwrap();
        StreamEndpoint::shutdown(&a, Shutdown::Read).unwrap();

        StreamEndpoint::readable(&a).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(StreamEndpoint::try_read(&a, &mut buf).unwrap(), 0);
        drop(b);
    }

    #[tokio::test]
    async fn tcp_cannot_pass_descriptors() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();

        let err = client
            .write_all_with_fd(b"x", client.as_fd())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(matches!(
            StreamEndpoint::peer_addr(&client).unwrap(),
            PeerAddr::Inet(a) if a == addr
        ));
    }

    #[test]
    fn display_forms() {
        assert_eq!(
            PeerAddr::Local(Some(PathBuf::from("/run/tlsd.sock"))).to_string(),
            "unix:/run/tlsd.sock"
        );
        assert_eq!(
            PeerAddr::Inet("10.0.0.1:2049".parse().unwrap()).to_string(),
            "10.0.0.1:2049"
        );
    }
}
