//! Listening endpoints.
//!
//! A [`Rendezvous`] never carries data. Each readiness signal buys exactly
//! one non-blocking accept; what happens next depends on its outcome.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::unix::AsyncFd;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Notify;

use super::transport::ServerTransport;
use crate::dispatch::Dispatcher;
use crate::endpoint::{PeerAddr, StreamEndpoint};

/// A non-blocking listening socket.
pub trait Listener: AsRawFd + Send + Sync + 'static {
    /// One accept attempt. Must not block.
    fn accept_stream(&self) -> io::Result<Arc<dyn StreamEndpoint>>;

    fn listen_addr(&self) -> io::Result<PeerAddr>;

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Listener for std::net::TcpListener {
    fn accept_stream(&self) -> io::Result<Arc<dyn StreamEndpoint>> {
        let (stream, _) = self.accept()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(TcpStream::from_std(stream)?))
    }

    fn listen_addr(&self) -> io::Result<PeerAddr> {
        self.local_addr().map(PeerAddr::Inet)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        std::net::TcpListener::set_nonblocking(self, nonblocking)
    }
}

impl Listener for std::os::unix::net::UnixListener {
    fn accept_stream(&self) -> io::Result<Arc<dyn StreamEndpoint>> {
        let (stream, _) = self.accept()?;
        stream.set_nonblocking(true)?;
        Ok(Arc::new(UnixStream::from_std(stream)?))
    }

    fn listen_addr(&self) -> io::Result<PeerAddr> {
        let addr = self.local_addr()?;
        Ok(PeerAddr::Local(addr.as_pathname().map(Path::to_path_buf)))
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        std::os::unix::net::UnixListener::set_nonblocking(self, nonblocking)
    }
}

#[derive(Debug)]
pub enum AcceptOutcome {
    /// New connection, registered and marked active.
    Accepted(Arc<ServerTransport>),
    /// Spurious wakeup; inactive until the listener signals again.
    WouldBlock,
    /// Accept failed. The rendezvous is inactive with notifications off
    /// until [`Rendezvous::enable_notifications`] is called.
    Failed(io::Error),
}

pub struct Rendezvous<L: Listener> {
    listener: AsyncFd<L>,
    dispatcher: Arc<Dispatcher>,
    max_record: usize,
    active: AtomicBool,
    notifications: AtomicBool,
    rearmed: Notify,
}

impl Rendezvous<std::net::TcpListener> {
    pub fn bind_tcp(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        max_record: usize,
    ) -> io::Result<Self> {
        Self::new(std::net::TcpListener::bind(addr)?, dispatcher, max_record)
    }
}

impl Rendezvous<std::os::unix::net::UnixListener> {
    /// Bind a local socket at `path`, replacing any stale socket file.
    pub fn bind_unix(
        path: impl AsRef<Path>,
        dispatcher: Arc<Dispatcher>,
        max_record: usize,
    ) -> io::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Self::new(
            std::os::unix::net::UnixListener::bind(path)?,
            dispatcher,
            max_record,
        )
    }
}

impl<L: Listener> Rendezvous<L> {
    /// Wrap an already-bound listener. Must be called within a runtime.
    pub fn new(listener: L, dispatcher: Arc<Dispatcher>, max_record: usize) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let listener = AsyncFd::new(listener)?;
        tracing::debug!(addr = ?listener.get_ref().listen_addr().ok(), "Rendezvous listening");
        Ok(Self {
            listener,
            dispatcher,
            max_record,
            active: AtomicBool::new(false),
            notifications: AtomicBool::new(true),
            rearmed: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<PeerAddr> {
        self.listener.get_ref().listen_addr()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications.load(Ordering::Acquire)
    }

    /// Re-arm readiness notifications after a failed accept.
    pub fn enable_notifications(&self) {
        self.notifications.store(true, Ordering::Release);
        self.rearmed.notify_waiters();
    }

    /// Wait for a readiness signal, then make one accept attempt.
    pub async fn accept(&self) -> AcceptOutcome {
        loop {
            let rearmed = self.rearmed.notified();
            if self.notifications_enabled() {
                break;
            }
            rearmed.await;
        }

        let mut guard = match self.listener.readable().await {
            Ok(guard) => guard,
            Err(e) => return self.failed(e),
        };
        self.active.store(true, Ordering::Release);

        match guard.try_io(|listener| listener.get_ref().accept_stream()) {
            Ok(Ok(endpoint)) => {
                let transport =
                    ServerTransport::new(endpoint, Arc::clone(&self.dispatcher), self.max_record);
                tracing::debug!(conn = %transport.id(), peer = ?transport.peer_addr(), "Accepted connection");
                AcceptOutcome::Accepted(transport)
            }
            Ok(Err(e)) => self.failed(e),
            Err(_would_block) => {
                self.active.store(false, Ordering::Release);
                AcceptOutcome::WouldBlock
            }
        }
    }

    fn failed(&self, e: io::Error) -> AcceptOutcome {
        self.active.store(false, Ordering::Release);
        self.notifications.store(false, Ordering::Release);
        tracing::warn!(error = %e, "Accept failed; rendezvous disabled");
        AcceptOutcome::Failed(e)
    }
}

impl<L: Listener> std::fmt::Debug for Rendezvous<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("addr", &self.local_addr().ok())
            .field("active", &self.is_active())
            .field("notifications", &self.notifications_enabled())
            .finish_non_exhaustive()
    }
}
