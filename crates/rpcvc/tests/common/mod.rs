#![allow(dead_code)]

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

use rpcvc::server::{Reply, Request, Service};
use rpcvc::tls::{DelegationResult, MappedIdentity, TlsFlags};
use rpcvc::upcall::daemon::{HandshakeHandler, serve_upcalls};
use rpcvc::upcall::{AcceptRes, ConnectRes, Direction, UpcallStatus};

pub const CLIENT_HELLO: &[u8] = b"HELLO";
pub const SERVER_HELLO: &[u8] = b"WORLD";

/// Bind `direction`'s daemon socket in `dir` and serve it with `handler`.
pub fn spawn_daemon(
    dir: &Path,
    direction: Direction,
    handler: Arc<dyn HandshakeHandler>,
) -> PathBuf {
    let path = dir.join(format!("{direction}.sock"));
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(serve_upcalls(listener, direction, handler));
    path
}

fn tcp(socket: OwnedFd) -> tokio::net::TcpStream {
    let stream = std::net::TcpStream::from(socket);
    stream.set_nonblocking(true).unwrap();
    tokio::net::TcpStream::from_std(stream).unwrap()
}

pub fn session(sec: u64, usec: u64, token: u64) -> DelegationResult {
    DelegationResult { sec, usec, token }
}

/// Plays both ends of a toy handshake over TCP connections: the connect
/// side sends `HELLO` and expects `WORLD`, the accept side the reverse.
pub struct ToyDaemon {
    pub connect_session: DelegationResult,
    pub accept_session: DelegationResult,
    pub accept_flags: TlsFlags,
    pub identity: Option<MappedIdentity>,
    pub disconnects: AtomicU32,
    pub hints: std::sync::Mutex<Vec<Option<String>>>,
}

impl Default for ToyDaemon {
    fn default() -> Self {
        Self {
            connect_session: session(1, 0, 1),
            accept_session: session(10, 500_000, 77),
            accept_flags: TlsFlags::HANDSHAKE,
            identity: None,
            disconnects: AtomicU32::new(0),
            hints: Default::default(),
        }
    }
}

impl ToyDaemon {
    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandshakeHandler for ToyDaemon {
    async fn connect(&self, socket: OwnedFd, cert_hint: Option<String>) -> ConnectRes {
        self.hints.lock().unwrap().push(cert_hint);
        let mut stream = tcp(socket);
        stream.write_all(CLIENT_HELLO).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        let status = if buf == SERVER_HELLO {
            UpcallStatus::Ok
        } else {
            UpcallStatus::NoTls
        };
        ConnectRes {
            status,
            session: self.connect_session,
        }
    }

    async fn accept(&self, socket: OwnedFd) -> AcceptRes {
        let mut stream = tcp(socket);
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        if buf != CLIENT_HELLO {
            return AcceptRes {
                status: UpcallStatus::NoTls,
                flags: TlsFlags::HANDSHAKE_FAILED,
                session: self.accept_session,
                identity: None,
            };
        }
        stream.write_all(SERVER_HELLO).await.unwrap();
        AcceptRes {
            status: UpcallStatus::Ok,
            flags: self.accept_flags,
            session: self.accept_session,
            identity: self.identity.clone(),
        }
    }

    async fn disconnect(&self, _session: DelegationResult) -> UpcallStatus {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        UpcallStatus::Ok
    }
}

/// NULL answers empty; procedure 1 echoes a `u32`; procedure 2 returns the
/// caller's mapped uid, or `u32::MAX` without one.
pub struct EchoService;

#[async_trait]
impl Service for EchoService {
    async fn call(&self, mut request: Request) -> Option<Reply> {
        match request.procedure {
            0 => Some(Reply::empty()),
            1 => {
                let value: u32 = request.decode_args().ok()?;
                Some(Reply::success(&value).unwrap())
            }
            2 => {
                let uid = request.tls.identity.as_ref().map_or(u32::MAX, |id| id.uid);
                Some(Reply::success(&uid).unwrap())
            }
            _ => Some(Reply::error(rpcvc::rpc::AcceptStat::ProcUnavail)),
        }
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within a second");
}
