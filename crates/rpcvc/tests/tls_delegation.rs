//! Handshake delegation against in-process companion daemons.

mod common;

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::codec::FramedRead;

use common::{EchoService, ToyDaemon, eventually, session, spawn_daemon};
use rpcvc::client::{CallOptions, VcClient};
use rpcvc::endpoint::{PeerAddr, StreamEndpoint};
use rpcvc::record::{RecordMarkCodec, encode_marked};
use rpcvc::rpc::{AcceptStat, AuthStat, OpaqueAuth, RejectStat, ReplyBody, RpcMsg};
use rpcvc::server::{AcceptOutcome, Server, ServerConfig, ServerTransport};
use rpcvc::tls::{
    DelegationResult, MappedIdentity, TlsError, TlsFlags, TlsPhase, TlsRequirement, start_tls,
};
use rpcvc::upcall::daemon::HandshakeHandler;
use rpcvc::upcall::{AcceptRes, ConnectRes, Direction, UpcallChannel, UpcallStatus};
use rpcvc::xdr::{MemXdr, RecordXdr, XdrDecode, XdrEncode};

const PROG: u32 = 100_003;

struct Fixture {
    _dir: tempfile::TempDir,
    daemon: Arc<ToyDaemon>,
    server: Arc<Server>,
    connect: Arc<UpcallChannel>,
}

fn fixture(daemon: ToyDaemon, config: ServerConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Arc::new(daemon);
    let accept_path = spawn_daemon(dir.path(), Direction::Accept, daemon.clone());
    let connect_path = spawn_daemon(dir.path(), Direction::Connect, daemon.clone());

    let accept = Arc::new(UpcallChannel::new(Direction::Accept));
    accept.configure(accept_path);
    let connect = Arc::new(UpcallChannel::new(Direction::Connect));
    connect.configure(connect_path);

    let server = Arc::new(Server::new(Arc::new(EchoService), accept).with_config(config));
    Fixture {
        _dir: dir,
        daemon,
        server,
        connect,
    }
}

/// Connect a TCP client and hand back the server's side of the connection.
async fn connect_tcp(server: &Arc<Server>) -> (VcClient, Arc<ServerTransport>) {
    let rendezvous = server.bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let PeerAddr::Inet(addr) = rendezvous.local_addr().unwrap() else {
        panic!("expected inet address");
    };
    let client = tokio::spawn(VcClient::connect_tcp(addr, PROG, 4));
    let transport = loop {
        match rendezvous.accept().await {
            AcceptOutcome::Accepted(transport) => break transport,
            AcceptOutcome::WouldBlock => continue,
            AcceptOutcome::Failed(e) => panic!("accept failed: {e}"),
        }
    };
    tokio::spawn(Arc::clone(server).drive(Arc::clone(&transport)));
    (client.await.unwrap().unwrap(), transport)
}

#[tokio::test]
async fn scenario_c_session_attached_and_delivery_resumed() {
    let fx = fixture(ToyDaemon::default(), ServerConfig::default());
    let (client, transport) = connect_tcp(&fx.server).await;

    let result = start_tls(&client, &fx.connect, Some("nfs.example.org".into()))
        .await
        .unwrap();
    assert_eq!(result, fx.daemon.connect_session);
    assert_eq!(
        fx.daemon.hints.lock().unwrap().as_slice(),
        [Some("nfs.example.org".to_string())]
    );

    let server_tls = transport.tls_state();
    assert_eq!(server_tls.phase, TlsPhase::Secured);
    assert_eq!(server_tls.session, Some(session(10, 500_000, 77)));
    assert!(transport.delivery_enabled());
    assert!(client.tls_state().is_secured());

    // Records flow again on both ends.
    let echoed: u32 = client.call(1, &31u32).await.unwrap();
    assert_eq!(echoed, 31);
}

#[tokio::test]
async fn scenario_d_no_daemon_configured() {
    let fx = fixture(ToyDaemon::default(), ServerConfig::default());
    let (client, transport) = connect_tcp(&fx.server).await;
    let unconfigured = Arc::new(UpcallChannel::new(Direction::Connect));

    let started = Instant::now();
    let err = start_tls(&client, &unconfigured, None).await.unwrap_err();
    assert!(matches!(err, TlsError::NoTlsSupport(Direction::Connect)));
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(client.tls_state(), Default::default());
    assert_eq!(transport.tls_state(), Default::default());
    assert!(!transport.is_dead());
    let echoed: u32 = client.call(1, &8u32).await.unwrap();
    assert_eq!(echoed, 8);
}

#[tokio::test]
async fn mapped_identity_reaches_the_service() {
    let daemon = ToyDaemon {
        accept_flags: TlsFlags::HANDSHAKE | TlsFlags::GOT_CERT | TlsFlags::VERIFIED | TlsFlags::CERT_USER,
        identity: Some(MappedIdentity {
            uid: 1001,
            gids: vec![1001, 27],
        }),
        ..ToyDaemon::default()
    };
    let config = ServerConfig::new().with_tls_requirement(TlsRequirement::CertificateUser);
    let fx = fixture(daemon, config);
    let (client, transport) = connect_tcp(&fx.server).await;

    let err = client.call::<_, u32>(2, &()).await.unwrap_err();
    assert!(matches!(
        err,
        rpcvc::ClientError::Denied(RejectStat::AuthError(AuthStat::TooWeak))
    ));

    start_tls(&client, &fx.connect, None).await.unwrap();
    let uid: u32 = client.call(2, &()).await.unwrap();
    assert_eq!(uid, 1001);
    assert_eq!(transport.tls_state().identity.unwrap().gids, [1001, 27]);
}

#[tokio::test]
async fn teardown_releases_daemon_sessions() {
    let fx = fixture(ToyDaemon::default(), ServerConfig::default());
    let (client, transport) = connect_tcp(&fx.server).await;
    start_tls(&client, &fx.connect, None).await.unwrap();

    client.close().await;
    // One disconnect from the client, one from the server transport once it
    // sees the stream close.
    eventually(|| fx.daemon.disconnects() == 2).await;
    eventually(|| !fx.server.dispatcher().is_registered(transport.id())).await;
}

#[tokio::test]
async fn rejected_accept_drops_only_that_connection() {
    let fx = fixture(ToyDaemon::default(), ServerConfig::default());
    let (client, transport) = connect_tcp(&fx.server).await;

    // Bypass the connect daemon so the accept daemon reads garbage.
    let mut guard = client.lock().await;
    let reply = client
        .call_with(&mut guard, 0, rpcvc::rpc::OpaqueAuth::tls(), &(), None)
        .await
        .unwrap();
    assert!(reply.verf.is_starttls_verifier());
    client.endpoint().write_all(b"NOPE!").await.unwrap();
    drop(guard);

    eventually(|| transport.is_dead()).await;
    assert!(transport.tls_state().flags.contains(TlsFlags::HANDSHAKE_FAILED));

    // The listener side is unaffected.
    let (other, _) = connect_tcp(&fx.server).await;
    let echoed: u32 = other.call(1, &4u32).await.unwrap();
    assert_eq!(echoed, 4);
}

/// Accept handler that records how many handshakes overlap.
#[derive(Default)]
struct SlowAccept {
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    order: std::sync::Mutex<Vec<u64>>,
}

#[async_trait]
impl HandshakeHandler for SlowAccept {
    async fn connect(&self, _socket: OwnedFd, _hint: Option<String>) -> ConnectRes {
        ConnectRes {
            status: UpcallStatus::NoTls,
            session: session(0, 0, 0),
        }
    }

    async fn accept(&self, socket: OwnedFd) -> AcceptRes {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        // The first byte on the connection names the session.
        let stream = std::os::unix::net::UnixStream::from(socket);
        stream.set_nonblocking(true).unwrap();
        let mut stream = UnixStream::from_std(stream).unwrap();
        let token = u64::from(stream.read_u8().await.unwrap());
        self.order.lock().unwrap().push(token);

        tokio::time::sleep(Duration::from_millis(100)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        AcceptRes {
            status: UpcallStatus::Ok,
            flags: TlsFlags::HANDSHAKE,
            session: session(1, 0, token),
            identity: None,
        }
    }

    async fn disconnect(&self, _session: DelegationResult) -> UpcallStatus {
        UpcallStatus::Ok
    }
}

#[tokio::test]
async fn handshakes_in_one_direction_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(SlowAccept::default());
    let path = spawn_daemon(dir.path(), Direction::Accept, handler.clone());
    let channel = Arc::new(UpcallChannel::new(Direction::Accept));
    channel.configure(path);

    let mut tasks = Vec::new();
    let mut peers = Vec::new();
    for token in [1u8, 2] {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(&[token]).await.unwrap();
        peers.push(theirs);

        let channel = Arc::clone(&channel);
        tasks.push(tokio::spawn(async move {
            channel.begin_session(Arc::new(ours)).await?.accept().await
        }));
        // Queue the second session strictly behind the first.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut tokens = Vec::new();
    for task in tasks {
        tokens.push(task.await.unwrap().unwrap().session.token);
    }
    assert_eq!(tokens, [1, 2]);
    assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(*handler.order.lock().unwrap(), [1, 2]);
    assert_eq!(channel.stats().succeeded, 2);
}

/// Accept handler that waits on the connection until it sees EOF.
struct StuckAccept {
    saw_eof: tokio::sync::mpsc::UnboundedSender<usize>,
}

#[async_trait]
impl HandshakeHandler for StuckAccept {
    async fn connect(&self, _socket: OwnedFd, _hint: Option<String>) -> ConnectRes {
        unreachable!("accept-side test")
    }

    async fn accept(&self, socket: OwnedFd) -> AcceptRes {
        let stream = std::os::unix::net::UnixStream::from(socket);
        stream.set_nonblocking(true).unwrap();
        let mut stream = UnixStream::from_std(stream).unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(usize::MAX);
        let _ = self.saw_eof.send(n);
        AcceptRes {
            status: UpcallStatus::NoTls,
            flags: TlsFlags::HANDSHAKE_FAILED,
            session: session(0, 0, 0),
            identity: None,
        }
    }

    async fn disconnect(&self, _session: DelegationResult) -> UpcallStatus {
        UpcallStatus::Ok
    }
}

#[tokio::test]
async fn daemon_timeout_half_closes_read_side() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let path = spawn_daemon(
        dir.path(),
        Direction::Accept,
        Arc::new(StuckAccept { saw_eof: tx }),
    );
    let channel = Arc::new(
        UpcallChannel::new(Direction::Accept)
            .with_options(CallOptions::default().with_timeout(Duration::from_millis(100))),
    );
    channel.configure(path);

    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let ours = Arc::new(ours);
    let err = channel
        .begin_session(ours.clone())
        .await
        .unwrap()
        .accept()
        .await
        .unwrap_err();
    assert!(matches!(err, TlsError::DaemonTimeout(_)));
    assert_eq!(channel.stats().timed_out, 1);

    // The daemon's blocked read returns end-of-stream.
    let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // Only the read side was closed: our writes still reach the peer.
    StreamEndpoint::write_all(&*ours, b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    theirs.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
}

#[tokio::test]
async fn force_shutdown_closes_abandoned_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let path = spawn_daemon(
        dir.path(),
        Direction::Accept,
        Arc::new(StuckAccept { saw_eof: tx }),
    );
    let channel = Arc::new(
        UpcallChannel::new(Direction::Accept)
            .with_options(CallOptions::default().with_timeout(Duration::from_millis(50)))
            .with_force_shutdown_after(Duration::from_millis(50)),
    );
    channel.configure(path);

    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let err = channel
        .begin_session(Arc::new(ours))
        .await
        .unwrap()
        .accept()
        .await
        .unwrap_err();
    assert!(matches!(err, TlsError::DaemonTimeout(_)));

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(1), theirs.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

/// Connect handler whose first handshake waits on the connection until it
/// sees EOF; later handshakes succeed at once.
struct StuckOnceConnect {
    calls: AtomicU32,
    saw_eof: tokio::sync::mpsc::UnboundedSender<usize>,
}

#[async_trait]
impl HandshakeHandler for StuckOnceConnect {
    async fn connect(&self, socket: OwnedFd, _hint: Option<String>) -> ConnectRes {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return ConnectRes {
                status: UpcallStatus::Ok,
                session: session(2, 0, 2),
            };
        }
        let stream = std::os::unix::net::UnixStream::from(socket);
        stream.set_nonblocking(true).unwrap();
        let mut stream = UnixStream::from_std(stream).unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap_or(usize::MAX);
        let _ = self.saw_eof.send(n);
        ConnectRes {
            status: UpcallStatus::NoTls,
            session: session(0, 0, 0),
        }
    }

    async fn accept(&self, _socket: OwnedFd) -> AcceptRes {
        unreachable!("connect-side test")
    }

    async fn disconnect(&self, _session: DelegationResult) -> UpcallStatus {
        UpcallStatus::Ok
    }
}

/// Play the server for one STARTTLS bootstrap call, then hand the stream back.
async fn acknowledge_starttls(mut peer: UnixStream) -> UnixStream {
    let mut frames = FramedRead::new(&mut peer, RecordMarkCodec::new());
    let record = frames.next().await.unwrap().unwrap();
    drop(frames);
    let msg = RpcMsg::decode(&mut RecordXdr::new(record)).unwrap();
    let ack = encode_marked(|xdr: &mut MemXdr| {
        let body = ReplyBody::Accepted {
            verf: OpaqueAuth::starttls_verifier(),
            stat: AcceptStat::Success,
        };
        RpcMsg::reply(msg.xid, body).encode(xdr)
    })
    .unwrap();
    peer.write_all(&ack).await.unwrap();
    peer
}

#[tokio::test]
async fn connect_daemon_timeout_falls_back_to_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = StuckOnceConnect {
        calls: AtomicU32::new(0),
        saw_eof: tx,
    };
    let path = spawn_daemon(dir.path(), Direction::Connect, Arc::new(handler));
    let channel = Arc::new(
        UpcallChannel::new(Direction::Connect)
            .with_options(CallOptions::default().with_timeout(Duration::from_millis(100))),
    );
    channel.configure(path);

    let (ours, theirs) = UnixStream::pair().unwrap();
    let client = VcClient::new(Arc::new(ours), PROG, 4);
    let peer = tokio::spawn(acknowledge_starttls(theirs));

    let err = start_tls(&client, &channel, None).await.unwrap_err();
    assert!(matches!(err, TlsError::DaemonTimeout(_)));
    assert_eq!(channel.stats().timed_out, 1);

    let tls = client.tls_state();
    assert_eq!(tls.phase, TlsPhase::Plaintext);
    assert!(tls.flags.contains(TlsFlags::HANDSHAKE_FAILED));
    assert!(tls.session.is_none());

    // The daemon's blocked read returns end-of-stream.
    let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // Only the read side was closed: our writes still reach the peer.
    let mut theirs = peer.await.unwrap();
    client.endpoint().write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    theirs.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");

    // The connect slot is free again for the next connection.
    let (ours, theirs) = UnixStream::pair().unwrap();
    let second = VcClient::new(Arc::new(ours), PROG, 4);
    let peer = tokio::spawn(acknowledge_starttls(theirs));
    let result = tokio::time::timeout(Duration::from_secs(1), start_tls(&second, &channel, None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, session(2, 0, 2));
    assert!(second.tls_state().is_secured());
    let _theirs = peer.await.unwrap();
}

#[tokio::test]
async fn reconfigured_channel_uses_new_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let channel = UpcallChannel::new(Direction::Connect);
    channel.configure(dir.path().join("missing.sock"));
    assert!(matches!(
        channel.null().await,
        Err(TlsError::DaemonUnavailable(_))
    ));

    let path = spawn_daemon(dir.path(), Direction::Connect, Arc::new(ToyDaemon::default()));
    channel.configure(path);
    channel.null().await.unwrap();

    channel.teardown();
    assert!(matches!(
        channel.null().await,
        Err(TlsError::NoTlsSupport(Direction::Connect))
    ));
}
