//! Daemon side of the upcall protocol.
//!
//! [`serve_upcalls`] accepts local connections and dispatches each request to
//! a [`HandshakeHandler`]. Handshake requests arrive with the connection's
//! socket attached; the handler owns that descriptor from then on.
//!
//! Requests on one upcall connection are handled concurrently, so a
//! disconnect is never stuck behind a hung handshake.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Decoder;

use super::fdpass::recv_with_fds;
use super::protocol::{
    AcceptRes, ConnectArgs, ConnectRes, PROC_DISCONNECT, PROC_HANDLE_RECORD, PROC_HANDSHAKE,
    PROC_NULL, UPCALL_VERSION, UpcallStatus,
};
use super::Direction;
use crate::endpoint::StreamEndpoint;
use crate::record::{FramingError, RecordMarkCodec, encode_marked};
use crate::rpc::{AcceptStat, CallBody, MsgBody, ReplyBody, RpcMsg};
use crate::segment::{SegmentChain, receive_buffer};
use crate::tls::{DelegationResult, TlsFlags};
use crate::xdr::{RecordXdr, XdrDecode, XdrEncode};

/// What a handshake daemon does with each upcall.
#[async_trait]
pub trait HandshakeHandler: Send + Sync + 'static {
    /// Run a client-side handshake on `socket`.
    async fn connect(&self, socket: OwnedFd, cert_hint: Option<String>) -> ConnectRes;

    /// Run a server-side handshake on `socket`.
    async fn accept(&self, socket: OwnedFd) -> AcceptRes;

    async fn handle_record(&self, session: DelegationResult) -> UpcallStatus {
        let _ = session;
        UpcallStatus::Ok
    }

    async fn disconnect(&self, session: DelegationResult) -> UpcallStatus;
}

/// Result returned when a handshake request carried no socket.
fn no_socket_connect() -> ConnectRes {
    ConnectRes {
        status: UpcallStatus::NoSocket,
        session: DelegationResult {
            sec: 0,
            usec: 0,
            token: 0,
        },
    }
}

fn no_socket_accept() -> AcceptRes {
    AcceptRes {
        status: UpcallStatus::NoSocket,
        flags: TlsFlags::empty(),
        session: no_socket_connect().session,
        identity: None,
    }
}

/// Serve `direction`'s upcall program on `listener` until accepting fails.
pub async fn serve_upcalls(
    listener: UnixListener,
    direction: Direction,
    handler: Arc<dyn HandshakeHandler>,
) -> std::io::Result<()> {
    tracing::info!(%direction, "Serving handshake upcalls");
    loop {
        let (stream, _) = listener.accept().await?;
        tracing::debug!(%direction, "Upcall connection accepted");
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, direction, handler).await {
                tracing::warn!(%direction, error = %e, "Upcall connection failed");
            }
        });
    }
}

async fn serve_connection(
    stream: UnixStream,
    direction: Direction,
    handler: Arc<dyn HandshakeHandler>,
) -> Result<(), FramingError> {
    let stream = Arc::new(stream);
    let mut codec = RecordMarkCodec::new();
    // Descriptors are matched to handshake requests in arrival order.
    let fds: Arc<StdMutex<VecDeque<OwnedFd>>> = Arc::default();

    loop {
        let mut buf = receive_buffer();
        let (n, received) = recv_with_fds(&stream, &mut buf).await?;
        if n == 0 {
            tracing::debug!(%direction, "Upcall connection closed");
            return Ok(());
        }
        crate::lock(&fds).extend(received);
        buf.truncate(n);

        while let Some(record) = codec.decode(&mut buf)? {
            // Claim the descriptor before spawning so ordering holds.
            let request = Request::parse(record, direction, &fds);
            let stream = Arc::clone(&stream);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let Some(reply) = request.run(&*handler).await else {
                    return;
                };
                if let Err(e) = StreamEndpoint::write_all(&*stream, &reply).await {
                    tracing::warn!(error = %e, "Failed to send upcall reply");
                }
            });
        }
    }
}

enum Request {
    Null { xid: u32 },
    Connect { xid: u32, socket: Option<OwnedFd>, args: ConnectArgs },
    Accept { xid: u32, socket: Option<OwnedFd> },
    HandleRecord { xid: u32, session: DelegationResult },
    Disconnect { xid: u32, session: DelegationResult },
    Error { xid: u32, stat: AcceptStat },
    Ignored,
}

impl Request {
    fn parse(record: SegmentChain, direction: Direction, fds: &StdMutex<VecDeque<OwnedFd>>) -> Self {
        let mut xdr = RecordXdr::new(record);
        let msg = match RpcMsg::decode(&mut xdr) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable upcall");
                return Request::Ignored;
            }
        };
        let xid = msg.xid;
        let MsgBody::Call(call) = msg.body else {
            return Request::Ignored;
        };
        if let Some(stat) = check_program(&call, direction) {
            return Request::Error { xid, stat };
        }
        let garbage = Request::Error {
            xid,
            stat: AcceptStat::GarbageArgs,
        };
        match call.procedure {
            PROC_NULL => Request::Null { xid },
            PROC_HANDSHAKE => {
                let socket = crate::lock(fds).pop_front();
                match direction {
                    Direction::Connect => match ConnectArgs::decode(&mut xdr) {
                        Ok(args) => Request::Connect { xid, socket, args },
                        Err(_) => garbage,
                    },
                    Direction::Accept => Request::Accept { xid, socket },
                }
            }
            PROC_HANDLE_RECORD => match DelegationResult::decode(&mut xdr) {
                Ok(session) => Request::HandleRecord { xid, session },
                Err(_) => garbage,
            },
            PROC_DISCONNECT => match DelegationResult::decode(&mut xdr) {
                Ok(session) => Request::Disconnect { xid, session },
                Err(_) => garbage,
            },
            _ => Request::Error {
                xid,
                stat: AcceptStat::ProcUnavail,
            },
        }
    }

    async fn run(self, handler: &dyn HandshakeHandler) -> Option<Bytes> {
        let encoded = match self {
            Request::Ignored => return None,
            Request::Null { xid } => reply(xid, &()),
            Request::Connect { xid, socket, args } => {
                let res = match socket {
                    Some(socket) => handler.connect(socket, args.cert_hint).await,
                    None => no_socket_connect(),
                };
                reply(xid, &res)
            }
            Request::Accept { xid, socket } => {
                let res = match socket {
                    Some(socket) => handler.accept(socket).await,
                    None => no_socket_accept(),
                };
                reply(xid, &res)
            }
            Request::HandleRecord { xid, session } => {
                reply(xid, &handler.handle_record(session).await)
            }
            Request::Disconnect { xid, session } => reply(xid, &handler.disconnect(session).await),
            Request::Error { xid, stat } => encode_marked(|xdr| {
                RpcMsg::reply(xid, ReplyBody::accepted(stat)).encode(xdr)
            }),
        };
        match encoded {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode upcall reply");
                None
            }
        }
    }
}

fn check_program(call: &CallBody, direction: Direction) -> Option<AcceptStat> {
    if call.prog != direction.program() {
        return Some(AcceptStat::ProgUnavail);
    }
    if call.vers != UPCALL_VERSION {
        return Some(AcceptStat::ProgMismatch {
            low: UPCALL_VERSION,
            high: UPCALL_VERSION,
        });
    }
    None
}

fn reply<T: XdrEncode>(xid: u32, results: &T) -> Result<Bytes, FramingError> {
    encode_marked(|xdr| {
        RpcMsg::reply(xid, ReplyBody::success()).encode(xdr)?;
        results.encode(xdr)
    })
}
