//! Record-marked RPC client over a stream endpoint.
//!
//! Calls are serialized: the client state (assembler and xid counter) sits
//! behind a `tokio::sync::Mutex`, and a caller holding that guard is the only
//! reader of the stream. TLS start-up relies on this to keep the stream quiet
//! while a daemon runs the handshake on it.

use std::io;
use std::net::Shutdown;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};

use crate::endpoint::{PeerAddr, StreamEndpoint};
use crate::record::{DEFAULT_MAX_RECORD, FramingError, RecordAssembler, RecordPoll, encode_marked};
use crate::rpc::{
    AcceptStat, CallBody, MsgBody, OpaqueAuth, RejectStat, ReplyBody, RpcMsg,
};
use crate::segment::receive_buffer;
use crate::tls::{TlsError, TlsState};
use crate::upcall::{UpcallChannel, UpcallStatus};
use crate::xdr::{RecordXdr, XdrDecode, XdrEncode, XdrError};

/// Per-call limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Bound on each attempt.
    pub timeout: Duration,
    /// Attempts before giving up; the request is resent on the same stream.
    pub tries: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            tries: 1,
        }
    }
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("encoding error: {0}")]
    Xdr(#[from] XdrError),
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
    #[error("call accepted but not executed: {0:?}")]
    Accepted(AcceptStat),
    #[error("call denied: {0:?}")]
    Denied(RejectStat),
}

/// Mutable client state, owned by whoever holds the call lock.
#[derive(Debug)]
pub struct ClientState {
    assembler: RecordAssembler,
    next_xid: u32,
}

pub type ClientGuard<'a> = MutexGuard<'a, ClientState>;

/// A successful reply: its verifier and the undecoded results.
#[derive(Debug)]
pub struct Reply {
    pub verf: OpaqueAuth,
    pub results: RecordXdr,
}

pub struct VcClient {
    endpoint: Arc<dyn StreamEndpoint>,
    prog: u32,
    vers: u32,
    options: CallOptions,
    state: Mutex<ClientState>,
    tls: StdMutex<TlsState>,
    /// Channel holding the daemon-side session, once TLS is up.
    upcalls: StdMutex<Option<Arc<UpcallChannel>>>,
    closed: AtomicBool,
}

impl VcClient {
    pub fn new(endpoint: Arc<dyn StreamEndpoint>, prog: u32, vers: u32) -> Self {
        // Start xids somewhere unpredictable so a reconnecting client does
        // not match replies meant for its previous incarnation.
        let next_xid = uuid::Uuid::new_v4().as_u128() as u32;
        Self {
            endpoint,
            prog,
            vers,
            options: CallOptions::default(),
            state: Mutex::new(ClientState {
                assembler: RecordAssembler::with_max_record(DEFAULT_MAX_RECORD),
                next_xid,
            }),
            tls: StdMutex::new(TlsState::default()),
            upcalls: StdMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn connect_tcp(
        addr: std::net::SocketAddr,
        prog: u32,
        vers: u32,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(Arc::new(stream), prog, vers))
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_record(self, max_record: usize) -> Self {
        if let Ok(mut state) = self.state.try_lock() {
            state.assembler = RecordAssembler::with_max_record(max_record);
        }
        self
    }

    pub fn options(&self) -> CallOptions {
        self.options
    }

    pub fn endpoint(&self) -> &Arc<dyn StreamEndpoint> {
        &self.endpoint
    }

    pub fn peer_addr(&self) -> io::Result<PeerAddr> {
        self.endpoint.peer_addr()
    }

    pub fn tls_state(&self) -> TlsState {
        crate::lock(&self.tls).clone()
    }

    pub(crate) fn update_tls(&self, f: impl FnOnce(&mut TlsState)) {
        f(&mut crate::lock(&self.tls));
    }

    pub(crate) fn attach_upcalls(&self, channel: Arc<UpcallChannel>) {
        *crate::lock(&self.upcalls) = Some(channel);
    }

    /// Take the call lock. While held no other caller reads the stream.
    pub async fn lock(&self) -> ClientGuard<'_> {
        self.state.lock().await
    }

    /// Call `procedure` with `AUTH_NONE` and decode its results.
    pub async fn call<A, R>(&self, procedure: u32, args: &A) -> Result<R, ClientError>
    where
        A: XdrEncode + Sync + ?Sized,
        R: XdrDecode,
    {
        let mut guard = self.lock().await;
        let mut reply = self
            .call_with(&mut guard, procedure, OpaqueAuth::none(), args, None)
            .await?;
        Ok(R::decode(&mut reply.results)?)
    }

    /// Like [`call`](Self::call) but attaches `fd` to the request.
    pub async fn call_with_fd<A, R>(
        &self,
        procedure: u32,
        args: &A,
        fd: BorrowedFd<'_>,
    ) -> Result<R, ClientError>
    where
        A: XdrEncode + Sync + ?Sized,
        R: XdrDecode,
    {
        let mut guard = self.lock().await;
        let mut reply = self
            .call_with(&mut guard, procedure, OpaqueAuth::none(), args, Some(fd))
            .await?;
        Ok(R::decode(&mut reply.results)?)
    }

    /// One call under an already-held lock, with an explicit credential.
    pub async fn call_with<A>(
        &self,
        state: &mut ClientState,
        procedure: u32,
        cred: OpaqueAuth,
        args: &A,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<Reply, ClientError>
    where
        A: XdrEncode + Sync + ?Sized,
    {
        let xid = state.next_xid;
        state.next_xid = state.next_xid.wrapping_add(1);

        let call = RpcMsg::call(xid, CallBody::new(self.prog, self.vers, procedure, cred));
        let request = encode_marked(|xdr| {
            call.encode(xdr)?;
            args.encode(xdr)
        })?;

        let tries = self.options.tries.max(1);
        for attempt in 1..=tries {
            match (attempt, fd) {
                (1, Some(fd)) => self.endpoint.write_all_with_fd(&request, fd).await?,
                _ => self.endpoint.write_all(&request).await?,
            }
            tracing::trace!(xid, procedure, attempt, "Sent call");

            match tokio::time::timeout(self.options.timeout, self.recv_reply(state, xid)).await {
                Ok(result) => return result,
                Err(_) => {
                    tracing::debug!(
                        xid,
                        procedure,
                        attempt,
                        tries,
                        timeout = ?self.options.timeout,
                        "Call timed out"
                    );
                }
            }
        }
        Err(ClientError::TimedOut(self.options.timeout))
    }

    async fn recv_reply(&self, state: &mut ClientState, xid: u32) -> Result<Reply, ClientError> {
        loop {
            if let RecordPoll::Complete(record) = state.assembler.poll_record()? {
                let mut xdr = RecordXdr::new(record);
                let msg = match RpcMsg::decode(&mut xdr) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::debug!(error = %e, "Discarding undecodable record");
                        continue;
                    }
                };
                if msg.xid != xid {
                    tracing::debug!(xid = msg.xid, expected = xid, "Discarding stale reply");
                    continue;
                }
                match msg.body {
                    MsgBody::Reply(ReplyBody::Accepted {
                        verf,
                        stat: AcceptStat::Success,
                    }) => return Ok(Reply { verf, results: xdr }),
                    MsgBody::Reply(ReplyBody::Accepted { stat, .. }) => {
                        return Err(ClientError::Accepted(stat));
                    }
                    MsgBody::Reply(ReplyBody::Denied(reject)) => {
                        return Err(ClientError::Denied(reject));
                    }
                    MsgBody::Call(_) => {
                        tracing::debug!(xid, "Ignoring call on client connection");
                        continue;
                    }
                }
            }
            self.fill(state).await?;
        }
    }

    /// Wait for input and queue one read's worth of it.
    async fn fill(&self, state: &mut ClientState) -> Result<(), ClientError> {
        self.endpoint.readable().await?;
        let mut buf = receive_buffer();
        match self.endpoint.try_read(&mut buf) {
            Ok(0) => {
                state.assembler.end();
                Err(ClientError::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                state.assembler.push(buf.freeze());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                state.assembler.end();
                Err(e.into())
            }
        }
    }

    /// Tell the daemon a non-application TLS record arrived on this connection.
    pub async fn handle_nonapplication_record(&self) -> Result<UpcallStatus, TlsError> {
        let session = self.tls_state().session.ok_or(TlsError::NotSecured)?;
        let channel = crate::lock(&self.upcalls).clone().ok_or(TlsError::NotSecured)?;
        channel.handle_record(session).await
    }

    /// Release the daemon session (if any) and close the stream. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = crate::lock(&self.tls).session.take();
        let channel = crate::lock(&self.upcalls).take();
        if let (Some(session), Some(channel)) = (session, channel)
            && let Err(e) = channel.disconnect(session).await
        {
            tracing::warn!(error = %e, token = session.token, "Disconnect upcall failed");
        }
        if let Err(e) = self.endpoint.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(error = %e, "Shutdown on close failed");
        }
    }
}

impl Drop for VcClient {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let session = crate::lock(&self.tls).session.take();
        let channel = crate::lock(&self.upcalls).take();
        let (Some(session), Some(channel)) = (session, channel) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.disconnect(session).await {
                        tracing::warn!(error = %e, token = session.token, "Disconnect upcall failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(token = session.token, "Dropped TLS client outside a runtime; daemon session leaked");
            }
        }
    }
}

impl std::fmt::Debug for VcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcClient")
            .field("prog", &self.prog)
            .field("vers", &self.vers)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
