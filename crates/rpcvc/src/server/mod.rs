//! Connection-oriented RPC server.
//!
//! [`Server::serve`] runs the accept loop on a [`Rendezvous`] and spawns one
//! driver task per connection. A driver reads while its registration is
//! active and waits for readiness or reactivation otherwise. Calls on one
//! connection are handled in arrival order.

mod rendezvous;
mod transport;

pub use rendezvous::{AcceptOutcome, Listener, Rendezvous};
pub use transport::{Incoming, RecvStatus, ServerTransport, TransportError};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::dispatch::{ConnId, Dispatcher};
use crate::endpoint::PeerAddr;
use crate::record::DEFAULT_MAX_RECORD;
use crate::rpc::{
    AcceptStat, AuthFlavor, AuthStat, CallBody, OpaqueAuth, RPC_MSG_VERSION, RejectStat,
    ReplyBody,
};
use crate::tls::{self, TlsError, TlsRequirement, TlsState};
use crate::upcall::{Direction, UpcallChannel};
use crate::xdr::{RecordXdr, XdrDecode, XdrEncode, XdrError, to_bytes};

const NULLPROC: u32 = 0;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest record accepted before the connection is dropped.
    pub max_record: usize,
    /// Protection required before non-NULL procedures run.
    pub tls_requirement: TlsRequirement,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_record: DEFAULT_MAX_RECORD,
            tls_requirement: TlsRequirement::None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `RPCVC_MAX_RECORD`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("RPCVC_MAX_RECORD") {
            match raw.parse::<usize>() {
                Ok(max) if max > 0 => config.max_record = max,
                _ => tracing::warn!(value = %raw, "Ignoring invalid RPCVC_MAX_RECORD"),
            }
        }
        config
    }

    pub fn with_max_record(mut self, max_record: usize) -> Self {
        self.max_record = max_record;
        self
    }

    pub fn with_tls_requirement(mut self, requirement: TlsRequirement) -> Self {
        self.tls_requirement = requirement;
        self
    }
}

/// A call handed to a [`Service`].
#[derive(Debug)]
pub struct Request {
    pub xid: u32,
    pub prog: u32,
    pub vers: u32,
    pub procedure: u32,
    pub cred: OpaqueAuth,
    /// Undecoded arguments.
    pub args: RecordXdr,
    pub conn: ConnId,
    pub peer: Option<PeerAddr>,
    pub tls: TlsState,
}

impl Request {
    pub fn decode_args<T: XdrDecode>(&mut self) -> Result<T, XdrError> {
        T::decode(&mut self.args)
    }
}

/// Reply header plus already-encoded results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub body: ReplyBody,
    pub results: Bytes,
}

impl Reply {
    pub fn success<T: XdrEncode + ?Sized>(results: &T) -> Result<Self, XdrError> {
        Ok(Self {
            body: ReplyBody::success(),
            results: to_bytes(results)?,
        })
    }

    /// Success with no results.
    pub fn empty() -> Self {
        Self {
            body: ReplyBody::success(),
            results: Bytes::new(),
        }
    }

    /// Success with a non-default verifier and no results.
    pub fn with_verifier(verf: OpaqueAuth) -> Self {
        Self {
            body: ReplyBody::Accepted {
                verf,
                stat: AcceptStat::Success,
            },
            results: Bytes::new(),
        }
    }

    pub fn error(stat: AcceptStat) -> Self {
        Self {
            body: ReplyBody::accepted(stat),
            results: Bytes::new(),
        }
    }

    pub fn denied(reject: RejectStat) -> Self {
        Self {
            body: ReplyBody::Denied(reject),
            results: Bytes::new(),
        }
    }

    pub fn auth_error(stat: AuthStat) -> Self {
        Self::denied(RejectStat::AuthError(stat))
    }
}

/// Application handler for calls.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Handle one call. `None` sends no reply.
    async fn call(&self, request: Request) -> Option<Reply>;
}

pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    service: Arc<dyn Service>,
    upcalls: Arc<UpcallChannel>,
}

impl Server {
    /// `upcalls` must be an accept-direction channel; it may be unconfigured.
    pub fn new(service: Arc<dyn Service>, upcalls: Arc<UpcallChannel>) -> Self {
        debug_assert_eq!(upcalls.direction(), Direction::Accept);
        Self {
            config: ServerConfig::default(),
            dispatcher: Arc::new(Dispatcher::new()),
            service,
            upcalls,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn upcalls(&self) -> &Arc<UpcallChannel> {
        &self.upcalls
    }

    /// Bind a TCP rendezvous sharing this server's dispatcher and limits.
    pub fn bind_tcp(
        &self,
        addr: std::net::SocketAddr,
    ) -> std::io::Result<Rendezvous<std::net::TcpListener>> {
        Rendezvous::bind_tcp(addr, Arc::clone(&self.dispatcher), self.config.max_record)
    }

    pub fn bind_unix(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> std::io::Result<Rendezvous<std::os::unix::net::UnixListener>> {
        Rendezvous::bind_unix(path, Arc::clone(&self.dispatcher), self.config.max_record)
    }

    /// Accept connections forever, one driver task per connection.
    ///
    /// A failed accept parks the loop until the rendezvous is re-armed.
    pub async fn serve<L: Listener>(self: Arc<Self>, rendezvous: Arc<Rendezvous<L>>) {
        tracing::info!(addr = ?rendezvous.local_addr().ok(), "Serving RPC");
        loop {
            match rendezvous.accept().await {
                AcceptOutcome::Accepted(transport) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(server.drive(transport));
                }
                AcceptOutcome::WouldBlock => {}
                AcceptOutcome::Failed(e) => {
                    tracing::error!(error = %e, "Rendezvous stopped accepting");
                }
            }
        }
    }

    /// Run one connection until it dies.
    pub async fn drive(self: Arc<Self>, transport: Arc<ServerTransport>) {
        let id = transport.id();
        let Some(registration) = self.dispatcher.registration(id) else {
            tracing::debug!(conn = %id, "Driving unregistered transport");
            return;
        };

        loop {
            if registration.is_removed() {
                break;
            }
            if !registration.is_active() {
                if !transport.delivery_enabled() {
                    registration.activated().await;
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = registration.activated() => {}
                    ready = transport.readable() => {
                        if let Err(e) = ready {
                            tracing::debug!(conn = %id, error = %e, "Readiness wait failed");
                            transport.destroy().await;
                            break;
                        }
                        self.dispatcher.set_active(id, true);
                    }
                }
                continue;
            }

            match transport.recv() {
                Ok(RecvStatus::Call(incoming)) => self.handle(&transport, incoming).await,
                Ok(RecvStatus::WouldBlock) => {}
                Err(e) => {
                    tracing::debug!(conn = %id, error = %e, "Connection ended");
                    transport.destroy().await;
                    break;
                }
            }
        }
    }

    async fn handle(&self, transport: &Arc<ServerTransport>, incoming: Incoming) {
        let Incoming { xid, call, args } = incoming;

        if call.rpcvers != RPC_MSG_VERSION {
            let reply = Reply::denied(RejectStat::RpcMismatch {
                low: RPC_MSG_VERSION,
                high: RPC_MSG_VERSION,
            });
            self.send(transport, xid, &reply).await;
            return;
        }

        if call.cred.flavor == AuthFlavor::TLS {
            self.start_tls(transport, xid, &call).await;
            return;
        }

        if call.procedure != NULLPROC
            && !transport.tls_state().satisfies(self.config.tls_requirement)
        {
            tracing::debug!(
                conn = %transport.id(),
                xid,
                requirement = ?self.config.tls_requirement,
                "Refusing call on insufficiently protected connection"
            );
            self.send(transport, xid, &Reply::auth_error(AuthStat::TooWeak))
                .await;
            return;
        }

        let request = Request {
            xid,
            prog: call.prog,
            vers: call.vers,
            procedure: call.procedure,
            cred: call.cred,
            args,
            conn: transport.id(),
            peer: transport.peer_addr().cloned(),
            tls: transport.tls_state(),
        };
        if let Some(reply) = self.service.call(request).await {
            self.send(transport, xid, &reply).await;
        }
    }

    async fn start_tls(&self, transport: &Arc<ServerTransport>, xid: u32, call: &CallBody) {
        match tls::accept_tls(transport, &self.upcalls, xid, call).await {
            Ok(()) => {}
            // Answered with an auth error; the connection carries on.
            Err(e @ (TlsError::BadBootstrap(_) | TlsError::NoTlsSupport(_))) => {
                tracing::debug!(conn = %transport.id(), error = %e, "STARTTLS refused");
            }
            Err(e) => {
                tracing::warn!(conn = %transport.id(), error = %e, "Dropping connection after failed STARTTLS");
                transport.destroy().await;
            }
        }
    }

    async fn send(&self, transport: &ServerTransport, xid: u32, reply: &Reply) {
        if let Err(e) = transport.reply(xid, reply).await {
            tracing::debug!(conn = %transport.id(), xid, error = %e, "Reply not sent");
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("connections", &self.dispatcher.len())
            .field("upcalls", &self.upcalls)
            .finish_non_exhaustive()
    }
}
