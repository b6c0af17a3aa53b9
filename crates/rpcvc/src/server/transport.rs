//! Per-connection server transport.

use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use super::Reply;
use crate::dispatch::{ConnId, Dispatcher};
use crate::endpoint::{PeerAddr, StreamEndpoint};
use crate::record::{FramingError, RecordAssembler, RecordPoll, encode_marked};
use crate::rpc::{CallBody, MsgBody, RpcMsg};
use crate::segment::receive_buffer;
use crate::tls::{TlsError, TlsState};
use crate::upcall::{UpcallChannel, UpcallStatus};
use crate::xdr::{RecordXdr, XdrDecode, XdrEncode, XdrStream};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("malformed record: {0}")]
    Framing(#[from] FramingError),
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transport has been destroyed")]
    Dead,
}

/// A decoded call, arguments not yet consumed.
#[derive(Debug)]
pub struct Incoming {
    pub xid: u32,
    pub call: CallBody,
    pub args: RecordXdr,
}

#[derive(Debug)]
pub enum RecvStatus {
    Call(Incoming),
    /// Nothing complete yet; the transport has been marked inactive.
    WouldBlock,
}

#[derive(Debug)]
struct RecvState {
    assembler: RecordAssembler,
    dead: bool,
}

/// Server side of one accepted connection.
///
/// Receive state sits behind a short-lived lock that is never held across a
/// wait; replies are serialized by a separate write lock.
pub struct ServerTransport {
    id: ConnId,
    endpoint: Arc<dyn StreamEndpoint>,
    peer: Option<PeerAddr>,
    local: Option<PeerAddr>,
    dispatcher: Arc<Dispatcher>,
    recv: StdMutex<RecvState>,
    delivery: AtomicBool,
    tls: StdMutex<TlsState>,
    upcalls: StdMutex<Option<Arc<UpcallChannel>>>,
    write_lock: Mutex<()>,
    destroyed: AtomicBool,
}

impl ServerTransport {
    /// Wrap `endpoint` and register it with `dispatcher`, already active.
    pub fn new(
        endpoint: Arc<dyn StreamEndpoint>,
        dispatcher: Arc<Dispatcher>,
        max_record: usize,
    ) -> Arc<Self> {
        let id = ConnId::new();
        let peer = endpoint.peer_addr().ok();
        let local = endpoint.local_addr().ok();
        let transport = Arc::new(Self {
            id,
            endpoint,
            peer,
            local,
            dispatcher: Arc::clone(&dispatcher),
            recv: StdMutex::new(RecvState {
                assembler: RecordAssembler::with_max_record(max_record),
                dead: false,
            }),
            delivery: AtomicBool::new(true),
            tls: StdMutex::new(TlsState::default()),
            upcalls: StdMutex::new(None),
            write_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
        });
        dispatcher.register(id);
        // Bytes may already be waiting on a fresh connection.
        dispatcher.set_active(id, true);
        tracing::debug!(conn = %id, peer = ?transport.peer, "Transport created");
        transport
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<dyn StreamEndpoint> {
        &self.endpoint
    }

    pub fn peer_addr(&self) -> Option<&PeerAddr> {
        self.peer.as_ref()
    }

    pub fn local_addr(&self) -> Option<&PeerAddr> {
        self.local.as_ref()
    }

    pub fn is_dead(&self) -> bool {
        crate::lock(&self.recv).dead
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

    pub fn delivery_enabled(&self) -> bool {
        self.delivery.load(Ordering::Acquire)
    }

    /// Stop handing records to the dispatcher until resumed.
    pub fn suspend_delivery(&self) {
        self.delivery.store(false, Ordering::Release);
        self.dispatcher.set_active(self.id, false);
        tracing::trace!(conn = %self.id, "Delivery suspended");
    }

    /// Re-enable delivery and reactivate the connection.
    pub fn resume_delivery(&self) {
        self.delivery.store(true, Ordering::Release);
        self.dispatcher.set_active(self.id, true);
        tracing::trace!(conn = %self.id, "Delivery resumed");
    }

    /// Wait for the stream to become readable.
    pub async fn readable(&self) -> io::Result<()> {
        self.endpoint.readable().await
    }

    /// Receive entry point: assemble the next call without blocking.
    ///
    /// Any error is fatal: the assembler has been ended and buffered partial
    /// records are gone. The caller is expected to [`destroy`](Self::destroy).
    pub fn recv(&self) -> Result<RecvStatus, TransportError> {
        if !self.delivery_enabled() {
            // Stay parked even if something reactivated us mid-handshake.
            self.dispatcher.set_active(self.id, false);
            return Ok(RecvStatus::WouldBlock);
        }
        loop {
            let record = {
                let mut state = crate::lock(&self.recv);
                if state.dead {
                    return Err(TransportError::Dead);
                }
                match state.assembler.poll_record() {
                    Ok(RecordPoll::Complete(record)) => Some(record),
                    Ok(RecordPoll::WouldBlock) => None,
                    Err(e) => {
                        state.dead = true;
                        state.assembler.end();
                        tracing::debug!(conn = %self.id, error = %e, "Malformed record");
                        return Err(e.into());
                    }
                }
            };

            if let Some(record) = record {
                let mut args = RecordXdr::new(record);
                match RpcMsg::decode(&mut args) {
                    Ok(RpcMsg {
                        xid,
                        body: MsgBody::Call(call),
                    }) => {
                        tracing::trace!(conn = %self.id, xid, procedure = call.procedure, "Call received");
                        return Ok(RecvStatus::Call(Incoming { xid, call, args }));
                    }
                    Ok(RpcMsg { xid, .. }) => {
                        tracing::debug!(conn = %self.id, xid, "Ignoring reply on server connection");
                    }
                    Err(e) => {
                        tracing::debug!(conn = %self.id, error = %e, "Dropping undecodable call");
                    }
                }
                args.destroy();
                continue;
            }

            let mut buf = receive_buffer();
            match self.endpoint.try_read(&mut buf) {
                Ok(0) => {
                    self.kill();
                    tracing::debug!(conn = %self.id, "Peer closed connection");
                    return Err(TransportError::Closed);
                }
                Ok(n) => {
                    buf.truncate(n);
                    crate::lock(&self.recv).assembler.push(buf.freeze());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.dispatcher.set_active(self.id, false);
                    return Ok(RecvStatus::WouldBlock);
                }
                Err(e) => {
                    self.kill();
                    return Err(e.into());
                }
            }
        }
    }

    fn kill(&self) {
        let mut state = crate::lock(&self.recv);
        state.dead = true;
        state.assembler.end();
    }

    /// Send `reply` to call `xid` as one final fragment.
    ///
    /// A failed write is returned but leaves the transport alive; only a
    /// failed read kills it.
    pub async fn reply(&self, xid: u32, reply: &Reply) -> Result<(), TransportError> {
        let msg = RpcMsg::reply(xid, reply.body.clone());
        let bytes = encode_marked(|xdr| {
            msg.encode(xdr)?;
            xdr.put_bytes(&reply.results)
        })?;
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.endpoint.write_all(&bytes).await {
            tracing::debug!(conn = %self.id, xid, error = %e, "Reply write failed");
            return Err(e.into());
        }
        tracing::trace!(conn = %self.id, xid, len = bytes.len(), "Reply sent");
        Ok(())
    }

    /// Tell the daemon a non-application TLS record arrived on this connection.
    pub async fn handle_nonapplication_record(&self) -> Result<UpcallStatus, TlsError> {
        let session = self.tls_state().session.ok_or(TlsError::NotSecured)?;
        let channel = crate::lock(&self.upcalls).clone().ok_or(TlsError::NotSecured)?;
        channel.handle_record(session).await
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Unregisters from the dispatcher, drops buffered input, releases the
    /// daemon session if TLS was established, and closes the stream.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.unregister(self.id);
        self.kill();

        let session = crate::lock(&self.tls).session.take();
        let channel = crate::lock(&self.upcalls).take();
        if let (Some(session), Some(channel)) = (session, channel)
            && let Err(e) = channel.disconnect(session).await
        {
            tracing::warn!(conn = %self.id, error = %e, "Disconnect upcall failed");
        }

        if let Err(e) = self.endpoint.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(conn = %self.id, error = %e, "Shutdown failed");
        }
        tracing::debug!(conn = %self.id, "Transport destroyed");
    }
}

impl std::fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}
