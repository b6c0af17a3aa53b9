use std::sync::Arc;

use super::TlsError;
use crate::rpc::{AuthFlavor, AuthStat, CallBody, OpaqueAuth};
use crate::server::{Reply, ServerTransport};
use crate::upcall::UpcallChannel;

const NULLPROC: u32 = 0;

fn check_bootstrap(call: &CallBody) -> Result<(), TlsError> {
    if call.procedure != NULLPROC {
        return Err(TlsError::BadBootstrap("AUTH_TLS on a non-NULL procedure"));
    }
    if !call.cred.body.is_empty() {
        return Err(TlsError::BadBootstrap("AUTH_TLS credential has a body"));
    }
    if call.verf.flavor != AuthFlavor::NONE || !call.verf.body.is_empty() {
        return Err(TlsError::BadBootstrap("AUTH_TLS call carries a verifier"));
    }
    Ok(())
}

async fn deny(transport: &ServerTransport, xid: u32, stat: AuthStat) {
    let reply = Reply::auth_error(stat);
    if let Err(e) = transport.reply(xid, &reply).await {
        tracing::debug!(conn = %transport.id(), xid, error = %e, "Failed to send AUTH_TLS rejection");
    }
}

/// Answer an `AUTH_TLS` NULL call and run the accept-side handshake.
///
/// Malformed bootstrap calls, repeats on a secured connection, and calls
/// arriving while no daemon is configured are answered with an auth error
/// and leave the connection usable. Any failure after the acknowledgement has
/// been sent leaves delivery suspended; the caller destroys the connection.
pub(crate) async fn accept_tls(
    transport: &ServerTransport,
    channel: &Arc<UpcallChannel>,
    xid: u32,
    call: &CallBody,
) -> Result<(), TlsError> {
    if let Err(e) = check_bootstrap(call) {
        deny(transport, xid, AuthStat::BadCred).await;
        return Err(e);
    }
    if transport.tls_state().is_secured() {
        deny(transport, xid, AuthStat::BadCred).await;
        return Err(TlsError::BadBootstrap("connection is already secured"));
    }
    if !channel.is_configured() {
        deny(transport, xid, AuthStat::RejectedCred).await;
        return Err(TlsError::NoTlsSupport(channel.direction()));
    }

    // Nothing may be read off the stream once the peer starts its handshake.
    transport.suspend_delivery();
    transport.update_tls(|tls| tls.begin());

    let ack = Reply::with_verifier(OpaqueAuth::starttls_verifier());
    if let Err(e) = transport.reply(xid, &ack).await {
        transport.update_tls(|tls| tls.fail());
        return Err(TlsError::Acknowledge(e));
    }

    let result = match channel.begin_session(Arc::clone(transport.endpoint())).await {
        Ok(session) => session.accept().await,
        Err(e) => Err(e),
    };
    let res = match result {
        Ok(res) => res,
        Err(e) => {
            transport.update_tls(|tls| tls.fail());
            tracing::warn!(conn = %transport.id(), error = %e, "Accept-side handshake failed");
            return Err(e);
        }
    };

    transport.update_tls(|tls| tls.establish(res.session, res.flags, res.identity.clone()));
    transport.attach_upcalls(Arc::clone(channel));
    transport.resume_delivery();
    tracing::info!(
        conn = %transport.id(),
        flags = %res.flags,
        token = res.session.token,
        uid = ?res.identity.as_ref().map(|id| id.uid),
        "TLS established"
    );
    Ok(())
}
