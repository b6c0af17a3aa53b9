use std::sync::Arc;

use super::{DelegationResult, TlsError, TlsFlags};
use crate::client::VcClient;
use crate::rpc::OpaqueAuth;
use crate::upcall::UpcallChannel;

const NULLPROC: u32 = 0;

/// Upgrade `client`'s connection to TLS.
///
/// Sends the `AUTH_TLS` NULL call, checks for the STARTTLS verifier, then
/// hands the socket to the connect-side daemon. The call lock is held
/// throughout, so no reply is read off the stream while the daemon owns it.
///
/// Returns `NoTlsSupport` before touching the connection if `channel` is not
/// configured.
pub async fn start_tls(
    client: &VcClient,
    channel: &Arc<UpcallChannel>,
    cert_hint: Option<String>,
) -> Result<DelegationResult, TlsError> {
    if !channel.is_configured() {
        return Err(TlsError::NoTlsSupport(channel.direction()));
    }

    let mut guard = client.lock().await;
    let reply = client
        .call_with(&mut guard, NULLPROC, OpaqueAuth::tls(), &(), None)
        .await
        .map_err(TlsError::Bootstrap)?;
    if !reply.verf.is_starttls_verifier() {
        tracing::info!(verf = %reply.verf.flavor, "Server did not acknowledge STARTTLS");
        return Err(TlsError::NotAcknowledged);
    }

    client.update_tls(|tls| tls.begin());
    let result = match channel.begin_session(Arc::clone(client.endpoint())).await {
        Ok(session) => session.connect(cert_hint).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(session) => {
            client.update_tls(|tls| tls.establish(session, TlsFlags::HANDSHAKE, None));
            client.attach_upcalls(Arc::clone(channel));
            tracing::info!(
                token = session.token,
                established = ?session.established_at(),
                "TLS established"
            );
            drop(guard);
            Ok(session)
        }
        Err(e) => {
            client.update_tls(|tls| tls.fail());
            tracing::warn!(error = %e, "TLS handshake failed");
            Err(e)
        }
    }
}
