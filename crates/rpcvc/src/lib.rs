//! rpcvc: record-marked RPC over stream sockets, with TLS handshakes
//! delegated to local daemons.
//!
//! Unix only: handshakes pass the connection's descriptor to the daemon over
//! a Unix socket.

#[cfg(not(unix))]
compile_error!("rpcvc requires a Unix platform");

pub mod client;
pub mod dispatch;
pub mod endpoint;
pub mod logging;
pub mod record;
pub mod rpc;
pub mod segment;
pub mod server;
pub mod tls;
pub mod upcall;
pub mod xdr;

pub use client::{CallOptions, ClientError, VcClient};
pub use dispatch::{ConnId, Dispatcher};
pub use endpoint::{PeerAddr, StreamEndpoint};
pub use record::{FramingError, RecordAssembler, RecordMarkCodec};
pub use server::{Reply, Request, Server, ServerConfig, ServerTransport, Service};
pub use tls::{DelegationResult, TlsError, TlsFlags, TlsRequirement, TlsState, start_tls};
pub use upcall::{Direction, UpcallChannel, UpcallConfig};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, carrying on with the inner value if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Mutex poisoned - continuing with inner state");
            poisoned.into_inner()
        }
    }
}
