//! TLS handshake delegation.
//!
//! Neither side performs the handshake itself. After the plaintext STARTTLS
//! exchange the connection's socket is handed to a companion daemon over the
//! upcall channel; the daemon runs the handshake on the shared socket and
//! returns a [`DelegationResult`] that stays on the connection until teardown.
//!
//! - **connect**: [`start_tls`] on a [`VcClient`](crate::client::VcClient)
//! - **accept**: run by the server when a call arrives with `AUTH_TLS`

mod accept;
mod connect;

pub(crate) use accept::accept_tls;
pub use connect::start_tls;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::ClientError;
use crate::server::TransportError;
use crate::upcall::{Direction, UpcallStatus};

/// Handshake outcome flags reported by the accept-side daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TlsFlags(u32);

impl TlsFlags {
    pub const HANDSHAKE: TlsFlags = TlsFlags(0x01);
    pub const GOT_CERT: TlsFlags = TlsFlags(0x02);
    pub const SELF_SIGNED: TlsFlags = TlsFlags(0x04);
    pub const VERIFIED: TlsFlags = TlsFlags(0x08);
    pub const DISABLED: TlsFlags = TlsFlags(0x10);
    pub const CERT_USER: TlsFlags = TlsFlags(0x20);
    pub const HANDSHAKE_FAILED: TlsFlags = TlsFlags(0x40);

    pub const fn empty() -> Self {
        TlsFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        TlsFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: TlsFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TlsFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: TlsFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for TlsFlags {
    type Output = TlsFlags;

    fn bitor(self, rhs: TlsFlags) -> TlsFlags {
        TlsFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TlsFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// What the daemon hands back for an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DelegationResult {
    pub sec: u64,
    pub usec: u64,
    /// Daemon-side session handle; opaque to this crate.
    pub token: u64,
}

impl DelegationResult {
    /// When the daemon established the session.
    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.sec).ok()?;
        let nanos = u32::try_from(self.usec.checked_mul(1000)?).ok()?;
        DateTime::from_timestamp(secs, nanos)
    }
}

/// Caller identity derived from the peer certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedIdentity {
    pub uid: u32,
    pub gids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsPhase {
    #[default]
    Plaintext,
    HandshakeInProgress,
    Secured,
}

/// Per-connection TLS state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TlsState {
    pub phase: TlsPhase,
    pub flags: TlsFlags,
    pub session: Option<DelegationResult>,
    pub identity: Option<MappedIdentity>,
}

impl TlsState {
    pub fn is_secured(&self) -> bool {
        self.phase == TlsPhase::Secured
    }

    pub(crate) fn begin(&mut self) {
        self.phase = TlsPhase::HandshakeInProgress;
    }

    pub(crate) fn establish(
        &mut self,
        session: DelegationResult,
        flags: TlsFlags,
        identity: Option<MappedIdentity>,
    ) {
        self.phase = TlsPhase::Secured;
        self.flags = flags | TlsFlags::HANDSHAKE;
        self.session = Some(session);
        self.identity = identity;
    }

    /// Handshake did not complete: back to plaintext, failure remembered.
    pub(crate) fn fail(&mut self) {
        self.phase = TlsPhase::Plaintext;
        self.flags.insert(TlsFlags::HANDSHAKE_FAILED);
        self.session = None;
        self.identity = None;
    }

    /// Whether this connection meets `requirement`.
    pub fn satisfies(&self, requirement: TlsRequirement) -> bool {
        match requirement {
            TlsRequirement::None => true,
            TlsRequirement::Tls => self.is_secured(),
            TlsRequirement::Certificate => {
                self.is_secured() && self.flags.contains(TlsFlags::VERIFIED)
            }
            TlsRequirement::CertificateUser => {
                self.is_secured()
                    && self.flags.contains(TlsFlags::CERT_USER)
                    && self.identity.is_some()
            }
        }
    }
}

/// Minimum protection a server demands before running non-NULL procedures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsRequirement {
    #[default]
    None,
    /// Any completed handshake.
    Tls,
    /// Handshake with a verified client certificate.
    Certificate,
    /// Verified certificate that maps to a local user.
    CertificateUser,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("no TLS support: {0} upcall channel is not configured")]
    NoTlsSupport(Direction),
    #[error("TLS bootstrap call failed: {0}")]
    Bootstrap(#[source] ClientError),
    #[error("peer did not acknowledge STARTTLS")]
    NotAcknowledged,
    #[error("malformed TLS bootstrap call: {0}")]
    BadBootstrap(&'static str),
    #[error("handshake daemon unreachable: {0}")]
    DaemonUnavailable(#[source] ClientError),
    #[error("handshake daemon did not answer within {0:?}")]
    DaemonTimeout(Duration),
    #[error("handshake rejected by daemon: {0}")]
    Rejected(UpcallStatus),
    #[error("connection is not secured")]
    NotSecured,
    #[error("failed to acknowledge STARTTLS: {0}")]
    Acknowledge(#[source] TransportError),
}
