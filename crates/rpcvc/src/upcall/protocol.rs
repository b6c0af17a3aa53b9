//! Local RPC protocol spoken with the handshake daemons.
//!
//! One program per direction, both at version 1. Every procedure returns a
//! status word first; session-bearing results follow it.

use std::fmt;

use serde::Serialize;

use crate::tls::{DelegationResult, MappedIdentity, TlsFlags};
use crate::xdr::{XdrDecode, XdrEncode, XdrError, XdrStream};

pub const CONNECT_PROGRAM: u32 = 0x4067_7374;
pub const ACCEPT_PROGRAM: u32 = 0x4067_7375;
pub const UPCALL_VERSION: u32 = 1;

pub const PROC_NULL: u32 = 0;
/// `CONNECT` on the connect program, `ACCEPT` on the accept program.
pub const PROC_HANDSHAKE: u32 = 1;
pub const PROC_HANDLE_RECORD: u32 = 2;
pub const PROC_DISCONNECT: u32 = 3;

/// Longest certificate-name hint sent with a connect upcall.
pub const MAX_CERT_HINT: usize = 1024;
/// Most supplementary groups a mapped identity may carry.
pub const MAX_GIDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpcallStatus {
    Ok,
    /// Session ended but the daemon did not close the socket.
    NoClose,
    NoTls,
    NoSocket,
}

impl UpcallStatus {
    pub fn code(self) -> u32 {
        match self {
            UpcallStatus::Ok => 0,
            UpcallStatus::NoClose => 1,
            UpcallStatus::NoTls => 2,
            UpcallStatus::NoSocket => 3,
        }
    }
}

impl fmt::Display for UpcallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpcallStatus::Ok => "ok",
            UpcallStatus::NoClose => "no_close",
            UpcallStatus::NoTls => "no_tls",
            UpcallStatus::NoSocket => "no_socket",
        };
        f.write_str(name)
    }
}

impl XdrEncode for UpcallStatus {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_u32(self.code())
    }
}

impl XdrDecode for UpcallStatus {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        match xdr.get_u32()? {
            0 => Ok(UpcallStatus::Ok),
            1 => Ok(UpcallStatus::NoClose),
            2 => Ok(UpcallStatus::NoTls),
            3 => Ok(UpcallStatus::NoSocket),
            value => Err(XdrError::InvalidDiscriminant {
                what: "upcall status",
                value,
            }),
        }
    }
}

/// Session triple, as sent with `HANDLE_RECORD` and `DISCONNECT`.
impl XdrEncode for DelegationResult {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_u64(self.sec)?;
        xdr.put_u64(self.usec)?;
        xdr.put_u64(self.token)
    }
}

impl XdrDecode for DelegationResult {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        Ok(DelegationResult {
            sec: xdr.get_u64()?,
            usec: xdr.get_u64()?,
            token: xdr.get_u64()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectArgs {
    /// Expected peer certificate name; empty for none.
    pub cert_hint: Option<String>,
}

impl XdrEncode for ConnectArgs {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_string(self.cert_hint.as_deref().unwrap_or(""), MAX_CERT_HINT)
    }
}

impl XdrDecode for ConnectArgs {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        let hint = xdr.get_string(MAX_CERT_HINT)?;
        Ok(ConnectArgs {
            cert_hint: (!hint.is_empty()).then_some(hint),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRes {
    pub status: UpcallStatus,
    pub session: DelegationResult,
}

impl XdrEncode for ConnectRes {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        self.status.encode(xdr)?;
        self.session.encode(xdr)
    }
}

impl XdrDecode for ConnectRes {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        Ok(ConnectRes {
            status: UpcallStatus::decode(xdr)?,
            session: DelegationResult::decode(xdr)?,
        })
    }
}

/// Accept result. The identity words are always on the wire and only
/// meaningful when `flags` carries `CERT_USER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptRes {
    pub status: UpcallStatus,
    pub flags: TlsFlags,
    pub session: DelegationResult,
    pub identity: Option<MappedIdentity>,
}

impl XdrEncode for AcceptRes {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        self.status.encode(xdr)?;
        xdr.put_u32(self.flags.bits())?;
        self.session.encode(xdr)?;
        let (uid, gids) = match &self.identity {
            Some(id) => (id.uid, id.gids.as_slice()),
            None => (0, &[][..]),
        };
        if gids.len() > MAX_GIDS {
            return Err(XdrError::TooLong {
                len: gids.len(),
                max: MAX_GIDS,
            });
        }
        xdr.put_u32(uid)?;
        xdr.put_u32(gids.len() as u32)?;
        for gid in gids {
            xdr.put_u32(*gid)?;
        }
        Ok(())
    }
}

impl XdrDecode for AcceptRes {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        let status = UpcallStatus::decode(xdr)?;
        let flags = TlsFlags::from_bits(xdr.get_u32()?);
        let session = DelegationResult::decode(xdr)?;
        let uid = xdr.get_u32()?;
        let ngids = xdr.get_u32()? as usize;
        if ngids > MAX_GIDS {
            return Err(XdrError::TooLong {
                len: ngids,
                max: MAX_GIDS,
            });
        }
        let mut gids = Vec::with_capacity(ngids);
        for _ in 0..ngids {
            gids.push(xdr.get_u32()?);
        }
        let identity = flags
            .contains(TlsFlags::CERT_USER)
            .then_some(MappedIdentity { uid, gids });
        Ok(AcceptRes {
            status,
            flags,
            session,
            identity,
        })
    }
}
