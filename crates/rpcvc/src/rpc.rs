//! RPC message envelope (RFC 5531).
//!
//! Only the header is modelled here. Decoding an [`RpcMsg`] leaves the stream
//! positioned at the procedure arguments (calls) or results (successful
//! replies), which the caller decodes with its own types.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::xdr::{XdrDecode, XdrEncode, XdrError, XdrStream};

/// RPC protocol version carried in every call.
pub const RPC_MSG_VERSION: u32 = 2;

/// Upper bound on a credential or verifier body.
pub const MAX_AUTH_BYTES: usize = 400;

/// Verifier body of a STARTTLS acknowledgement.
pub const STARTTLS_VERIFIER: &[u8] = b"STARTTLS";

/// Authentication flavor number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AuthFlavor(pub u32);

impl AuthFlavor {
    pub const NONE: AuthFlavor = AuthFlavor(0);
    pub const SYS: AuthFlavor = AuthFlavor(1);
    pub const SHORT: AuthFlavor = AuthFlavor(2);
    pub const DH: AuthFlavor = AuthFlavor(3);
    pub const RPCSEC_GSS: AuthFlavor = AuthFlavor(6);
    /// TLS bootstrap (RFC 9289).
    pub const TLS: AuthFlavor = AuthFlavor(7);
}

impl fmt::Display for AuthFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AuthFlavor::NONE => f.write_str("AUTH_NONE"),
            AuthFlavor::SYS => f.write_str("AUTH_SYS"),
            AuthFlavor::SHORT => f.write_str("AUTH_SHORT"),
            AuthFlavor::DH => f.write_str("AUTH_DH"),
            AuthFlavor::RPCSEC_GSS => f.write_str("RPCSEC_GSS"),
            AuthFlavor::TLS => f.write_str("AUTH_TLS"),
            AuthFlavor(other) => write!(f, "flavor({other})"),
        }
    }
}

/// Credential or verifier: a flavor plus up to [`MAX_AUTH_BYTES`] of body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: AuthFlavor,
    pub body: Bytes,
}

impl OpaqueAuth {
    pub fn none() -> Self {
        Self {
            flavor: AuthFlavor::NONE,
            body: Bytes::new(),
        }
    }

    /// Credential of a TLS bootstrap call.
    pub fn tls() -> Self {
        Self {
            flavor: AuthFlavor::TLS,
            body: Bytes::new(),
        }
    }

    /// Verifier a server returns when it accepts a TLS bootstrap call.
    pub fn starttls_verifier() -> Self {
        Self {
            flavor: AuthFlavor::NONE,
            body: Bytes::from_static(STARTTLS_VERIFIER),
        }
    }

    pub fn is_starttls_verifier(&self) -> bool {
        self.flavor == AuthFlavor::NONE && &self.body[..] == STARTTLS_VERIFIER
    }
}

impl XdrEncode for OpaqueAuth {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_u32(self.flavor.0)?;
        xdr.put_opaque(&self.body, MAX_AUTH_BYTES)
    }
}

impl XdrDecode for OpaqueAuth {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        Ok(Self {
            flavor: AuthFlavor(xdr.get_u32()?),
            body: xdr.get_opaque(MAX_AUTH_BYTES)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallBody {
    pub rpcvers: u32,
    pub prog: u32,
    pub vers: u32,
    pub procedure: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

impl CallBody {
    /// A version-2 call with the given credential and an empty verifier.
    pub fn new(prog: u32, vers: u32, procedure: u32, cred: OpaqueAuth) -> Self {
        Self {
            rpcvers: RPC_MSG_VERSION,
            prog,
            vers,
            procedure,
            cred,
            verf: OpaqueAuth::none(),
        }
    }
}

/// Why an accepted call did not produce results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStat {
    Ok,
    BadCred,
    RejectedCred,
    BadVerf,
    RejectedVerf,
    TooWeak,
    InvalidResp,
    Failed,
}

impl AuthStat {
    fn code(self) -> u32 {
        match self {
            AuthStat::Ok => 0,
            AuthStat::BadCred => 1,
            AuthStat::RejectedCred => 2,
            AuthStat::BadVerf => 3,
            AuthStat::RejectedVerf => 4,
            AuthStat::TooWeak => 5,
            AuthStat::InvalidResp => 6,
            AuthStat::Failed => 7,
        }
    }

    fn from_code(code: u32) -> Result<Self, XdrError> {
        Ok(match code {
            0 => AuthStat::Ok,
            1 => AuthStat::BadCred,
            2 => AuthStat::RejectedCred,
            3 => AuthStat::BadVerf,
            4 => AuthStat::RejectedVerf,
            5 => AuthStat::TooWeak,
            6 => AuthStat::InvalidResp,
            7 => AuthStat::Failed,
            value => {
                return Err(XdrError::InvalidDiscriminant {
                    what: "auth_stat",
                    value,
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStat {
    RpcMismatch { low: u32, high: u32 },
    AuthError(AuthStat),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Accepted { verf: OpaqueAuth, stat: AcceptStat },
    Denied(RejectStat),
}

impl ReplyBody {
    pub fn success() -> Self {
        ReplyBody::Accepted {
            verf: OpaqueAuth::none(),
            stat: AcceptStat::Success,
        }
    }

    pub fn accepted(stat: AcceptStat) -> Self {
        ReplyBody::Accepted {
            verf: OpaqueAuth::none(),
            stat,
        }
    }

    pub fn auth_error(stat: AuthStat) -> Self {
        ReplyBody::Denied(RejectStat::AuthError(stat))
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ReplyBody::Accepted {
                stat: AcceptStat::Success,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgBody {
    Call(CallBody),
    Reply(ReplyBody),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMsg {
    pub xid: u32,
    pub body: MsgBody,
}

impl RpcMsg {
    pub fn call(xid: u32, call: CallBody) -> Self {
        Self {
            xid,
            body: MsgBody::Call(call),
        }
    }

    pub fn reply(xid: u32, reply: ReplyBody) -> Self {
        Self {
            xid,
            body: MsgBody::Reply(reply),
        }
    }
}

const CALL: u32 = 0;
const REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;
const RPC_MISMATCH: u32 = 0;
const AUTH_ERROR: u32 = 1;

impl XdrEncode for RpcMsg {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_u32(self.xid)?;
        match &self.body {
            MsgBody::Call(call) => {
                xdr.put_u32(CALL)?;
                xdr.put_u32(call.rpcvers)?;
                xdr.put_u32(call.prog)?;
                xdr.put_u32(call.vers)?;
                xdr.put_u32(call.procedure)?;
                call.cred.encode(xdr)?;
                call.verf.encode(xdr)
            }
            MsgBody::Reply(ReplyBody::Accepted { verf, stat }) => {
                xdr.put_u32(REPLY)?;
                xdr.put_u32(MSG_ACCEPTED)?;
                verf.encode(xdr)?;
                match *stat {
                    AcceptStat::Success => xdr.put_u32(0),
                    AcceptStat::ProgUnavail => xdr.put_u32(1),
                    AcceptStat::ProgMismatch { low, high } => {
                        xdr.put_u32(2)?;
                        xdr.put_u32(low)?;
                        xdr.put_u32(high)
                    }
                    AcceptStat::ProcUnavail => xdr.put_u32(3),
                    AcceptStat::GarbageArgs => xdr.put_u32(4),
                    AcceptStat::SystemErr => xdr.put_u32(5),
                }
            }
            MsgBody::Reply(ReplyBody::Denied(reject)) => {
                xdr.put_u32(REPLY)?;
                xdr.put_u32(MSG_DENIED)?;
                match *reject {
                    RejectStat::RpcMismatch { low, high } => {
                        xdr.put_u32(RPC_MISMATCH)?;
                        xdr.put_u32(low)?;
                        xdr.put_u32(high)
                    }
                    RejectStat::AuthError(stat) => {
                        xdr.put_u32(AUTH_ERROR)?;
                        xdr.put_u32(stat.code())
                    }
                }
            }
        }
    }
}

impl XdrDecode for RpcMsg {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        let xid = xdr.get_u32()?;
        let body = match xdr.get_u32()? {
            CALL => MsgBody::Call(CallBody {
                rpcvers: xdr.get_u32()?,
                prog: xdr.get_u32()?,
                vers: xdr.get_u32()?,
                procedure: xdr.get_u32()?,
                cred: OpaqueAuth::decode(xdr)?,
                verf: OpaqueAuth::decode(xdr)?,
            }),
            REPLY => MsgBody::Reply(decode_reply(xdr)?),
            value => {
                return Err(XdrError::InvalidDiscriminant {
                    what: "msg_type",
                    value,
                });
            }
        };
        Ok(Self { xid, body })
    }
}

fn decode_reply(xdr: &mut dyn XdrStream) -> Result<ReplyBody, XdrError> {
    match xdr.get_u32()? {
        MSG_ACCEPTED => {
            let verf = OpaqueAuth::decode(xdr)?;
            let stat = match xdr.get_u32()? {
                0 => AcceptStat::Success,
                1 => AcceptStat::ProgUnavail,
                2 => AcceptStat::ProgMismatch {
                    low: xdr.get_u32()?,
                    high: xdr.get_u32()?,
                },
                3 => AcceptStat::ProcUnavail,
                4 => AcceptStat::GarbageArgs,
                5 => AcceptStat::SystemErr,
                value => {
                    return Err(XdrError::InvalidDiscriminant {
                        what: "accept_stat",
                        value,
                    });
                }
            };
            Ok(ReplyBody::Accepted { verf, stat })
        }
        MSG_DENIED => {
            let reject = match xdr.get_u32()? {
                RPC_MISMATCH => RejectStat::RpcMismatch {
                    low: xdr.get_u32()?,
                    high: xdr.get_u32()?,
                },
                AUTH_ERROR => RejectStat::AuthError(AuthStat::from_code(xdr.get_u32()?)?),
                value => {
                    return Err(XdrError::InvalidDiscriminant {
                        what: "reject_stat",
                        value,
                    });
                }
            };
            Ok(ReplyBody::Denied(reject))
        }
        value => Err(XdrError::InvalidDiscriminant {
            what: "reply_stat",
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xdr::{MemXdr, decode_atomic, from_bytes, to_bytes};

    #[test]
    fn tls_bootstrap_call_wire_format() {
        let msg = RpcMsg::call(0x11, CallBody::new(100003, 4, 0, OpaqueAuth::tls()));
        let bytes = to_bytes(&msg).unwrap();
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert_eq!(words, vec![0x11, 0, 2, 100003, 4, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn starttls_ack_carries_verifier() {
        let msg = RpcMsg::reply(
            9,
            ReplyBody::Accepted {
                verf: OpaqueAuth::starttls_verifier(),
                stat: AcceptStat::Success,
            },
        );
        let decoded: RpcMsg = from_bytes(to_bytes(&msg).unwrap()).unwrap();
        let MsgBody::Reply(ReplyBody::Accepted { verf, stat }) = decoded.body else {
            panic!("expected accepted reply");
        };
        assert!(verf.is_starttls_verifier());
        assert_eq!(stat, AcceptStat::Success);
    }

    #[test]
    fn denied_replies_decode() {
        for reply in [
            ReplyBody::Denied(RejectStat::RpcMismatch { low: 2, high: 2 }),
            ReplyBody::auth_error(AuthStat::TooWeak),
            ReplyBody::accepted(AcceptStat::ProgMismatch { low: 1, high: 3 }),
        ] {
            let msg = RpcMsg::reply(1, reply);
            let decoded: RpcMsg = from_bytes(to_bytes(&msg).unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn results_follow_the_header() {
        let mut enc = MemXdr::encoder();
        RpcMsg::reply(3, ReplyBody::success()).encode(&mut enc).unwrap();
        enc.put_u32(42).unwrap();

        let mut dec = MemXdr::decoder(enc.into_bytes());
        let msg: RpcMsg = decode_atomic(&mut dec).unwrap();
        assert_eq!(msg.xid, 3);
        assert_eq!(dec.get_u32().unwrap(), 42);
    }

    #[test]
    fn oversized_credential_is_rejected() {
        let mut enc = MemXdr::encoder();
        enc.put_u32(1).unwrap();
        enc.put_u32(MAX_AUTH_BYTES as u32 + 1).unwrap();
        let mut dec = MemXdr::decoder(enc.into_bytes());
        assert!(matches!(
            OpaqueAuth::decode(&mut dec),
            Err(XdrError::TooLong { .. })
        ));
    }

    #[test]
    fn unknown_message_type() {
        let err = from_bytes::<RpcMsg>(bytes::Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 9]))
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"invalid msg_type discriminant 9");
    }
}
