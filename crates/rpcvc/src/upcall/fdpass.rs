//! Descriptor passing over local sockets (SCM_RIGHTS).
//!
//! The handshake daemon needs the connection's socket itself, not a copy of
//! its bytes. The descriptor rides as ancillary data on the first bytes of the
//! connect/accept request.
//!
//! Received descriptors are wrapped in `OwnedFd` immediately. The kernel
//! installs a fresh descriptor per `SCM_RIGHTS` entry in the receiving
//! process, so each one is owned by exactly one `OwnedFd`.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Most descriptors accepted in one message; extras are closed on receipt.
const MAX_FDS: usize = 4;

/// Send a prefix of `buf` with `fd` attached. Returns how many bytes went out.
pub async fn send_with_fd(stream: &UnixStream, buf: &[u8], fd: BorrowedFd<'_>) -> io::Result<usize> {
    let fds = [fd.as_raw_fd()];
    let raw = stream.as_raw_fd();
    stream
        .async_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(buf)];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(raw, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
        })
        .await
}

/// Read into `buf`, collecting any descriptors that arrived with the bytes.
///
/// `Ok((0, _))` means the peer closed.
pub async fn recv_with_fds(
    stream: &UnixStream,
    buf: &mut [u8],
) -> io::Result<(usize, Vec<OwnedFd>)> {
    let raw = stream.as_raw_fd();
    stream
        .async_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut *buf)];
            let mut space = nix::cmsg_space!([RawFd; MAX_FDS]);
            let msg = recvmsg::<()>(
                raw,
                &mut iov,
                Some(&mut space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;
            let mut fds = Vec::new();
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    for fd in received {
                        // SAFETY: freshly installed by the kernel for this process
                        // and not yet owned by anything else.
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            Ok((msg.bytes, fds))
        })
        .await
}
