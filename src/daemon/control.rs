//! Parent/worker control channel.
//!
//! One `SOCK_SEQPACKET` socket pair per worker, so every `sendmsg` is one
//! message. Payloads are bincode-encoded [`Message`]s; a new session carries
//! the accepted client socket as `SCM_RIGHTS` ancillary data.

use crate::error::LockError;
use crate::repo::{LockKind, OwnerId};
use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
};
use serde::{Deserialize, Serialize};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Largest encoded message.
const MAX_MESSAGE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Parent to worker: serve the attached client socket.
    Session { seq: u64 },
    /// Parent to worker: exit after the current session.
    Shutdown,
    /// Worker to parent: the session ended, hand me another.
    Idle,
    Lock { owner: OwnerId, path: String, kind: LockKind },
    Unlock { owner: OwnerId, path: String },
    ReleaseAll { owner: OwnerId },
    /// Parent to worker: the lock request succeeded.
    Granted,
    Refused(LockError),
}

/// Blocking half: one end of the socket pair.
#[derive(Debug)]
pub struct ControlSocket {
    fd: OwnedFd,
}

impl ControlSocket {
    /// A connected pair, both ends close-on-exec.
    pub fn pair() -> Result<(ControlSocket, ControlSocket)> {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::SOCK_CLOEXEC)
            .context("Failed to create control socket pair")?;
        Ok((ControlSocket { fd: a }, ControlSocket { fd: b }))
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = fcntl(self.fd.as_raw_fd(), FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(self.fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    /// Send one message, optionally with a descriptor attached.
    pub fn send(&self, msg: &Message, fd: Option<RawFd>) -> io::Result<()> {
        let payload = bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let iov = [IoSlice::new(&payload)];
        let fds: Vec<RawFd> = fd.into_iter().collect();
        let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(&fds)]
        };
        let sent = sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
        if sent != payload.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short control message"));
        }
        Ok(())
    }

    /// Receive one message. `None` when the peer closed its end.
    pub fn recv(&self) -> io::Result<Option<(Message, Option<OwnedFd>)>> {
        let mut buf = vec![0u8; MAX_MESSAGE];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        let (bytes, received) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<()>(self.fd.as_raw_fd(), &mut iov, Some(&mut cmsg_space), MsgFlags::empty())?;
            let mut received = Vec::new();
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    received.extend(fds);
                }
            }
            (msg.bytes, received)
        };

        // SAFETY: SCM_RIGHTS just installed these descriptors in our table
        // and nothing else refers to them.
        let mut owned: Vec<OwnedFd> = received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }).collect();
        if bytes == 0 {
            return Ok(None);
        }
        if owned.len() > 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "more than one descriptor received"));
        }

        let msg: Message =
            bincode::deserialize(&buf[..bytes]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some((msg, owned.pop())))
    }
}

impl AsRawFd for ControlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Async wrapper used by both the parent and the worker runtime.
#[derive(Debug)]
pub struct Channel {
    inner: AsyncFd<ControlSocket>,
}

impl Channel {
    /// Must be called inside a tokio runtime.
    pub fn new(socket: ControlSocket) -> io::Result<Self> {
        socket.set_nonblocking()?;
        Ok(Self {
            inner: AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)?,
        })
    }

    pub async fn send(&self, msg: &Message) -> io::Result<()> {
        self.send_fd(msg, None).await
    }

    /// Hand a descriptor to the peer. The caller keeps its own copy and may
    /// close it once this returns.
    pub async fn send_fd(&self, msg: &Message, fd: Option<RawFd>) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(msg, fd)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn recv(&self) -> io::Result<Option<(Message, Option<OwnedFd>)>> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv()) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_message_round_trip() {
        let (a, b) = ControlSocket::pair().unwrap();
        let msg = Message::Lock {
            owner: OwnerId::new(3, 9),
            path: "mod/sub".into(),
            kind: LockKind::Write,
        };
        a.send(&msg, None).unwrap();
        a.send(&Message::Refused(LockError::Timeout("mod".into())), None).unwrap();

        let (got, fd) = b.recv().unwrap().unwrap();
        assert_eq!(got, msg);
        assert!(fd.is_none());
        let (got, _) = b.recv().unwrap().unwrap();
        assert_eq!(got, Message::Refused(LockError::Timeout("mod".into())));
    }

    #[test]
    fn test_descriptor_passing() {
        let (a, b) = ControlSocket::pair().unwrap();
        let (mut near, far) = UnixStream::pair().unwrap();

        a.send(&Message::Session { seq: 7 }, Some(far.as_raw_fd())).unwrap();
        drop(far);

        let (msg, fd) = b.recv().unwrap().unwrap();
        assert_eq!(msg, Message::Session { seq: 7 });
        let mut passed = UnixStream::from(fd.unwrap());

        near.write_all(b"Root /cvs\n").unwrap();
        let mut buf = [0u8; 10];
        passed.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"Root /cvs\n");
    }

    #[test]
    fn test_peer_close_is_end_of_stream() {
        let (a, b) = ControlSocket::pair().unwrap();
        drop(a);
        assert!(b.recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_async_channel() {
        let (a, b) = ControlSocket::pair().unwrap();
        let (a, b) = (Channel::new(a).unwrap(), Channel::new(b).unwrap());
        let reader = tokio::spawn(async move { b.recv().await.unwrap().map(|(m, _)| m) });
        a.send(&Message::Idle).await.unwrap();
        assert_eq!(reader.await.unwrap(), Some(Message::Idle));
    }
}
