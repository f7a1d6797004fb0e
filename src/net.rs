//! SOCK_SEQPACKET plumbing over a local socket.
//!
//! tokio has no seqpacket type, so the listener and connection here own raw
//! sockets created through nix and drive them with [`AsyncFd`] readiness.
//! Seqpacket gives record boundaries with stream-like connection semantics,
//! which is exactly what the one-record-per-request protocol needs: no length
//! prefixes, and a zero-byte read is end of stream, not an empty record.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    accept4, bind, connect, getsockopt, listen, recvmsg, send, shutdown, socket, sockopt,
    AddressFamily, Backlog, MsgFlags, Shutdown, SockFlag, SockType, UnixAddr, UnixCredentials,
};
use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::io::unix::AsyncFd;

const LISTEN_BACKLOG: i32 = 20;

fn errno_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Result of receiving one record.
#[derive(Debug, Clone, Copy)]
pub struct RecvRecord {
    pub len: usize,
    /// The kernel flagged MSG_TRUNC: the record did not fit the buffer.
    pub truncated: bool,
}

pub struct SeqPacketListener {
    inner: AsyncFd<OwnedFd>,
}

impl SeqPacketListener {
    /// Bind at `path`, replacing any stale socket node, and open the socket
    /// to every local user (authorization happens per-connection via peer
    /// credentials, not via the socket mode).
    pub fn bind(path: &Path) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);

        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(errno_io)?;
        let addr = UnixAddr::new(path).map_err(errno_io)?;
        bind(fd.as_raw_fd(), &addr).map_err(errno_io)?;
        listen(&fd, Backlog::new(LISTEN_BACKLOG).map_err(errno_io)?).map_err(errno_io)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;

        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    pub async fn accept(&self) -> io::Result<SeqPacketConn> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                accept4(
                    inner.get_ref().as_raw_fd(),
                    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                )
                .map_err(errno_io)
            }) {
                Ok(res) => {
                    let raw = res?;
                    // accept4 hands us a fresh descriptor we now own.
                    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                    return SeqPacketConn::from_owned(owned);
                }
                Err(_would_block) => continue,
            }
        }
    }
}

pub struct SeqPacketConn {
    inner: AsyncFd<OwnedFd>,
}

impl SeqPacketConn {
    fn from_owned(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Connect to the daemon socket. The connect itself is done blocking
    /// (local connects complete immediately unless the backlog is full) and
    /// the socket is switched to non-blocking afterwards.
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(errno_io)?;
        let addr = UnixAddr::new(path).map_err(errno_io)?;
        connect(fd.as_raw_fd(), &addr).map_err(errno_io)?;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(errno_io)?;
        Self::from_owned(fd)
    }

    /// Send one record. MSG_EOR marks the record boundary and MSG_NOSIGNAL
    /// turns a dead peer into an EPIPE error instead of a signal.
    ///
    /// Sends are not retried: replies fit the socket's send buffer, so a
    /// full buffer means the peer stopped draining and the connection is
    /// reported as failed rather than stalling the caller.
    pub async fn send(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.writable().await?;
        match guard.try_io(|inner| {
            send(
                inner.get_ref().as_raw_fd(),
                buf,
                MsgFlags::MSG_EOR | MsgFlags::MSG_NOSIGNAL,
            )
            .map_err(errno_io)
        }) {
            Ok(res) => {
                let sent = res?;
                if sent != buf.len() {
                    // Seqpacket sends are all-or-nothing; a short send means
                    // the record was cut and the peer cannot trust anything
                    // further on this connection.
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("partial send: {} of {} bytes", sent, buf.len()),
                    ));
                }
                Ok(())
            }
            Err(_would_block) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "send buffer full",
            )),
        }
    }

    /// Receive one record into `buf`. A zero-length result is end of stream.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<RecvRecord> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let mut iov = [IoSliceMut::new(buf)];
                let msg = recvmsg::<UnixAddr>(
                    inner.get_ref().as_raw_fd(),
                    &mut iov,
                    None,
                    MsgFlags::empty(),
                )
                .map_err(errno_io)?;
                Ok(RecvRecord {
                    len: msg.bytes,
                    truncated: msg.flags.contains(MsgFlags::MSG_TRUNC),
                })
            }) {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }

    /// Kernel-reported identity of the peer process.
    pub fn peer_credentials(&self) -> io::Result<UnixCredentials> {
        getsockopt(self.inner.get_ref(), sockopt::PeerCredentials).map_err(errno_io)
    }

    /// Half-close from our side; wakes any task blocked in `recv`.
    pub fn shutdown(&self) {
        let _ = shutdown(self.inner.get_ref().as_raw_fd(), Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gpuclaim-net-{}-{}.sock", name, std::process::id()))
    }

    /// A unix connect succeeds as soon as the connection sits in the listen
    /// backlog, so connect-then-accept needs no concurrency here.
    async fn pair(name: &str) -> (PathBuf, SeqPacketConn, SeqPacketConn) {
        let path = socket_path(name);
        let listener = SeqPacketListener::bind(&path).unwrap();
        let client = SeqPacketConn::connect(&path).await.unwrap();
        let server = listener.accept().await.unwrap();
        (path, client, server)
    }

    #[tokio::test]
    async fn records_round_trip_both_ways() {
        let (path, client, server) = pair("roundtrip").await;

        client.send(b"claim one card").await.unwrap();
        let mut buf = [0u8; 64];
        let record = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..record.len], b"claim one card");
        assert!(!record.truncated);

        server.send(b"ok").await.unwrap();
        let record = client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..record.len], b"ok");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn record_boundaries_are_preserved() {
        let (path, client, server) = pair("boundaries").await;

        client.send(b"one").await.unwrap();
        client.send(b"two").await.unwrap();

        let mut buf = [0u8; 64];
        let first = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..first.len], b"one");
        let second = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..second.len], b"two");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn peer_credentials_report_our_identity() {
        let (path, _client, server) = pair("creds").await;

        let creds = server.peer_credentials().unwrap();
        assert_eq!(creds.uid(), nix::unistd::getuid().as_raw());
        assert_eq!(creds.pid(), std::process::id() as i32);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn oversized_record_is_flagged_truncated() {
        let (path, client, server) = pair("trunc").await;

        client.send(&[0x55; 64]).await.unwrap();
        let mut buf = [0u8; 16];
        let record = server.recv(&mut buf).await.unwrap();
        assert!(record.truncated);
        assert_eq!(record.len, 16);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn closed_peer_reads_as_end_of_stream() {
        let (path, client, server) = pair("eof").await;

        drop(client);
        let mut buf = [0u8; 16];
        let record = server.recv(&mut buf).await.unwrap();
        assert_eq!(record.len, 0);

        let _ = std::fs::remove_file(&path);
    }
}
