use std::{
    fmt,
    io::{self, Read, Write},
    net::{SocketAddr, ToSocketAddrs},
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
    time::Duration,
};

use log::trace;
use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use thiserror::Error;

const SOCKET_TOKEN: Token = Token(0);
const CANCEL_TOKEN: Token = Token(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket is not open")]
    Closed,
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("could not resolve address {0}")]
    Resolve(String),
}

impl TransportError {
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Failure captured by the last socket call that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    /// OS error number, when the failure came from the OS.
    pub code: Option<i32>,
    pub message: String,
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::Ipv4,
            SocketAddr::V6(_) => Family::Ipv6,
        }
    }
}

/// How long a readiness wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    /// Check once and return immediately.
    Poll,
    After(Duration),
}

impl Timeout {
    /// `None` waits forever, `Some(0)` polls.
    pub fn from_millis(ms: Option<u64>) -> Self {
        match ms {
            None => Timeout::Infinite,
            Some(0) => Timeout::Poll,
            Some(ms) => Timeout::After(Duration::from_millis(ms)),
        }
    }

    fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::Poll => Some(Duration::ZERO),
            Timeout::After(duration) => Some(duration),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Timed out, interrupted, or cancelled.
    Pending,
}

/// Resolves `host:port` to the addresses it names.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Io {
            op: "resolve",
            source,
        })?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(TransportError::Resolve(format!("{host}:{port}")));
    }
    Ok(addrs)
}

/// Reads until `buf` is full or the reader hits end of stream.
///
/// Returns the number of bytes read; anything short of `buf.len()` means the peer closed.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Stream socket handle with last-error capture.
///
/// The socket exclusively owns its OS handle until [`Socket::close`] or drop. Closing twice is
/// a no-op.
#[derive(Debug)]
pub struct Socket {
    inner: Option<RawSocket>,
    last_error: Option<LastError>,
}

impl Socket {
    pub fn create(family: Family) -> Result<Self, TransportError> {
        let domain = match family {
            Family::Ipv4 => Domain::IPV4,
            Family::Ipv6 => Domain::IPV6,
        };
        let inner = RawSocket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|source| TransportError::Io { op: "create", source })?;

        Ok(Self::from_raw(inner))
    }

    fn from_raw(inner: RawSocket) -> Self {
        Self {
            inner: Some(inner),
            last_error: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Human readable form of the last failure, empty when there is none.
    pub fn error_msg(&self) -> String {
        self.last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    fn fail(&mut self, op: &'static str, source: io::Error) -> TransportError {
        self.last_error = Some(LastError {
            code: source.raw_os_error(),
            message: format!("{op}: {source}"),
        });
        TransportError::Io { op, source }
    }

    fn call<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&RawSocket) -> io::Result<T>,
    ) -> Result<T, TransportError> {
        let Some(inner) = self.inner.as_ref() else {
            self.last_error = Some(LastError {
                code: None,
                message: format!("{op}: socket is not open"),
            });
            return Err(TransportError::Closed);
        };

        match f(inner) {
            Ok(value) => Ok(value),
            Err(source) => Err(self.fail(op, source)),
        }
    }

    pub fn set_reuse_address(&mut self, reuse: bool) -> Result<(), TransportError> {
        self.call("set_reuse_address", |s| s.set_reuse_address(reuse))
    }

    pub fn bind(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        self.call("bind", |s| s.bind(&addr.into()))
    }

    pub fn listen(&mut self, backlog: i32) -> Result<(), TransportError> {
        self.call("listen", |s| s.listen(backlog))
    }

    /// Accepts one pending connection.
    pub fn accept(&mut self) -> Result<Socket, TransportError> {
        let (raw, peer) = self.call("accept", |s| s.accept())?;
        trace!("accepted connection from {:?}", peer.as_socket());
        Ok(Socket::from_raw(raw))
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        self.call("connect", |s| s.connect(&addr.into()))
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), TransportError> {
        self.call("set_nonblocking", |s| s.set_nonblocking(nonblocking))
    }

    /// Applies send/receive timeouts; `None` blocks indefinitely.
    pub fn set_timeouts(
        &mut self,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> Result<(), TransportError> {
        self.call("set_read_timeout", |s| s.set_read_timeout(read))?;
        self.call("set_write_timeout", |s| s.set_write_timeout(write))
    }

    pub fn local_addr(&mut self) -> Result<SocketAddr, TransportError> {
        let addr = self.call("local_addr", |s| s.local_addr())?;
        addr.as_socket()
            .ok_or_else(|| TransportError::Resolve("non-IP local address".to_string()))
    }

    /// Sends all of `buf`.
    pub fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.call("send", |s| {
            let mut s = s;
            s.write_all(buf)
        })
    }

    /// Receives until `buf` is full or the peer closes; returns the bytes received.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.call("receive", |s| {
            let mut s = s;
            read_full(&mut s, buf)
        })
    }

    /// Releases the handle and clears the captured error.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            trace!("socket closed");
        }
        self.last_error = None;
    }

    fn raw_fd(&mut self) -> Result<RawFd, TransportError> {
        self.call("poll", |s| Ok(s.as_raw_fd()))
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match self.inner.as_ref() {
            Some(inner) => {
                let mut inner = inner;
                inner.read(buf)
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        };

        result.map_err(|e| {
            let kind = e.kind();
            let err = self.fail("receive", e);
            io::Error::new(kind, err)
        })
    }
}

/// Wakes a [`Poller`] blocked in a readiness wait.
#[derive(Debug, Clone)]
pub struct Canceller(Arc<Waker>);

impl Canceller {
    pub fn cancel(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// Readiness wait over one socket plus a cancellation handle.
///
/// The cancel handle is part of the same poll set, so a [`Canceller::cancel`] issued before the
/// wait begins still ends it.
pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl Poller {
    pub fn new() -> Result<Self, TransportError> {
        let poll = Poll::new().map_err(|source| TransportError::Io { op: "poll", source })?;
        let waker = Waker::new(poll.registry(), CANCEL_TOKEN)
            .map_err(|source| TransportError::Io { op: "poll", source })?;

        Ok(Self {
            poll,
            events: Events::with_capacity(4),
            waker: Arc::new(waker),
        })
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(Arc::clone(&self.waker))
    }

    pub fn read_ready(
        &mut self,
        socket: &mut Socket,
        timeout: Timeout,
    ) -> Result<Readiness, TransportError> {
        self.wait(socket, Interest::READABLE, timeout)
    }

    pub fn write_ready(
        &mut self,
        socket: &mut Socket,
        timeout: Timeout,
    ) -> Result<Readiness, TransportError> {
        self.wait(socket, Interest::WRITABLE, timeout)
    }

    fn wait(
        &mut self,
        socket: &mut Socket,
        interest: Interest,
        timeout: Timeout,
    ) -> Result<Readiness, TransportError> {
        let fd = socket.raw_fd()?;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), SOCKET_TOKEN, interest)
            .map_err(|e| socket.fail("poll", e))?;

        let polled = self.poll.poll(&mut self.events, timeout.as_duration());
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            trace!("failed to deregister socket: {e}");
        }

        match polled {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Readiness::Pending),
            Err(e) => return Err(socket.fail("poll", e)),
        }

        let ready = self.events.iter().any(|e| e.token() == SOCKET_TOKEN);
        if self.events.iter().any(|e| e.token() == CANCEL_TOKEN) {
            trace!("readiness wait cancelled");
        }

        Ok(if ready {
            Readiness::Ready
        } else {
            Readiness::Pending
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    fn listener() -> (Socket, SocketAddr) {
        let mut socket = Socket::create(Family::Ipv4).unwrap();
        socket.set_reuse_address(true).unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        socket.listen(8).unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[test]
    fn read_ready_reports_pending_connection() {
        let (mut listener, addr) = listener();
        let mut poller = Poller::new().unwrap();

        assert_eq!(
            poller.read_ready(&mut listener, Timeout::Poll).unwrap(),
            Readiness::Pending
        );

        let mut client = Socket::create(Family::Ipv4).unwrap();
        client.connect(addr).unwrap();

        assert_eq!(
            poller
                .read_ready(&mut listener, Timeout::After(Duration::from_secs(5)))
                .unwrap(),
            Readiness::Ready
        );
        assert!(listener.accept().is_ok());
    }

    #[test]
    fn send_and_receive_full_buffers() {
        let (mut listener, addr) = listener();
        let mut client = Socket::create(Family::Ipv4).unwrap();
        client.connect(addr).unwrap();

        let mut poller = Poller::new().unwrap();
        poller
            .read_ready(&mut listener, Timeout::After(Duration::from_secs(5)))
            .unwrap();
        let mut server = listener.accept().unwrap();
        server.set_nonblocking(false).unwrap();

        assert_eq!(
            poller.write_ready(&mut client, Timeout::Poll).unwrap(),
            Readiness::Ready
        );
        client.send(b"hello world").unwrap();
        client.close();

        let mut buf = [0u8; 5];
        assert_eq!(server.receive(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        // peer closed: short count, not an error
        let mut rest = [0u8; 16];
        assert_eq!(server.receive(&mut rest).unwrap(), 6);
        assert_eq!(&rest[..6], b" world");
    }

    #[test]
    fn cancel_unblocks_infinite_wait() {
        let (mut listener, _) = listener();
        let mut poller = Poller::new().unwrap();
        let canceller = poller.canceller();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel().unwrap();
        });

        let started = Instant::now();
        assert_eq!(
            poller.read_ready(&mut listener, Timeout::Infinite).unwrap(),
            Readiness::Pending
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn cancel_before_wait_is_not_lost() {
        let (mut listener, _) = listener();
        let mut poller = Poller::new().unwrap();

        poller.canceller().cancel().unwrap();
        assert_eq!(
            poller.read_ready(&mut listener, Timeout::Infinite).unwrap(),
            Readiness::Pending
        );
    }

    #[test]
    fn connect_refused_is_captured() {
        let (mut listener, addr) = listener();
        listener.close();

        let mut client = Socket::create(Family::Ipv4).unwrap();
        let err = client.connect(addr).unwrap_err();

        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        assert!(client.last_error().unwrap().code.is_some());
        assert!(client.error_msg().starts_with("connect:"));
    }

    #[test]
    fn close_is_idempotent_and_clears_error() {
        let mut socket = Socket::create(Family::Ipv4).unwrap();
        socket.close();
        assert!(!socket.is_open());
        assert!(matches!(socket.listen(1), Err(TransportError::Closed)));
        assert!(socket.last_error().is_some());

        socket.close();
        assert!(socket.last_error().is_none());
    }

    #[test]
    fn timeout_modes() {
        assert_eq!(Timeout::from_millis(None), Timeout::Infinite);
        assert_eq!(Timeout::from_millis(Some(0)), Timeout::Poll);
        assert_eq!(
            Timeout::from_millis(Some(250)).as_duration(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn resolve_localhost() {
        let addrs = resolve("127.0.0.1", 80).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse::<SocketAddr>().unwrap()]);
    }
}
