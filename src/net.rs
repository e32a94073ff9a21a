//! Transport plumbing: one address/stream/listener surface over TCP and
//! Unix sockets, plus the buffered, deadline-aware halves the codec layer
//! reads and writes through.

use std::str::FromStr;
use std::{
    fmt, fs, io,
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::BytesMut;
use log::*;
use tokio::{
    io::{
        AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf,
        ReadHalf, WriteHalf,
    },
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
    time::timeout,
};

const ZERO_TIME: Duration = Duration::from_secs(0);
const BUF_SIZE: usize = 8 * 1024;

/// Anything a plugin may substitute for the raw connection.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IoStream for T {}

/// Unify behavior of tcp & unix addr. Strings starting with '/' parse as
/// socket paths, anything else resolves as a socket address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum NetAddr {
    Socket(SocketAddr),
    Path(PathBuf),
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(s) => write!(f, "{}", s),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl fmt::Debug for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for NetAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Self::Path(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => Ok(Self::Socket(a)),
            // Not a literal address, try to resolve it as a host name.
            // If multiple addresses come back only the first one is taken.
            Err(e) => match s.to_socket_addrs() {
                Ok(mut _v) => match _v.next() {
                    Some(a) => Ok(Self::Socket(a)),
                    None => Err(e),
                },
                Err(_) => Err(e),
            },
        }
    }
}

/// Unify behavior of tcp & unix stream; `Wrapped` carries a connection a
/// plugin has substituted (compression, framing and the like).
pub enum NetStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Wrapped(Box<dyn IoStream>),
}

impl NetStream {
    pub async fn connect(addr: &NetAddr) -> io::Result<Self> {
        match addr {
            NetAddr::Socket(_addr) => match TcpStream::connect(_addr).await {
                Ok(stream) => Ok(NetStream::Tcp(stream)),
                Err(e) => Err(e),
            },
            NetAddr::Path(path) => match UnixStream::connect(path).await {
                Ok(stream) => Ok(NetStream::Unix(stream)),
                Err(e) => Err(e),
            },
        }
    }

    pub async fn connect_timeout(addr: &NetAddr, connect_timeout: Duration) -> io::Result<Self> {
        if connect_timeout == ZERO_TIME {
            return Self::connect(addr).await;
        }
        match timeout(connect_timeout, Self::connect(addr)).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the raw connection, used by connection-wrapping plugins.
    #[inline]
    pub fn wrap(stream: Box<dyn IoStream>) -> Self {
        NetStream::Wrapped(stream)
    }

    /// Short peer description for log lines.
    pub fn peer_label(&self) -> String {
        match self {
            Self::Tcp(s) => match s.peer_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "tcp peer unknown".to_string(),
            },
            Self::Unix(_) => "unix peer".to_string(),
            Self::Wrapped(_) => "wrapped peer".to_string(),
        }
    }
}

impl fmt::Debug for NetStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.peer_label())
    }
}

impl AsyncRead for NetStream {
    #[inline(always)]
    fn poll_read(
        self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            NetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Wrapped(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    #[inline(always)]
    fn poll_write(
        self: Pin<&mut Self>, cx: &mut Context, buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match Pin::get_mut(self) {
            NetStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Wrapped(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    #[inline(always)]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        match Pin::get_mut(self) {
            NetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            NetStream::Unix(s) => Pin::new(s).poll_flush(cx),
            NetStream::Wrapped(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    #[inline(always)]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        match Pin::get_mut(self) {
            NetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Wrapped(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Unify behavior of tcp & unix socket listener.
pub enum NetListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl NetListener {
    pub async fn bind(addr: &NetAddr) -> io::Result<Self> {
        match addr {
            NetAddr::Socket(_addr) => match TcpListener::bind(_addr).await {
                Ok(l) => Ok(NetListener::Tcp(l)),
                Err(e) => Err(e),
            },
            NetAddr::Path(path) => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
                match UnixListener::bind(path) {
                    Ok(l) => Ok(NetListener::Unix(l)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub async fn bind_str(addr: &str) -> io::Result<Self> {
        match NetAddr::from_str(addr) {
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("addr {:?} invalid: {:?}", addr, e),
            )),
            Ok(a) => Self::bind(&a).await,
        }
    }

    #[inline]
    pub async fn accept(&self) -> io::Result<NetStream> {
        match self {
            NetListener::Tcp(l) => match l.accept().await {
                Ok((stream, _)) => Ok(NetStream::Tcp(stream)),
                Err(e) => Err(e),
            },
            NetListener::Unix(l) => match l.accept().await {
                Ok((stream, _)) => Ok(NetStream::Unix(stream)),
                Err(e) => Err(e),
            },
        }
    }

    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            NetListener::Tcp(l) => Ok(l.local_addr()?.to_string()),
            NetListener::Unix(l) => {
                let addr = l.local_addr()?;
                match addr.as_pathname() {
                    Some(p) => Ok(p.display().to_string()),
                    None => Ok("unix listener".to_string()),
                }
            }
        }
    }
}

impl fmt::Display for NetListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.local_addr() {
            Ok(addr) => write!(f, "listener {}", addr),
            Err(_) => write!(f, "listener unknown"),
        }
    }
}

/// Split a stream into its buffered, deadline-aware halves.
pub fn split_stream(stream: NetStream) -> (ConnReader, ConnWriter) {
    let (r, w) = tokio::io::split(stream);
    (
        ConnReader {
            inner: BufReader::with_capacity(BUF_SIZE, r),
            scratch: BytesMut::with_capacity(512),
        },
        ConnWriter { inner: BufWriter::with_capacity(BUF_SIZE, w) },
    )
}

/// Buffered read half. One exists per connection and is owned by the
/// connection's single reader task.
pub struct ConnReader {
    inner: BufReader<ReadHalf<NetStream>>,
    scratch: BytesMut,
}

impl ConnReader {
    pub async fn read_exact_timeout(
        &mut self, dst: &mut [u8], read_timeout: Duration,
    ) -> io::Result<()> {
        if read_timeout == ZERO_TIME {
            self.inner.read_exact(dst).await?;
            return Ok(());
        }
        match timeout(read_timeout, self.inner.read_exact(dst)).await {
            Ok(r) => {
                r?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a length-known payload section into the scratch buffer. The
    /// returned slice is valid until the next read.
    pub async fn read_payload(
        &mut self, len: usize, read_timeout: Duration,
    ) -> io::Result<&[u8]> {
        self.scratch.resize(len, 0);
        let Self { inner, scratch } = self;
        let dst = &mut scratch[..len];
        if read_timeout == ZERO_TIME {
            inner.read_exact(dst).await?;
        } else {
            match timeout(read_timeout, inner.read_exact(dst)).await {
                Ok(r) => {
                    r?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(&self.scratch[..len])
    }

    /// Drain and drop `len` bytes, used for bodies nobody will decode.
    pub async fn discard(&mut self, len: usize, read_timeout: Duration) -> io::Result<()> {
        self.read_payload(len, read_timeout).await?;
        Ok(())
    }
}

/// Buffered write half, shared through a lock so responses and requests
/// stay atomic per message.
pub struct ConnWriter {
    inner: BufWriter<WriteHalf<NetStream>>,
}

impl ConnWriter {
    pub async fn write_timeout(&mut self, src: &[u8], write_timeout: Duration) -> io::Result<()> {
        if write_timeout == ZERO_TIME {
            return self.inner.write_all(src).await;
        }
        match timeout(write_timeout, self.inner.write_all(src)).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn flush_timeout(&mut self, write_timeout: Duration) -> io::Result<()> {
        if write_timeout == ZERO_TIME {
            return self.inner.flush().await;
        }
        match timeout(write_timeout, self.inner.flush()).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        }
    }

    /// Shut the write direction down, letting the peer observe EOF.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            trace!("conn shutdown: {:?}", e);
        }
    }
}
