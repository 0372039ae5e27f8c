//! Listening sockets and their inheritance across process boundaries.
//!
//! A [`ListenerSpec`] describes where to listen; building it yields a
//! [`SocketHolder`] owning the OS handle. The supervisor keeps the holder
//! alive for the whole server lifetime and passes the raw handle to worker
//! processes through the environment, so every worker accepts from a single
//! shared kernel queue.

use std::fmt::{self, Display, Formatter};
use std::io::Result as IoResult;
use std::net::{SocketAddr as StdSocketAddr, ToSocketAddrs};
use std::path::PathBuf;
#[cfg(unix)]
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use crate::error::{Error, Result};

/// Environment variable used to hand the listening socket to worker
/// processes.
pub const SOCKET_ENV: &str = "GANTRY_SOCKET";

/// Network address of one side of an accepted connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum SocketAddr {
    /// IPv4 or IPv6 address.
    Tcp(StdSocketAddr),
    /// Unix domain socket path (or `unnamed` for unbound peers).
    Unix(String),
    /// Address could not be determined.
    Unknown,
}

impl Display for SocketAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => Display::fmt(addr, f),
            Self::Unix(path) => write!(f, "unix:{path}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Specification of a listening socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ListenerSpec {
    /// TCP listener on `addr:port`.
    Tcp {
        /// Bind address.
        addr: String,
        /// Bind port.
        port: u16,
        /// Accept queue depth.
        backlog: u32,
    },
    /// Unix domain socket listener. POSIX only.
    Unix {
        /// Socket file path.
        path: PathBuf,
        /// Accept queue depth.
        backlog: u32,
        /// File permissions applied after bind. `None` keeps the process
        /// umask.
        permissions: Option<u32>,
    },
}

impl ListenerSpec {
    /// TCP listener spec.
    #[must_use]
    pub fn tcp(addr: impl Into<String>, port: u16, backlog: u32) -> Self {
        Self::Tcp {
            addr: addr.into(),
            port,
            backlog: backlog.max(128),
        }
    }

    /// Unix domain socket listener spec.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>, backlog: u32, permissions: Option<u32>) -> Self {
        Self::Unix {
            path: path.into(),
            backlog: backlog.max(128),
            permissions,
        }
    }

    /// Check platform support. UDS is rejected at configuration time on
    /// non-POSIX targets.
    pub fn validate(&self) -> Result<()> {
        #[cfg(not(unix))]
        if matches!(self, Self::Unix { .. }) {
            return Err(Error::config(
                "unix domain sockets are not supported on this platform",
            ));
        }
        Ok(())
    }

    /// Create, configure and start listening on the described socket.
    pub fn build(&self) -> Result<SocketHolder> {
        self.validate()?;
        match self {
            Self::Tcp {
                addr,
                port,
                backlog,
            } => {
                let addr = (addr.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| Error::config(format!("unresolvable address: {addr}")))?;
                let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
                socket.set_reuse_address(true)?;
                #[cfg(unix)]
                socket.set_reuse_port(true)?;
                socket.bind(&addr.into())?;
                socket.listen(*backlog as i32)?;
                Ok(SocketHolder {
                    socket,
                    kind: SocketKind::Tcp,
                })
            }
            #[cfg(unix)]
            Self::Unix {
                path,
                backlog,
                permissions,
            } => {
                if path.exists() {
                    remove_stale_socket(path)?;
                }
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.bind(&socket2::SockAddr::unix(path)?)?;
                socket.listen(*backlog as i32)?;
                if let Some(mode) = permissions {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode))?;
                }
                Ok(SocketHolder {
                    socket,
                    kind: SocketKind::Unix(path.clone()),
                })
            }
            #[cfg(not(unix))]
            Self::Unix { .. } => unreachable!("validated above"),
        }
    }
}

/// Unlink an existing socket path only after confirming no live server
/// holds it: a connect attempt must be refused before the file is removed.
#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let file_type = std::fs::metadata(path)?.file_type();
    if !file_type.is_socket() {
        return Err(Error::config(format!(
            "{} already exists and is not a socket",
            path.display()
        )));
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(Error::config(format!(
            "{} is in use by a live server",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            std::fs::remove_file(path)?;
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum SocketKind {
    Tcp,
    Unix(PathBuf),
}

/// Serialized form of a [`SocketHolder`] for handle inheritance.
#[derive(Debug, Serialize, Deserialize)]
struct SocketPayload {
    kind: SocketKind,
    fd: i32,
}

/// An owned, listening OS socket.
#[derive(Debug)]
pub struct SocketHolder {
    socket: Socket,
    kind: SocketKind,
}

impl SocketHolder {
    /// Whether this is a Unix domain socket.
    #[inline]
    #[must_use]
    pub fn is_unix(&self) -> bool {
        matches!(self.kind, SocketKind::Unix(_))
    }

    /// The bound address, for log lines.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        match &self.kind {
            SocketKind::Tcp => self
                .socket
                .local_addr()
                .ok()
                .and_then(|a| a.as_socket())
                .map_or(SocketAddr::Unknown, SocketAddr::Tcp),
            SocketKind::Unix(path) => SocketAddr::Unix(path.to_string_lossy().into_owned()),
        }
    }

    /// Mark the handle inheritable by child processes.
    #[cfg(unix)]
    pub fn set_inheritable(&self) -> Result<()> {
        use nix::fcntl::{FcntlArg, FdFlag, fcntl};
        fcntl(&self.socket, FcntlArg::F_SETFD(FdFlag::empty()))
            .map_err(|e| Error::Io(e.into()))?;
        Ok(())
    }

    /// Serialize the handle for a worker process environment.
    #[cfg(unix)]
    pub fn to_env_payload(&self) -> Result<String> {
        let payload = SocketPayload {
            kind: self.kind.clone(),
            fd: self.socket.as_raw_fd(),
        };
        serde_json::to_string(&payload).map_err(|e| Error::config(e.to_string()))
    }

    /// Reconstruct a holder from an inherited handle.
    ///
    /// The file descriptor in `payload` must be a listening socket inherited
    /// from the supervisor; ownership transfers to the returned holder.
    #[cfg(unix)]
    pub fn from_env_payload(payload: &str) -> Result<Self> {
        let payload: SocketPayload =
            serde_json::from_str(payload).map_err(|e| Error::config(e.to_string()))?;
        let socket = unsafe { Socket::from_raw_fd(payload.fd as RawFd) };
        Ok(Self {
            socket,
            kind: payload.kind,
        })
    }

    /// Convert into a tokio listener bound to the current runtime.
    pub fn into_listener(self) -> Result<Listener> {
        self.socket.set_nonblocking(true)?;
        match self.kind {
            SocketKind::Tcp => {
                let std_listener: std::net::TcpListener = self.socket.into();
                let listener = tokio::net::TcpListener::from_std(std_listener)?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            SocketKind::Unix(path) => {
                let std_listener = unsafe {
                    std::os::unix::net::UnixListener::from_raw_fd(self.socket.into_raw_fd())
                };
                let listener = tokio::net::UnixListener::from_std(std_listener)?;
                Ok(Listener::Unix(listener, path))
            }
            #[cfg(not(unix))]
            SocketKind::Unix(_) => Err(Error::config(
                "unix domain sockets are not supported on this platform",
            )),
        }
    }

    /// Remove the socket file of a UDS listener. No-op for TCP.
    pub fn cleanup(&self) {
        if let SocketKind::Unix(path) = &self.kind {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A listening socket bound to a tokio runtime.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(tokio::net::TcpListener),
    /// Unix domain socket listener, with the bound path.
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

impl Listener {
    /// Accept one connection, returning the stream and its peer address.
    pub async fn accept(&self) -> IoResult<(Stream, SocketAddr)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Stream::Tcp(stream), SocketAddr::Tcp(peer)))
            }
            #[cfg(unix)]
            Self::Unix(listener, _) => {
                let (stream, peer) = listener.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unnamed".into());
                Ok((Stream::Unix(stream), SocketAddr::Unix(peer)))
            }
        }
    }

    /// The locally bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map_or(SocketAddr::Unknown, SocketAddr::Tcp),
            #[cfg(unix)]
            Self::Unix(_, path) => SocketAddr::Unix(path.to_string_lossy().into_owned()),
        }
    }
}

/// An accepted plaintext connection.
#[derive(Debug)]
pub enum Stream {
    /// TCP stream.
    Tcp(tokio::net::TcpStream),
    /// Unix domain stream.
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<IoResult<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
