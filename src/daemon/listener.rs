use crate::util::logging::{info, warn};
use anyhow::{Context, Result};
use std::ffi::CString;
use std::fmt;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, UnixListener};

pub const BIND_ATTEMPTS: usize = 3;

/// Where to listen: a value that parses as an integer is a TCP port,
/// anything else is a filesystem socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(u16),
    Unix(PathBuf),
}

impl ListenAddr {
    pub fn parse(value: &str) -> Self {
        match value.trim().parse::<u16>() {
            Ok(port) => Self::Tcp(port),
            Err(_) => Self::Unix(PathBuf::from(value)),
        }
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Self::Unix(path) => Some(path),
            Self::Tcp(_) => None,
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(port) => write!(f, "port {port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug)]
pub enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Bind `addr`, retrying up to three times. An address-in-use failure
/// on a unix path removes the stale socket file left by a previous
/// process before the next attempt; every failure consumes an attempt
/// and the last error propagates once they are exhausted.
pub async fn acquire(addr: &ListenAddr) -> Result<BoundListener> {
    let mut last_err = None;
    for attempt in 1..=BIND_ATTEMPTS {
        match bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("bound {addr} on attempt {attempt}");
                }
                return Ok(listener);
            }
            Err(e) => {
                warn!("bind attempt {attempt}/{BIND_ATTEMPTS} on {addr} failed: {e}");
                if e.kind() == ErrorKind::AddrInUse {
                    if let ListenAddr::Unix(path) = addr {
                        remove_stale_socket(path);
                    }
                }
                last_err = Some(anyhow::Error::new(e));
            }
        }
    }
    let err = last_err.unwrap_or_else(|| anyhow::anyhow!("no bind attempts made"));
    Err(err.context(format!("failed to bind {addr} after {BIND_ATTEMPTS} attempts")))
}

async fn bind(addr: &ListenAddr) -> std::io::Result<BoundListener> {
    match addr {
        ListenAddr::Tcp(port) => TcpListener::bind(("0.0.0.0", *port))
            .await
            .map(BoundListener::Tcp),
        ListenAddr::Unix(path) => UnixListener::bind(path).map(BoundListener::Unix),
    }
}

fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove stale socket {}: {e}", path.display()),
    }
}

/// Hand the socket to the owner of the daemon executable and drop the
/// process to that identity. Runs after serving has started; callers
/// log a failure instead of tearing down accepted connections.
pub fn drop_privileges(socket: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("resolve daemon executable")?;
    let meta = std::fs::metadata(&exe)
        .with_context(|| format!("stat daemon executable {}", exe.display()))?;
    let (uid, gid) = (meta.uid(), meta.gid());

    let c_path = CString::new(socket.as_os_str().as_bytes())
        .context("socket path contains interior NUL")?;
    check(unsafe { libc::chown(c_path.as_ptr(), uid, gid) }, "chown socket")?;
    // Group first; setgid is no longer permitted once uid drops.
    check(unsafe { libc::setgid(gid) }, "setgid")?;
    check(unsafe { libc::setuid(uid) }, "setuid")?;
    info!(
        "dropped privileges to uid {uid} gid {gid} (owner of {})",
        exe.display()
    );
    Ok(())
}

fn check(rc: libc::c_int, what: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(anyhow::Error::new(std::io::Error::last_os_error()).context(what.to_string()))
    }
}
