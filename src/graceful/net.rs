//! Listener inheritance across graceful restarts.
//!
//! A restarted child receives its parent's listening sockets as file
//! descriptors starting at 3, with their count in `LISTEN_FDS` (the
//! systemd socket-activation convention). Servers ask for a listener by
//! address; an inherited socket bound to that address is reused, otherwise
//! a fresh one is bound.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Mutex, MutexGuard, PoisonError};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

/// First inherited descriptor.
#[cfg(unix)]
const LISTEN_FDS_START: i32 = 3;

/// Listening sockets inherited from a parent and handed out to servers.
pub(crate) struct Listeners {
    /// Inherited sockets not yet claimed by a server.
    provided: Mutex<Vec<TcpListener>>,
    /// Every socket currently serving, passed on at the next restart.
    active: Mutex<Vec<TcpListener>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Listeners {
    pub fn empty() -> Self {
        Self {
            provided: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Pick up sockets passed through `LISTEN_FDS`.
    pub fn from_env() -> Self {
        let listeners = Self::empty();
        match inherited() {
            Ok(provided) => {
                if !provided.is_empty() {
                    info!(count = provided.len(), "inherited listeners");
                }
                *lock(&listeners.provided) = provided;
            }
            Err(e) => warn!(error = %e, "unable to inherit listeners"),
        }
        listeners
    }

    pub fn provided_count(&self) -> usize {
        lock(&self.provided).len()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Claim the inherited listener bound to `addr`, or bind a new one.
    pub fn get_listener(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let inherited = {
            let mut provided = lock(&self.provided);
            provided
                .iter()
                .position(|l| l.local_addr().map(|a| a == addr).unwrap_or(false))
                .map(|idx| provided.remove(idx))
        };

        let listener = match inherited {
            Some(listener) => {
                debug!(%addr, "reusing inherited listener");
                listener
            }
            None => bind_listener(addr)?,
        };

        lock(&self.active).push(listener.try_clone()?);
        Ok(listener)
    }

    /// Drop our copy of the active listener bound to `addr`; false if none is tracked.
    pub fn release(&self, addr: SocketAddr) -> bool {
        let mut active = lock(&self.active);
        match active
            .iter()
            .position(|l| l.local_addr().map(|a| a == addr).unwrap_or(false))
        {
            Some(idx) => {
                active.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Close inherited listeners no server claimed.
    pub fn close_provided(&self) {
        let unused = std::mem::take(&mut *lock(&self.provided));
        for listener in unused {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "closing unused inherited listener");
            }
        }
    }

    /// Start a copy of this process that inherits the active listeners.
    pub fn restart_process(&self) -> io::Result<u32> {
        let active = lock(&self.active);
        restart_process(&active)
    }
}

/// Bind a listening TCP socket the way the admin and public servers expect it.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// True when this process was started by a parent handing over its sockets.
pub(crate) fn is_child() -> bool {
    let has_fds = std::env::var("LISTEN_FDS")
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    #[cfg(unix)]
    {
        // SAFETY: getppid has no preconditions
        has_fds && unsafe { libc::getppid() } > 1
    }
    #[cfg(not(unix))]
    {
        has_fds
    }
}

#[cfg(unix)]
fn inherited() -> io::Result<Vec<TcpListener>> {
    use std::os::fd::FromRawFd;

    let count: i32 = match std::env::var("LISTEN_FDS") {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("LISTEN_FDS: {}", e)))?,
        _ => return Ok(Vec::new()),
    };

    if let Ok(pid) = std::env::var("LISTEN_PID") {
        // SAFETY: getpid has no preconditions
        let ours = unsafe { libc::getpid() };
        if pid.parse::<i32>().ok() != Some(ours) {
            debug!(listen_pid = %pid, "LISTEN_FDS addressed to another process");
            return Ok(Vec::new());
        }
    }

    let mut listeners = Vec::with_capacity(count.max(0) as usize);
    for fd in LISTEN_FDS_START..LISTEN_FDS_START + count {
        // SAFETY: the parent passed these descriptors to us and nothing else owns them
        let socket = unsafe { Socket::from_raw_fd(fd) };
        match socket.local_addr().ok().and_then(|a| a.as_socket()) {
            Some(addr) if socket.r#type().ok() == Some(Type::STREAM) => {
                socket.set_cloexec(true)?;
                socket.set_nonblocking(true)?;
                debug!(fd, %addr, "inherited listener");
                listeners.push(socket.into());
            }
            _ => warn!(fd, "inherited descriptor is not a TCP listener, closing"),
        }
    }
    Ok(listeners)
}

#[cfg(not(unix))]
fn inherited() -> io::Result<Vec<TcpListener>> {
    Ok(Vec::new())
}

#[cfg(unix)]
fn restart_process(active: &[TcpListener]) -> io::Result<u32> {
    use std::os::fd::AsRawFd;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    let exe = std::env::current_exe()?;
    let floor = LISTEN_FDS_START + active.len() as i32;

    // Park copies above the target range so dup2 in the child cannot clobber them
    let mut parked = Vec::with_capacity(active.len());
    for listener in active {
        // SAFETY: fcntl on a descriptor we own
        let fd = unsafe { libc::fcntl(listener.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            close_all(&parked);
            return Err(err);
        }
        parked.push(fd);
    }

    let targets = parked.clone();
    let mut cmd = Command::new(exe);
    cmd.args(std::env::args_os().skip(1))
        .env("LISTEN_FDS", active.len().to_string())
        .env_remove("LISTEN_PID");

    // SAFETY: only async-signal-safe calls between fork and exec
    unsafe {
        cmd.pre_exec(move || {
            for (i, fd) in targets.iter().enumerate() {
                if libc::dup2(*fd, LISTEN_FDS_START + i as i32) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let spawned = cmd.spawn();
    close_all(&parked);
    let child = spawned?;
    info!(pid = child.id(), listeners = active.len(), "started replacement process");
    Ok(child.id())
}

#[cfg(unix)]
fn close_all(fds: &[i32]) {
    for fd in fds {
        // SAFETY: closing descriptors duplicated above
        unsafe {
            libc::close(*fd);
        }
    }
}

#[cfg(not(unix))]
fn restart_process(_active: &[TcpListener]) -> io::Result<u32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful restart requires unix",
    ))
}

/// Ask the parent process to shut down once the child is serving.
#[cfg(unix)]
pub(crate) fn kill_parent() -> io::Result<()> {
    // SAFETY: plain syscalls with no memory arguments
    let rc = unsafe { libc::kill(libc::getppid(), libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_parent() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signalling the parent requires unix",
    ))
}
