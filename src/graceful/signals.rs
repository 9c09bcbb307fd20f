//! Process signal handling.

use tracing::{info, warn};

use super::Manager;

impl Manager {
    /// Spawn the signal loop.
    ///
    /// | Signal          | Action                      |
    /// |-----------------|-----------------------------|
    /// | SIGHUP          | graceful restart            |
    /// | SIGUSR1         | logged (log reopen hook)    |
    /// | SIGUSR2         | immediate hammer            |
    /// | SIGINT, SIGTERM | graceful shutdown           |
    /// | SIGTSTP         | logged                      |
    ///
    /// The loop exits once the manager is done.
    #[cfg(unix)]
    pub fn handle_signals(&self) -> std::io::Result<tokio::task::JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut tstp = signal(SignalKind::from_raw(libc::SIGTSTP))?;

        let manager = self.clone();
        let done = self.done_token();
        let pid = std::process::id();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = hangup.recv() => {
                        info!(pid, "received SIGHUP, attempting graceful restart");
                        manager.do_graceful_restart();
                    }
                    _ = usr1.recv() => {
                        info!(pid, "received SIGUSR1, logs are written to stdout and need no reopen");
                    }
                    _ = usr2.recv() => {
                        warn!(pid, "received SIGUSR2, hammering");
                        manager.do_immediate_hammer();
                    }
                    _ = interrupt.recv() => {
                        warn!(pid, "received SIGINT, shutting down");
                        manager.do_graceful_shutdown();
                    }
                    _ = terminate.recv() => {
                        warn!(pid, "received SIGTERM, shutting down");
                        manager.do_graceful_shutdown();
                    }
                    _ = tstp.recv() => {
                        info!(pid, "received SIGTSTP");
                    }
                }
            }
            info!(pid, "signal handling stopped");
        }))
    }

    /// Spawn the signal loop: Ctrl-C triggers a graceful shutdown.
    #[cfg(not(unix))]
    pub fn handle_signals(&self) -> std::io::Result<tokio::task::JoinHandle<()>> {
        let manager = self.clone();
        let done = self.done_token();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "unable to listen for Ctrl-C");
                            break;
                        }
                        warn!("received Ctrl-C, shutting down");
                        manager.do_graceful_shutdown();
                    }
                }
            }
        }))
    }
}
