//! Process-group termination.

use std::time::Duration;

use tokio::process::Child;

/// Handle to the process group led by a spawned installer.
///
/// The child is started with `process_group(0)`, so its pid is also the
/// group id and every descendant that doesn't create its own session shares
/// it.
#[derive(Debug, Clone, Copy)]
pub struct ProcessTree {
    pgid: Option<u32>,
}

impl ProcessTree {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    pub fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    /// Stop the whole tree: SIGTERM, wait up to `grace` for the leader, then
    /// SIGKILL whatever is left in the group.
    ///
    /// Always reaps the leader before returning.
    pub async fn terminate(&self, child: &mut Child, grace: Duration) {
        self.signal_term();

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {
                // Leader is gone; descendants may still hold the group.
                self.signal_kill();
            }
            Err(_) => {
                tracing::warn!(
                    pgid = ?self.pgid,
                    grace_secs = grace.as_secs_f64(),
                    "Process group ignored SIGTERM, sending SIGKILL"
                );
                self.signal_kill();
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "start_kill after SIGKILL");
                }
                if let Err(e) = child.wait().await {
                    tracing::warn!(error = %e, "Failed to reap killed installer");
                }
            }
        }
    }

    /// SIGKILL whatever is still in the group after the leader has exited.
    pub fn kill_remaining(&self) {
        self.signal_kill();
    }

    #[cfg(unix)]
    fn signal_term(&self) {
        self.send(nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(unix)]
    fn signal_kill(&self) {
        self.send(nix::sys::signal::Signal::SIGKILL);
    }

    #[cfg(unix)]
    fn send(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) => tracing::debug!(pgid, ?signal, "Signalled process group"),
            Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pgid, ?signal, error = %e, "Failed to signal process group"),
        }
    }

    #[cfg(not(unix))]
    fn signal_term(&self) {}

    #[cfg(not(unix))]
    fn signal_kill(&self) {}
}
