use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::process::{Pid, PidfdFlags, getppid, pidfd_open};
use tracing::warn;

/// Liveness probe for the process on the other end of a channel.
///
/// An eventfd read never unblocks when its peer dies (the counter object
/// has no reader or writer ends), so every blocking wait polls the peer's
/// pidfd alongside the counter. Without a pidfd the wait degrades to a
/// plain blocking read and peer death goes unnoticed until the supervising
/// side reaps the process.
pub struct PeerWatch {
    pidfd: Option<OwnedFd>,
}

impl PeerWatch {
    /// Watch an already-spawned peer by pid.
    pub fn for_pid(pid: u32) -> Self {
        let Some(pid) = Pid::from_raw(pid as i32) else {
            warn!(pid, "invalid peer pid, waits will not observe peer death");
            return Self { pidfd: None };
        };
        Self::open(pid)
    }

    /// Watch the process that spawned us.
    pub fn of_parent() -> Self {
        let Some(pid) = getppid() else {
            warn!("no parent pid, waits will not observe peer death");
            return Self { pidfd: None };
        };
        Self::open(pid)
    }

    /// No liveness probe at all; single-process loopback setups only.
    pub(crate) fn disabled() -> Self {
        Self { pidfd: None }
    }

    fn open(pid: Pid) -> Self {
        match pidfd_open(pid, PidfdFlags::empty()) {
            Ok(pidfd) => Self { pidfd: Some(pidfd) },
            Err(errno) => {
                // pre-5.3 kernels; fall back to unguarded blocking waits
                warn!(
                    %errno,
                    "pidfd_open unavailable, waits will not observe peer death"
                );
                Self { pidfd: None }
            }
        }
    }

    pub(crate) fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.pidfd.as_ref().map(|fd| fd.as_fd())
    }
}
