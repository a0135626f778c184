use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::{
    event::{EventfdFlags, PollFd, PollFlags, eventfd, poll},
    io::Errno,
};
use snafu::ResultExt;
use tracing::debug;

use crate::{
    peer::PeerWatch,
    protocol::{
        CLOSE_TOKEN, LinkError, SetupFailedSnafu, TransportBrokenSnafu,
        WORD_LEN, decode_word, encode_word,
    },
};

/// Kernel-backed counting semaphore addressed by an fd.
///
/// Each `post` adds its value to the counter; each `wait` blocks until the
/// counter is nonzero, then drains it and returns the accumulated value.
/// The 8-byte transfer either completes fully or fails; there is no partial
/// success.
pub struct SignalCounter {
    fd: OwnedFd,
}

impl SignalCounter {
    /// Fresh counter at zero. Created close-on-exec; the spawn handoff
    /// re-enables inheritance on the slot copies only.
    pub fn new() -> Result<Self, LinkError> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC)
            .map_err(std::io::Error::from)
            .context(SetupFailedSnafu {
                step: "creating signal counter",
            })?;
        Ok(Self { fd })
    }

    /// Adopt an inherited counter handle.
    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Second handle onto the same kernel counter.
    pub(crate) fn try_clone(&self) -> Result<Self, LinkError> {
        let fd = rustix::io::dup(&self.fd)
            .map_err(std::io::Error::from)
            .context(SetupFailedSnafu {
                step: "duplicating signal counter",
            })?;
        Ok(Self { fd })
    }

    /// Add `value` to the counter and wake the waiter. `value` must be at
    /// least 1; a zero write would leave the waiter blocked.
    pub fn post(&self, value: u64) -> Result<(), LinkError> {
        debug_assert!(value >= 1, "a zero post never wakes the waiter");
        let word = encode_word(value);
        loop {
            match rustix::io::write(&self.fd, &word) {
                Ok(WORD_LEN) => return Ok(()),
                Ok(_) => {
                    return Err(LinkError::short_transfer("posting signal"));
                }
                Err(errno) if errno == Errno::INTR => continue,
                Err(errno) => {
                    return Err(std::io::Error::from(errno)).context(
                        TransportBrokenSnafu {
                            during: "posting signal",
                        },
                    );
                }
            }
        }
    }

    /// Block until the counter is nonzero, then drain and return it.
    ///
    /// Peer death observed through `peer` while nothing is pending surfaces
    /// as `TransportBroken`; a signal that was posted before the peer died
    /// is still delivered first.
    pub fn wait(&self, peer: &PeerWatch) -> Result<u64, LinkError> {
        loop {
            if !self.await_readable(peer)? {
                return Err(LinkError::peer_exited("waiting for signal"));
            }
            let mut word = [0u8; WORD_LEN];
            match rustix::io::read(&self.fd, &mut word) {
                Ok(WORD_LEN) => return Ok(decode_word(word)),
                Ok(_) => {
                    return Err(LinkError::short_transfer("waiting for signal"));
                }
                Err(errno) if errno == Errno::INTR => continue,
                Err(errno) => {
                    return Err(std::io::Error::from(errno)).context(
                        TransportBrokenSnafu {
                            during: "waiting for signal",
                        },
                    );
                }
            }
        }
    }

    /// Returns true once the counter is readable, false if the peer died
    /// with nothing pending. Pending data wins over observed death.
    fn await_readable(&self, peer: &PeerWatch) -> Result<bool, LinkError> {
        let Some(pidfd) = peer.as_fd() else {
            // no liveness probe; let the read itself block
            return Ok(true);
        };

        loop {
            let mut fds = [
                PollFd::new(&self.fd, PollFlags::IN),
                PollFd::from_borrowed_fd(pidfd, PollFlags::IN),
            ];
            match poll(&mut fds, -1) {
                Ok(_) => {
                    if fds[0].revents().contains(PollFlags::IN) {
                        return Ok(true);
                    }
                    if !fds[1].revents().is_empty() {
                        return Ok(false);
                    }
                }
                Err(errno) if errno == Errno::INTR => continue,
                Err(errno) => {
                    return Err(std::io::Error::from(errno)).context(
                        TransportBrokenSnafu {
                            during: "polling for signal",
                        },
                    );
                }
            }
        }
    }
}

impl AsFd for SignalCounter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Duplicated handles onto an endpoint's signal counters, held outside the
/// channel locks. `announce` posts the reserved close word on every
/// counter, so each role blocked on one of them, on either side of the
/// transport, unwinds with a transport error instead of parking forever.
pub(crate) struct CloseAnnouncer {
    counters: Vec<SignalCounter>,
}

impl CloseAnnouncer {
    pub(crate) fn watching(
        counters: &[&SignalCounter],
    ) -> Result<Self, LinkError> {
        let counters = counters
            .iter()
            .map(|counter| counter.try_clone())
            .collect::<Result<_, _>>()?;
        Ok(Self { counters })
    }

    pub(crate) fn announce(&self) {
        for counter in &self.counters {
            if let Err(err) = counter.post(CLOSE_TOKEN) {
                debug!("close announcement not delivered: {err}");
            }
        }
    }
}
