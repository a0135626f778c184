use std::{backtrace::Backtrace, os::fd::RawFd};

use snafu::Snafu;

/// First inherited handle slot; 0..2 stay reserved for the standard streams.
pub const FIRST_SLOT: RawFd = 3;

/// Every counter word on the wire is one unsigned 64-bit little-endian value.
pub(crate) const WORD_LEN: usize = 8;

/// Acknowledgments always carry this value; the sender drains and discards
/// the accumulated count, which is 1 while only one frame is in flight.
pub const ACK_TOKEN: u64 = 1;

/// Counter words at or above this value announce that the posting endpoint
/// has closed. No region capacity or ack count can reach it, and even with
/// both endpoints closing over a pending word the counter stays below the
/// eventfd ceiling.
pub(crate) const CLOSE_TOKEN: u64 = 1 << 62;

pub(crate) fn encode_word(value: u64) -> [u8; WORD_LEN] {
    value.to_le_bytes()
}

pub(crate) fn decode_word(raw: [u8; WORD_LEN]) -> u64 {
    u64::from_le_bytes(raw)
}

/// The six numeric slots a freshly spawned child finds its transport
/// handles at, in spawn order: send signal, ack signal and region for the
/// parent-to-child direction, then the same triple for child-to-parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleSlots {
    pub p2c_signal: RawFd,
    pub p2c_ack: RawFd,
    pub p2c_region: RawFd,
    pub c2p_signal: RawFd,
    pub c2p_ack: RawFd,
    pub c2p_region: RawFd,
}

impl HandleSlots {
    pub const fn fixed() -> Self {
        Self {
            p2c_signal: FIRST_SLOT,
            p2c_ack: FIRST_SLOT + 1,
            p2c_region: FIRST_SLOT + 2,
            c2p_signal: FIRST_SLOT + 3,
            c2p_ack: FIRST_SLOT + 4,
            c2p_region: FIRST_SLOT + 5,
        }
    }

    pub(crate) const fn in_spawn_order(&self) -> [RawFd; 6] {
        [
            self.p2c_signal,
            self.p2c_ack,
            self.p2c_region,
            self.c2p_signal,
            self.c2p_ack,
            self.c2p_region,
        ]
    }
}

impl Default for HandleSlots {
    fn default() -> Self {
        Self::fixed()
    }
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum LinkError {
    #[snafu(display("setup failed while {step}: {source}"))]
    SetupFailed {
        step: &'static str,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("could not spawn child process: {source}"))]
    SpawnFailed {
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display(
        "payload of {len} bytes exceeds the region capacity of {capacity} bytes"
    ))]
    PayloadTooLarge { len: usize, capacity: usize },

    #[snafu(display("zero-length payloads cannot be posted"))]
    EmptyPayload,

    #[snafu(display("transport broken while {during}: {source}"))]
    TransportBroken {
        during: &'static str,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display(
        "peer announced a {announced}-byte frame but the region holds {capacity}"
    ))]
    ProtocolViolation {
        announced: u64,
        capacity: usize,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("endpoint is not active"))]
    Inactive,

    #[snafu(display("endpoint is already active"))]
    AlreadyActive,
}

impl LinkError {
    pub(crate) fn peer_exited(during: &'static str) -> Self {
        LinkError::TransportBroken {
            during,
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer process exited",
            ),
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn peer_closed(during: &'static str) -> Self {
        LinkError::TransportBroken {
            during,
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer closed the channel",
            ),
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn short_transfer(during: &'static str) -> Self {
        LinkError::TransportBroken {
            during,
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "counter transferred fewer than 8 bytes",
            ),
            backtrace: Backtrace::capture(),
        }
    }

    /// True for rejections that leave the channel idle and reusable; every
    /// other error leaves the endpoint fit only for `close`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::PayloadTooLarge { .. } | LinkError::EmptyPayload
        )
    }
}
