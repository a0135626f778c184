use std::{
    os::fd::{FromRawFd, OwnedFd},
    sync::{Arc, Mutex},
};

use snafu::OptionExt;
use tracing::debug;

use crate::{
    channel::{ReceiverChannel, SenderChannel},
    peer::PeerWatch,
    protocol::{HandleSlots, InactiveSnafu, LinkError},
    region::SharedRegion,
    signal::{CloseAnnouncer, SignalCounter},
};

/// Child side of the transport, built from the six handles inherited at
/// the well-known slots: parent-to-child mapped read-only, child-to-parent
/// mapped read-write, and a liveness watch on the parent.
///
/// The receiving role (`listen`) and the sending role (`send`) are guarded
/// by independent mutexes; the usual shape is `listen` on the main thread
/// and `send` from a second one.
pub struct ChildEndpoint {
    outbound: Mutex<Option<SenderChannel>>,
    inbound: Mutex<Option<ReceiverChannel>>,
    announcer: Mutex<Option<CloseAnnouncer>>,
}

impl ChildEndpoint {
    /// Adopt the handles at the fixed slots 3..8.
    ///
    /// # Safety
    ///
    /// The slots must hold the six live transport handles inherited from
    /// the parent, in the documented order, sized to `shm_size`, and must
    /// not be claimed by anything else in this process (including a second
    /// call to this constructor).
    pub unsafe fn new(shm_size: usize) -> Result<Self, LinkError> {
        unsafe { Self::from_slots(HandleSlots::fixed(), shm_size) }
    }

    /// Adopt the handles at caller-provided slots.
    ///
    /// # Safety
    ///
    /// As for [`ChildEndpoint::new`], for the given slots.
    pub unsafe fn from_slots(
        slots: HandleSlots,
        shm_size: usize,
    ) -> Result<Self, LinkError> {
        let owned =
            |fd| SignalCounter::from_owned(unsafe { OwnedFd::from_raw_fd(fd) });
        let p2c_signal = owned(slots.p2c_signal);
        let p2c_ack = owned(slots.p2c_ack);
        let p2c_region = SharedRegion::from_owned(
            unsafe { OwnedFd::from_raw_fd(slots.p2c_region) },
            shm_size,
        );
        let c2p_signal = owned(slots.c2p_signal);
        let c2p_ack = owned(slots.c2p_ack);
        let c2p_region = SharedRegion::from_owned(
            unsafe { OwnedFd::from_raw_fd(slots.c2p_region) },
            shm_size,
        );

        let announcer = CloseAnnouncer::watching(&[
            &p2c_signal,
            &p2c_ack,
            &c2p_signal,
            &c2p_ack,
        ])?;

        let p2c_map = p2c_region.map_reader()?;
        let c2p_map = c2p_region.map_writer()?;
        debug!(shm_size, "mapped both inherited regions");

        let peer = Arc::new(PeerWatch::of_parent());
        Ok(Self {
            announcer: Mutex::new(Some(announcer)),
            inbound: Mutex::new(Some(ReceiverChannel::new(
                p2c_map,
                p2c_signal,
                p2c_ack,
                p2c_region,
                peer.clone(),
            ))),
            outbound: Mutex::new(Some(SenderChannel::new(
                c2p_map,
                c2p_signal,
                c2p_ack,
                c2p_region,
                peer,
            ))),
        })
    }

    /// Receive frames forever, handing each one to `handler` as a view
    /// over the shared region. The view is valid only until `handler`
    /// returns; the acknowledgment is posted right after, so bytes that
    /// must outlive it have to be copied. Returns only with a fatal error
    /// (most commonly the parent going away).
    pub fn listen<F>(&self, mut handler: F) -> Result<(), LinkError>
    where
        F: FnMut(&[u8]),
    {
        let mut guard = self.inbound.lock().unwrap();
        let channel = guard.as_mut().context(InactiveSnafu)?;
        loop {
            channel.receive_with(&mut handler)?;
        }
    }

    /// Send one message on the child-to-parent channel; blocks until the
    /// parent acknowledges it.
    pub fn send(&self, payload: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.outbound.lock().unwrap();
        let channel = guard.as_mut().context(InactiveSnafu)?;
        channel.send(payload)
    }

    /// Release both mappings and the inherited handles. Idempotent. The
    /// close is announced on all four counters first, so any role still
    /// blocked on either side (our own `listen` on another thread, or the
    /// parent's pending `send` or `receive`) unwinds with
    /// `TransportBroken` instead of parking forever.
    pub fn close(&self) {
        if let Some(announcer) = self.announcer.lock().unwrap().take() {
            announcer.announce();
        }
        drop(self.inbound.lock().unwrap().take());
        drop(self.outbound.lock().unwrap().take());
    }
}

impl Drop for ChildEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}
