use std::sync::{
    Arc,
    atomic::{Ordering, fence},
};

use memmap2::{Mmap, MmapMut};
use snafu::ensure;

use crate::{
    peer::PeerWatch,
    protocol::{
        ACK_TOKEN, CLOSE_TOKEN, EmptyPayloadSnafu, LinkError,
        PayloadTooLargeSnafu, ProtocolViolationSnafu,
    },
    region::SharedRegion,
    signal::SignalCounter,
};

/// Sending half of a simplex channel: writable mapping plus the two signal
/// counters. At most one frame is in flight; `send` does not return until
/// the receiver has acknowledged, at which point the region is owned by the
/// sender again.
///
/// Field order matters: mappings drop before the handles backing them.
pub struct SenderChannel {
    map: MmapMut,
    signal: SignalCounter,
    ack: SignalCounter,
    region: SharedRegion,
    peer: Arc<PeerWatch>,
}

impl SenderChannel {
    pub(crate) fn new(
        map: MmapMut,
        signal: SignalCounter,
        ack: SignalCounter,
        region: SharedRegion,
        peer: Arc<PeerWatch>,
    ) -> Self {
        Self {
            map,
            signal,
            ack,
            region,
            peer,
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Copy `payload` into the region, post its length, and block until the
    /// receiver acknowledges. Rejections (empty or oversized payloads)
    /// happen before anything is posted and leave the channel idle.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        ensure!(!payload.is_empty(), EmptyPayloadSnafu);
        ensure!(
            payload.len() <= self.capacity(),
            PayloadTooLargeSnafu {
                len: payload.len(),
                capacity: self.capacity(),
            }
        );

        self.map[..payload.len()].copy_from_slice(payload);
        // publish the bytes before the counter write that announces them
        fence(Ordering::Release);
        self.signal.post(payload.len() as u64)?;

        // the accumulated ack count is 1 while one frame is in flight; the
        // reserved close word means the peer went away instead of acking
        let acks = self.ack.wait(&self.peer)?;
        if acks >= CLOSE_TOKEN {
            return Err(LinkError::peer_closed("awaiting acknowledgment"));
        }
        Ok(())
    }
}

/// Receiving half of a simplex channel: read-only mapping plus the two
/// signal counters. Between the length wait returning and the ack post the
/// region belongs to the receiver; the ack hands it back.
pub struct ReceiverChannel {
    map: Mmap,
    signal: SignalCounter,
    ack: SignalCounter,
    region: SharedRegion,
    peer: Arc<PeerWatch>,
}

impl ReceiverChannel {
    pub(crate) fn new(
        map: Mmap,
        signal: SignalCounter,
        ack: SignalCounter,
        region: SharedRegion,
        peer: Arc<PeerWatch>,
    ) -> Self {
        Self {
            map,
            signal,
            ack,
            region,
            peer,
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Wait for a frame and hand `handler` a view over its bytes. The view
    /// aliases the shared region and must not be retained past the handler;
    /// the acknowledgment is posted only after the handler returns.
    ///
    /// A frame announcing more bytes than the region holds is a fatal
    /// protocol violation and is never acknowledged.
    pub fn receive_with<T>(
        &mut self,
        handler: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, LinkError> {
        let announced = self.signal.wait(&self.peer)?;
        if announced >= CLOSE_TOKEN {
            return Err(LinkError::peer_closed("waiting for a frame"));
        }
        let capacity = self.capacity();
        ensure!(
            announced <= capacity as u64,
            ProtocolViolationSnafu {
                announced,
                capacity
            }
        );

        // pair with the sender's release fence before its length post
        fence(Ordering::Acquire);
        let out = handler(&self.map[..announced as usize]);

        self.ack.post(ACK_TOKEN)?;
        Ok(out)
    }

    /// Wait for a frame and copy it out before acknowledging.
    pub fn receive(&mut self) -> Result<Vec<u8>, LinkError> {
        self.receive_with(|frame| frame.to_vec())
    }
}
