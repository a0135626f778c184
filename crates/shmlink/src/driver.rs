use std::{
    sync::{Arc, mpsc},
    thread,
};

use shmlink_common::{
    ChildEndpoint, HandleSlots, LinkError, ParentEndpoint,
};
use tracing::{error, info};

use crate::cli::Args;

/// Spawn the child, run the configured number of ping rounds against its
/// echo loop, then tear everything down.
pub fn run_parent(args: &Args) -> Result<(), LinkError> {
    let child_path = args
        .child
        .as_ref()
        .expect("clap requires --child in parent mode");

    let endpoint = ParentEndpoint::new(child_path, args.shm_size);
    endpoint.start()?;
    info!(
        pid = endpoint.child_id(),
        shm_size = args.shm_size,
        "transport up"
    );

    for round in 0..args.rounds {
        let ping = format!("ping {round}");
        endpoint.send(ping.as_bytes())?;
        let reply = endpoint.receive()?;
        info!(
            round,
            reply = %String::from_utf8_lossy(&reply),
            "round trip complete"
        );
    }

    endpoint.close();
    info!("transport closed");
    Ok(())
}

/// Echo responder: `listen` runs on this thread and queues every frame to
/// a dedicated sender thread, which replays it on the child-to-parent
/// channel. Replying from inside the listen handler would deadlock the
/// handshake: the parent is still blocked awaiting the ack that `listen`
/// only posts after the handler returns.
pub fn run_child(args: &Args) -> Result<(), LinkError> {
    let slots = HandleSlots {
        p2c_signal: args.fd_p2c_send,
        p2c_ack: args.fd_p2c_ack,
        p2c_region: args.fd_p2c_shm,
        c2p_signal: args.fd_c2p_send,
        c2p_ack: args.fd_c2p_ack,
        c2p_region: args.fd_c2p_shm,
    };
    // spawned under the handle-inheritance contract, so the slots hold the
    // six live transport handles and nothing else has claimed them
    let endpoint =
        Arc::new(unsafe { ChildEndpoint::from_slots(slots, args.shm_size) }?);
    info!(shm_size = args.shm_size, "child endpoint up, echoing");

    let (queue, frames) = mpsc::channel::<Vec<u8>>();
    let echoer = {
        let endpoint = endpoint.clone();
        thread::spawn(move || {
            while let Ok(frame) = frames.recv() {
                if let Err(err) = endpoint.send(&frame) {
                    error!("echo send failed: {err}");
                    break;
                }
            }
        })
    };

    let outcome = endpoint.listen(|frame| {
        let _ = queue.send(frame.to_vec());
    });

    // listen only returns on a broken transport; the parent going away is
    // the normal end of this process's life
    let result = match outcome {
        Err(LinkError::TransportBroken { .. }) => {
            info!("parent went away, shutting down");
            Ok(())
        }
        other => other,
    };

    let _ = echoer.join();
    endpoint.close();
    result
}
