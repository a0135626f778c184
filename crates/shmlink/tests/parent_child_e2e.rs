//! End-to-end tests that drive the real shmlink binary as the child
//! process, through the full spawn/inherit/map handshake.

use std::sync::Once;

use shmlink_common::{LinkError, ParentEndpoint};

const MIB: usize = 1024 * 1024;

static INIT: Once = Once::new();

fn test_setup() {
    INIT.call_once(|| {
        let _ = color_eyre::install();
    });
}

fn child_binary() -> &'static str {
    env!("CARGO_BIN_EXE_shmlink")
}

fn started(shm_size: usize) -> ParentEndpoint {
    let endpoint = ParentEndpoint::new(child_binary(), shm_size);
    endpoint.start().expect("start should succeed");
    endpoint
}

#[test]
fn hello_round_trip() {
    test_setup();
    let endpoint = started(MIB);

    endpoint.send(b"Hello from parent 0").unwrap();
    assert_eq!(endpoint.receive().unwrap(), b"Hello from parent 0");

    endpoint.close();
}

#[test]
fn binary_bytes_round_trip() {
    test_setup();
    let endpoint = started(MIB);

    endpoint.send(&[0x00, 0xff, 0x00, 0xff]).unwrap();
    assert_eq!(endpoint.receive().unwrap(), &[0x00, 0xff, 0x00, 0xff]);

    endpoint.close();
}

#[test]
fn full_region_pattern_round_trip() {
    test_setup();
    let endpoint = started(MIB);

    let payload: Vec<u8> = (0..MIB).map(|i| (i % 256) as u8).collect();
    endpoint.send(&payload).unwrap();
    assert_eq!(endpoint.receive().unwrap(), payload);

    endpoint.close();
}

#[test]
fn oversized_send_is_rejected_and_the_channel_stays_usable() {
    test_setup();
    let endpoint = started(MIB);

    let too_big = vec![0x5au8; MIB + 1];
    let err = endpoint.send(&too_big).unwrap_err();
    assert!(matches!(err, LinkError::PayloadTooLarge { .. }));
    assert!(err.is_recoverable());

    endpoint.send(b"0123456789abcdef").unwrap();
    assert_eq!(endpoint.receive().unwrap(), b"0123456789abcdef");

    endpoint.close();
}

#[test]
fn five_round_ping_pong_in_order() {
    test_setup();
    let endpoint = started(MIB);

    for round in 0..5 {
        let ping = format!("ping {round}");
        endpoint.send(ping.as_bytes()).unwrap();
        let reply = endpoint.receive().unwrap();
        assert_eq!(reply, ping.as_bytes(), "round {round} out of order");
    }

    endpoint.close();
}

#[test]
fn child_death_surfaces_as_transport_broken() {
    test_setup();
    let endpoint = started(MIB);

    // one round so the child is known to be past setup
    endpoint.send(b"warmup").unwrap();
    endpoint.receive().unwrap();

    let pid = endpoint.child_id().expect("child is running") as i32;
    assert_eq!(unsafe { libc::kill(pid, libc::SIGKILL) }, 0);

    let err = endpoint.send(b"after death").unwrap_err();
    assert!(matches!(err, LinkError::TransportBroken { .. }));
    assert!(!err.is_recoverable());

    endpoint.close();
}

#[test]
fn parent_close_lets_a_blocked_child_wind_down_cleanly() {
    test_setup();
    let endpoint = started(MIB);

    // after the round trip the child is parked inside listen again
    endpoint.send(b"warmup").unwrap();
    endpoint.receive().unwrap();
    let pid = endpoint.child_id().expect("child is running") as i32;

    endpoint.close();

    // the close announcement made the child's blocked listen return
    // TransportBroken; the driver maps that to a clean exit, so the child
    // must have exited by itself rather than dying to a signal
    let status = endpoint
        .child_exit_status()
        .expect("close reaps the child");
    assert!(
        status.success(),
        "child should wind down cleanly, got {status}"
    );
    assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ESRCH)
    );
}

#[test]
fn close_is_idempotent_and_reaps_the_child() {
    test_setup();
    let endpoint = started(MIB);

    endpoint.send(b"warmup").unwrap();
    endpoint.receive().unwrap();
    let pid = endpoint.child_id().expect("child is running") as i32;

    endpoint.close();
    endpoint.close();

    // reaped, so the pid is no longer observable in the process table
    assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ESRCH)
    );

    let err = endpoint.send(b"after close").unwrap_err();
    assert!(matches!(err, LinkError::Inactive));
}

#[test]
fn start_with_a_missing_child_binary_fails_cleanly() {
    test_setup();
    let endpoint = ParentEndpoint::new("/nonexistent/shmlink-child", MIB);
    let err = endpoint.start().unwrap_err();
    assert!(matches!(err, LinkError::SpawnFailed { .. }));

    // close after a failed start is a no-op, not a crash
    endpoint.close();
}

#[test]
fn restart_after_close_builds_a_fresh_transport() {
    test_setup();
    let endpoint = started(MIB);
    endpoint.send(b"first life").unwrap();
    endpoint.receive().unwrap();
    endpoint.close();

    endpoint.start().expect("restart should succeed");
    endpoint.send(b"second life").unwrap();
    assert_eq!(endpoint.receive().unwrap(), b"second life");
    endpoint.close();
}
