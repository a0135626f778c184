use std::{
    os::{
        fd::{AsFd, AsRawFd, RawFd},
        unix::process::CommandExt,
    },
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use rustix::process::{Pid, Signal, kill_process};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    channel::{ReceiverChannel, SenderChannel},
    peer::PeerWatch,
    protocol::{
        AlreadyActiveSnafu, HandleSlots, InactiveSnafu, LinkError,
        SpawnFailedSnafu,
    },
    region::SharedRegion,
    signal::{CloseAnnouncer, SignalCounter},
};

/// How long the child gets at each rung of the teardown ladder (wind down
/// on its own, then exit on SIGTERM) before the next escalation.
const REAP_PATIENCE: Duration = Duration::from_secs(2);

/// Parent side of the transport: owns both simplex channels and the child
/// process they connect to.
///
/// Constructed inactive; `start` allocates the six kernel objects, maps the
/// regions and spawns the child with the handles inherited at the
/// well-known slots. The two channel roles are guarded by independent
/// mutexes, so one thread may block in `send` while another blocks in
/// `receive`.
pub struct ParentEndpoint {
    child_path: PathBuf,
    shm_size: usize,
    outbound: Mutex<Option<SenderChannel>>,
    inbound: Mutex<Option<ReceiverChannel>>,
    announcer: Mutex<Option<CloseAnnouncer>>,
    child: Mutex<Option<Child>>,
    reaped: Mutex<Option<ExitStatus>>,
}

impl ParentEndpoint {
    /// Inactive endpoint; no kernel resources are acquired until `start`.
    pub fn new(child_path: impl Into<PathBuf>, shm_size: usize) -> Self {
        Self {
            child_path: child_path.into(),
            shm_size,
            outbound: Mutex::new(None),
            inbound: Mutex::new(None),
            announcer: Mutex::new(None),
            child: Mutex::new(None),
            reaped: Mutex::new(None),
        }
    }

    /// Allocate both channels' kernel objects, map the regions and spawn
    /// the child. On any failure every partially acquired resource is
    /// released before returning.
    pub fn start(&self) -> Result<(), LinkError> {
        let mut child_slot = self.child.lock().unwrap();
        ensure!(child_slot.is_none(), AlreadyActiveSnafu);

        debug!(shm_size = self.shm_size, "allocating channel objects");
        let p2c_signal = SignalCounter::new()?;
        let p2c_ack = SignalCounter::new()?;
        let p2c_region = SharedRegion::create("p2c", self.shm_size)?;
        let c2p_signal = SignalCounter::new()?;
        let c2p_ack = SignalCounter::new()?;
        let c2p_region = SharedRegion::create("c2p", self.shm_size)?;
        let announcer = CloseAnnouncer::watching(&[
            &p2c_signal,
            &p2c_ack,
            &c2p_signal,
            &c2p_ack,
        ])?;

        let p2c_map = p2c_region.map_writer()?;
        let c2p_map = c2p_region.map_reader()?;

        let slots = HandleSlots::fixed();
        let sources: [RawFd; 6] = [
            p2c_signal.as_fd().as_raw_fd(),
            p2c_ack.as_fd().as_raw_fd(),
            p2c_region.as_fd().as_raw_fd(),
            c2p_signal.as_fd().as_raw_fd(),
            c2p_ack.as_fd().as_raw_fd(),
            c2p_region.as_fd().as_raw_fd(),
        ];
        let targets = slots.in_spawn_order();

        let mut command = Command::new(&self.child_path);
        command
            .arg("--mode")
            .arg("child")
            .arg("--fd-p2c-send")
            .arg(slots.p2c_signal.to_string())
            .arg("--fd-p2c-ack")
            .arg(slots.p2c_ack.to_string())
            .arg("--fd-p2c-shm")
            .arg(slots.p2c_region.to_string())
            .arg("--fd-c2p-send")
            .arg(slots.c2p_signal.to_string())
            .arg("--fd-c2p-ack")
            .arg(slots.c2p_ack.to_string())
            .arg("--fd-c2p-shm")
            .arg(slots.c2p_region.to_string())
            .arg("--shm-size")
            .arg(self.shm_size.to_string())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        unsafe {
            command.pre_exec(move || install_handle_slots(&sources, &targets));
        }

        let child = command.spawn().context(SpawnFailedSnafu)?;
        info!(
            pid = child.id(),
            child = %self.child_path.display(),
            "child spawned with transport handles at slots 3..8"
        );

        let peer = Arc::new(PeerWatch::for_pid(child.id()));
        *self.outbound.lock().unwrap() = Some(SenderChannel::new(
            p2c_map,
            p2c_signal,
            p2c_ack,
            p2c_region,
            peer.clone(),
        ));
        *self.inbound.lock().unwrap() = Some(ReceiverChannel::new(
            c2p_map,
            c2p_signal,
            c2p_ack,
            c2p_region,
            peer,
        ));
        *self.announcer.lock().unwrap() = Some(announcer);
        *self.reaped.lock().unwrap() = None;
        *child_slot = Some(child);
        Ok(())
    }

    /// Send one message on the parent-to-child channel; blocks until the
    /// child acknowledges it.
    pub fn send(&self, payload: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.outbound.lock().unwrap();
        let channel = guard.as_mut().context(InactiveSnafu)?;
        channel.send(payload)
    }

    /// Receive one message from the child-to-parent channel, copying the
    /// payload out before acknowledging.
    pub fn receive(&self) -> Result<Vec<u8>, LinkError> {
        let mut guard = self.inbound.lock().unwrap();
        let channel = guard.as_mut().context(InactiveSnafu)?;
        channel.receive()
    }

    /// Pid of the spawned child while the endpoint is active.
    pub fn child_id(&self) -> Option<u32> {
        self.child.lock().unwrap().as_ref().map(Child::id)
    }

    /// How the child exited, once `close` has reaped it.
    pub fn child_exit_status(&self) -> Option<ExitStatus> {
        *self.reaped.lock().unwrap()
    }

    /// Release everything. Idempotent, and safe after a failed `start`.
    ///
    /// The close is announced on all four counters first: the child's
    /// blocked `listen` (or `send`) drains the reserved word and returns
    /// `TransportBroken`, letting it exit on its own, and any of our own
    /// threads still parked in `send`/`receive` unwind the same way and
    /// release their channel. The child is then reaped, escalating to
    /// SIGTERM and SIGKILL only if it ignores the announcement, and the
    /// mappings drop before the handles backing them.
    pub fn close(&self) {
        if let Some(announcer) = self.announcer.lock().unwrap().take() {
            announcer.announce();
        }
        if let Some(child) = self.child.lock().unwrap().take() {
            debug!(pid = child.id(), "reaping child");
            *self.reaped.lock().unwrap() = terminate(child);
        }
        drop(self.outbound.lock().unwrap().take());
        drop(self.inbound.lock().unwrap().take());
    }
}

impl Drop for ParentEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs between fork and exec: place the six transport handles at the
/// well-known slots. Every source is first duplicated above the slot range,
/// because a source fd may itself occupy a target slot and `dup2` onto it
/// would clobber a handle that is still needed (an identity `dup2` would
/// also leave close-on-exec set). The staged copies are close-on-exec; the
/// slot copies made by `dup2` are not, which is what hands them across the
/// exec. Async-signal-safe: raw libc only, no allocation.
fn install_handle_slots(
    sources: &[RawFd; 6],
    targets: &[RawFd; 6],
) -> std::io::Result<()> {
    let stage_floor = targets[5] + 1;
    let mut staged = [0 as RawFd; 6];
    for (stage, &source) in staged.iter_mut().zip(sources) {
        let fd =
            unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, stage_floor) };
        if fd == -1 {
            return Err(std::io::Error::last_os_error());
        }
        *stage = fd;
    }
    for (&stage, &target) in staged.iter().zip(targets) {
        if unsafe { libc::dup2(stage, target) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Reap the child, escalating only as needed: the close announcement
/// normally lets it wind down by itself, a stubborn child gets SIGTERM,
/// and one that ignores that too is killed outright. Always reaps so the
/// pid does not linger in the process table.
fn terminate(mut child: Child) -> Option<ExitStatus> {
    if let Some(status) = reap_with_patience(&mut child) {
        debug!(%status, "child wound down on its own");
        return Some(status);
    }

    warn!(
        pid = child.id(),
        "child ignored the close announcement, terminating it"
    );
    if let Err(errno) = kill_process(Pid::from_child(&child), Signal::Term) {
        warn!(%errno, "could not signal child");
    }
    if let Some(status) = reap_with_patience(&mut child) {
        debug!(%status, "child exited on termination");
        return Some(status);
    }

    warn!(pid = child.id(), "child ignored termination, killing it");
    let _ = child.kill();
    child.wait().ok()
}

fn reap_with_patience(child: &mut Child) -> Option<ExitStatus> {
    let deadline = Instant::now() + REAP_PATIENCE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => {
                warn!(%err, "could not reap child");
                return None;
            }
        }
    }
}
