use std::path::PathBuf;

use clap::ValueEnum;

pub const DEFAULT_SHM_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Parent,
    Child,
}

#[derive(clap::Parser)]
#[command(
    name = "shmlink",
    version,
    about = "shmlink demo driver",
    long_about = "Exercises the shmlink transport: parent mode spawns the \
                  given child binary and runs a fixed number of ping \
                  rounds over shared memory; child mode (normally entered \
                  only via a parent's spawn) echoes every received frame \
                  back to its parent."
)]
pub struct Args {
    #[arg(long, value_enum, value_name = "MODE")]
    pub mode: Mode,

    #[arg(
        long,
        value_name = "CHILD_PATH",
        required_if_eq("mode", "parent"),
        help = "Path to the child binary (parent mode only). The demo \
                usually points this at the shmlink binary itself."
    )]
    pub child: Option<PathBuf>,

    #[arg(
        long,
        value_name = "BYTES",
        default_value_t = DEFAULT_SHM_SIZE,
        help = "Capacity of each direction's shared region; also the \
                largest payload a single send may carry"
    )]
    pub shm_size: usize,

    #[arg(
        long,
        value_name = "ROUNDS",
        default_value_t = 5,
        help = "Number of ping rounds to run (parent mode)"
    )]
    pub rounds: u32,

    #[arg(
        long,
        value_name = "LOG_PATH",
        help = "Optional log path; without it logs go to stderr"
    )]
    pub log_path: Option<PathBuf>,

    #[arg(long = "fd-p2c-send", value_name = "FD", default_value_t = 3)]
    pub fd_p2c_send: i32,

    #[arg(long = "fd-p2c-ack", value_name = "FD", default_value_t = 4)]
    pub fd_p2c_ack: i32,

    #[arg(long = "fd-p2c-shm", value_name = "FD", default_value_t = 5)]
    pub fd_p2c_shm: i32,

    #[arg(long = "fd-c2p-send", value_name = "FD", default_value_t = 6)]
    pub fd_c2p_send: i32,

    #[arg(long = "fd-c2p-ack", value_name = "FD", default_value_t = 7)]
    pub fd_c2p_ack: i32,

    #[arg(long = "fd-c2p-shm", value_name = "FD", default_value_t = 8)]
    pub fd_c2p_shm: i32,
}
