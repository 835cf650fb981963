//! `reffs-checkpoint <mountpoint> <key>`: snapshots the live filesystem
//! state under the given key, for later `reffs-restore`.

use std::os::fd::AsRawFd;
use std::process::ExitCode;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

nix::ioctl_write_ptr!(checkpoint, reffs_abi::ioctl::MAGIC, reffs_abi::ioctl::CHECKPOINT, u64);

fn main() -> ExitCode {
    let matches = clap::Command::new("reffs-checkpoint")
        .version(clap::crate_version!())
        .about("Snapshots a mounted RefFS instance under a key")
        .arg(clap::arg!(<mountpoint> "Path inside the mounted filesystem"))
        .arg(clap::arg!(<key> "Snapshot key (u64)"))
        .get_matches();

    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let key: u64 = match matches.get_one::<String>("key").unwrap().parse() {
        Ok(k) => k,
        Err(_) => {
            eprintln!("reffs-checkpoint: key must be a u64");
            return ExitCode::FAILURE;
        }
    };

    let fd = match open(mountpoint.as_str(), OFlag::O_RDONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("reffs-checkpoint: open {}: {}", mountpoint, e);
            return ExitCode::FAILURE;
        }
    };

    let result = unsafe { checkpoint(fd.as_raw_fd(), &key) };
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("reffs-checkpoint: ioctl failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
