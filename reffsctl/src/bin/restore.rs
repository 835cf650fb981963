//! `reffs-restore <mountpoint> <key>`: restores the filesystem to a
//! previously-taken checkpoint, discarding all live state since.

use std::os::fd::AsRawFd;
use std::process::ExitCode;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

nix::ioctl_write_ptr!(restore, reffs_abi::ioctl::MAGIC, reffs_abi::ioctl::RESTORE, u64);

fn main() -> ExitCode {
    let matches = clap::Command::new("reffs-restore")
        .version(clap::crate_version!())
        .about("Restores a mounted RefFS instance to a prior checkpoint")
        .arg(clap::arg!(<mountpoint> "Path inside the mounted filesystem"))
        .arg(clap::arg!(<key> "Snapshot key (u64)"))
        .get_matches();

    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let key: u64 = match matches.get_one::<String>("key").unwrap().parse() {
        Ok(k) => k,
        Err(_) => {
            eprintln!("reffs-restore: key must be a u64");
            return ExitCode::FAILURE;
        }
    };

    let fd = match open(mountpoint.as_str(), OFlag::O_RDONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("reffs-restore: open {}: {}", mountpoint, e);
            return ExitCode::FAILURE;
        }
    };

    let result = unsafe { restore(fd.as_raw_fd(), &key) };
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("reffs-restore: ioctl failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
