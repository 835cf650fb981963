//! `reffs-load <mountpoint> <input>`: replaces the mounted filesystem's
//! entire state with the contents of a pickle file written by
//! `reffs-pickle`, after verifying its integrity hash.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use reffs_abi::ioctl::CFG_PATH_ARG_LEN;

nix::ioctl_write_ptr!(
    load,
    reffs_abi::ioctl::MAGIC,
    reffs_abi::ioctl::LOAD,
    [u8; CFG_PATH_ARG_LEN]
);

fn main() -> ExitCode {
    let matches = clap::Command::new("reffs-load")
        .version(clap::crate_version!())
        .about("Replaces a mounted RefFS instance's state from a pickle file")
        .arg(clap::arg!(<mountpoint> "Path inside the mounted filesystem"))
        .arg(clap::arg!(<input> "Input pickle file path"))
        .get_matches();

    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let input = PathBuf::from(matches.get_one::<String>("input").unwrap());

    let cfg_path = PathBuf::from(reffs_abi::config::DEFAULT_CONFIG_PATH);
    if let Err(e) = reffs_abi::config::write_config(&cfg_path, &input) {
        eprintln!("reffs-load: writing config: {}", e);
        return ExitCode::FAILURE;
    }
    let mut buf = [0u8; CFG_PATH_ARG_LEN];
    let bytes = cfg_path.to_string_lossy();
    let bytes = bytes.as_bytes();
    if bytes.len() >= CFG_PATH_ARG_LEN {
        eprintln!("reffs-load: config path too long");
        return ExitCode::FAILURE;
    }
    buf[..bytes.len()].copy_from_slice(bytes);

    let fd = match open(mountpoint.as_str(), OFlag::O_RDONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("reffs-load: open {}: {}", mountpoint, e);
            return ExitCode::FAILURE;
        }
    };

    let result = unsafe { load(fd.as_raw_fd(), &buf) };
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("reffs-load: ioctl failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
