//! `reffs-pickle <mountpoint> <output>`: writes the mounted filesystem's
//! entire state to `<output>` as a self-verifying binary image.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use reffs_abi::ioctl::CFG_PATH_ARG_LEN;

nix::ioctl_write_ptr!(
    pickle,
    reffs_abi::ioctl::MAGIC,
    reffs_abi::ioctl::PICKLE,
    [u8; CFG_PATH_ARG_LEN]
);

/// Writes the pickle target path into the well-known config file and
/// returns a fixed-size, NUL-terminated buffer naming that config file,
/// the shape `mount-reffs`'s ioctl handler expects.
fn prepare_cfg_arg(target: &Path) -> std::io::Result<[u8; CFG_PATH_ARG_LEN]> {
    let cfg_path = PathBuf::from(reffs_abi::config::DEFAULT_CONFIG_PATH);
    reffs_abi::config::write_config(&cfg_path, target)?;
    let mut buf = [0u8; CFG_PATH_ARG_LEN];
    let bytes = cfg_path.to_string_lossy();
    let bytes = bytes.as_bytes();
    if bytes.len() >= CFG_PATH_ARG_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "config path too long",
        ));
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

fn main() -> ExitCode {
    let matches = clap::Command::new("reffs-pickle")
        .version(clap::crate_version!())
        .about("Dumps a mounted RefFS instance to a pickle file")
        .arg(clap::arg!(<mountpoint> "Path inside the mounted filesystem"))
        .arg(clap::arg!(<output> "Output pickle file path"))
        .get_matches();

    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let output = PathBuf::from(matches.get_one::<String>("output").unwrap());

    let buf = match prepare_cfg_arg(&output) {
        Ok(buf) => buf,
        Err(e) => {
            eprintln!("reffs-pickle: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let fd = match open(mountpoint.as_str(), OFlag::O_RDONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("reffs-pickle: open {}: {}", mountpoint, e);
            return ExitCode::FAILURE;
        }
    };

    let result = unsafe { pickle(fd.as_raw_fd(), &buf) };
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("reffs-pickle: ioctl failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
