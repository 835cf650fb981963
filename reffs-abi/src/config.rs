use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default location of the config file `PICKLE`/`LOAD` read their target
/// path from, per the mount binary's documented convention.
pub const DEFAULT_CONFIG_PATH: &str = "/tmp/pickle.cfg";

/// Writes `target` as the sole content of a pickle config file, ready to
/// be handed to `PICKLE`/`LOAD` as the ioctl argument.
pub fn write_config(cfg_path: &Path, target: &Path) -> io::Result<()> {
    fs::write(cfg_path, format!("{}\n", target.display()))
}

/// Reads the first line of a pickle config file and returns it as a path.
/// Mirrors the core's own reader so the CLI helpers and the daemon agree on
/// the format without duplicating the parsing logic.
pub fn read_config(cfg_path: &Path) -> io::Result<PathBuf> {
    let contents = fs::read_to_string(cfg_path)?;
    let first_line = contents
        .lines()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty pickle config file"))?;
    Ok(PathBuf::from(first_line.trim()))
}
