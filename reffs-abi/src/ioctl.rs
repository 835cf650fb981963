//! Constants for the four control ioctls. The actual `ioctl(2)` wrapper
//! functions are generated with `nix::ioctl_*!` macros in the crates that
//! issue or service them (`mount-reffs`, `reffsctl`), since those macros
//! expand to code that needs `nix` in scope; this crate only fixes the
//! magic byte and command numbers both sides must agree on.

/// Magic byte shared by all four commands, matching the reference
/// implementation's `'1'`.
pub const MAGIC: u8 = b'1';

/// `ioctl(fd, CHECKPOINT, &key: u64)`.
pub const CHECKPOINT: u8 = 1;
/// `ioctl(fd, RESTORE, &key: u64)`.
pub const RESTORE: u8 = 2;
/// `ioctl(fd, PICKLE, &cfg_path)`; the config file's first line is the
/// pickle output path.
pub const PICKLE: u8 = 3;
/// `ioctl(fd, LOAD, &cfg_path)`; the config file's first line is the
/// pickle input path.
pub const LOAD: u8 = 4;

/// Fixed size of the NUL-terminated config-file path the `PICKLE`/`LOAD`
/// ioctl argument carries, keeping that argument a plain fixed-size buffer
/// rather than a variable-length one.
pub const CFG_PATH_ARG_LEN: usize = 256;
