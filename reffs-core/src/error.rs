use std::io;

/// Errors produced by the store. Every variant maps to exactly one POSIX
/// errno via [`Error::errno`]; the adapter's only job on this boundary is
/// calling that method and handing the result to `reply_err`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such entry")]
    NotFound,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("already exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("no space left")]
    NoSpace,
    #[error("out of memory")]
    OutOfMemory,
    #[error("result too large for buffer")]
    Range,
    #[error("argument list too long")]
    TooBig,
    #[error("no such extended attribute")]
    XattrMissing,
    #[error("cross-device link")]
    CrossDevice,
    #[error("permission denied")]
    PermissionDenied,
    #[error("pickle file size does not match header")]
    SizeMismatch,
    #[error("pickle content hash does not match header")]
    HashMismatch,
    #[error("hashing failure while verifying pickle")]
    HashError,
    #[error("snapshot not found for key")]
    SnapshotNotFound,
    #[error("snapshot already exists for key")]
    SnapshotExists,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound | Error::SnapshotNotFound => libc::ENOENT,
            Error::NotDir => libc::ENOTDIR,
            Error::IsDir => libc::EISDIR,
            Error::InvalidArgument => libc::EINVAL,
            Error::Exists | Error::SnapshotExists => libc::EEXIST,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::NoSpace => libc::ENOSPC,
            Error::OutOfMemory => libc::ENOMEM,
            Error::Range => libc::ERANGE,
            Error::TooBig => libc::E2BIG,
            #[cfg(target_os = "macos")]
            Error::XattrMissing => libc::ENOATTR,
            #[cfg(not(target_os = "macos"))]
            Error::XattrMissing => libc::ENODATA,
            Error::CrossDevice => libc::EXDEV,
            Error::PermissionDenied => libc::EACCES,
            Error::SizeMismatch => libc::EMSGSIZE,
            Error::HashMismatch => libc::EINVAL,
            Error::HashError => libc::EPROTO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
