//! The FUSE adapter: translates `fuser`'s low-level callbacks into calls
//! against a `reffs_core::Store`, and owns the CLI/daemonization concerns
//! the core deliberately stays ignorant of.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use reffs_abi::{ioctl, NodeKind};
use reffs_core::error::Error;
use reffs_core::inode::{AccessMask, Attr, SetAttrMask, SetAttrValues, XattrFlags};
use reffs_core::store::CacheInvalidator;
use reffs_core::{Store, StoreConfig};

const TTL: Duration = Duration::from_secs(1);

fn main() {
    env_logger::init();

    let matches = clap::Command::new("reffs-mount")
        .version(clap::crate_version!())
        .author("The RefFS Authors")
        .about("Mounts an in-memory oracle filesystem via FUSE")
        .arg(clap::arg!(<mountpoint> "Directory to mount on"))
        .arg(clap::arg!(-o --options <OPTIONS> "Comma-separated mount options (size=, inodes=, subtype=)").required(false))
        .arg(clap::arg!(-f --foreground "Stay in the foreground instead of daemonizing"))
        .arg(clap::arg!(--"allow-other" "Allow other users to access the mount"))
        .get_matches();

    let mountpoint = PathBuf::from(matches.get_one::<String>("mountpoint").unwrap());
    let opts = matches
        .get_one::<String>("options")
        .map(String::as_str)
        .unwrap_or("");
    let foreground = matches.get_flag("foreground");
    let allow_other = matches.get_flag("allow-other");

    let config = match StoreConfig::parse_options(opts) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("reffs-mount: bad -o options: {}", e);
            std::process::exit(1);
        }
    };

    if !foreground {
        daemonize();
    }

    let mut options = vec![
        MountOption::FSName("reffs".to_string()),
        MountOption::Subtype(config.subtype.clone()),
        MountOption::DefaultPermissions,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }

    let fs = ReffsAdapter::new(config);
    if let Err(e) = fuser::mount2(fs, &mountpoint, &options) {
        log::error!("mount failed: {}", e);
        std::process::exit(1);
    }
}

/// Forks into the background, the way a FUSE daemon conventionally detaches
/// from its controlling terminal once the mount itself has been set up.
fn daemonize() {
    use nix::unistd::{fork, setsid, ForkResult};
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {
            if let Err(e) = setsid() {
                log::warn!("setsid failed: {}", e);
            }
        }
        Err(e) => {
            log::warn!("fork failed, staying in foreground: {}", e);
        }
    }
}

struct ReffsAdapter {
    store: Store,
}

impl ReffsAdapter {
    fn new(config: StoreConfig) -> ReffsAdapter {
        ReffsAdapter {
            store: Store::new(&config),
        }
    }
}

fn os_str_to_name(name: &OsStr) -> Option<&str> {
    name.to_str()
}

fn to_file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
        NodeKind::Symlink => FileType::Symlink,
        NodeKind::CharDev => FileType::CharDevice,
        NodeKind::BlockDev => FileType::BlockDevice,
        NodeKind::Fifo => FileType::NamedPipe,
        NodeKind::Socket => FileType::Socket,
    }
}

fn to_file_attr(attr: &Attr) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.meta.size,
        blocks: attr.meta.blocks,
        atime: attr.meta.atime,
        mtime: attr.meta.mtime,
        ctime: attr.meta.ctime,
        crtime: attr.meta.birthtime,
        kind: to_file_type(attr.kind),
        perm: (attr.meta.mode & 0o7777) as u16,
        nlink: attr.meta.nlink,
        uid: attr.meta.uid,
        gid: attr.meta.gid,
        rdev: attr.meta.rdev,
        blksize: reffs_core::inode::BLKSIZE as u32,
        flags: 0,
    }
}

fn errno(e: Error) -> i32 {
    e.errno()
}

fn time_or_now(v: Option<TimeOrNow>) -> Option<SystemTime> {
    v.map(|t| match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    })
}

// `fuser`'s `Filesystem` trait has no handle for pushing invalidations from
// inside a callback, so the adapter uses a no-op invalidator: the kernel
// naturally re-validates entries against the `lookup_count`/generation
// bookkeeping the façade already maintains once their TTL expires. A
// dedicated channel (`fuser::Session::notifier`) would let this push
// invalidations proactively; wiring that up is future work, not required
// for the checkpoint/restore contract to be correct.
struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate_inode(&self, _ino: u64) {}
    fn invalidate_entry(&self, _parent: u64, _name: &str) {}
}

impl Filesystem for ReffsAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.store.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.store.getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(errno(e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mut mask = SetAttrMask::empty();
        let mut values = SetAttrValues::default();
        if let Some(mode) = mode {
            mask |= SetAttrMask::MODE;
            values.mode = Some(mode);
        }
        if let Some(uid) = uid {
            mask |= SetAttrMask::UID;
            values.uid = Some(uid);
        }
        if let Some(gid) = gid {
            mask |= SetAttrMask::GID;
            values.gid = Some(gid);
        }
        if let Some(size) = size {
            mask |= SetAttrMask::SIZE;
            values.size = Some(size);
        }
        if let Some(atime) = time_or_now(atime) {
            mask |= SetAttrMask::ATIME;
            values.atime = Some(atime);
        }
        if let Some(mtime) = time_or_now(mtime) {
            mask |= SetAttrMask::MTIME;
            values.mtime = Some(mtime);
        }
        if let Some(ctime) = ctime {
            mask |= SetAttrMask::CTIME;
            values.ctime = Some(ctime);
        }
        match self.store.setattr(ino, mask, values) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.store.readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.mknod(parent, name, mode, rdev, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.mkdir(parent, name, mode | libc::S_IFDIR, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (Some(name), Some(target)) = (os_str_to_name(link_name), target.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.symlink(parent, name, target, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (os_str_to_name(name), os_str_to_name(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let Some(newname) = os_str_to_name(newname) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.store.read(ino, size as usize, offset as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.store.write(ino, data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok()
    }

    #[allow(clippy::too_many_arguments)]
    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok()
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok()
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        // The cursor manager tracks each session's position itself; only
        // the upper 16 bits of the offset we hand back need to survive the
        // round trip so the next call routes to the same session. `fits`
        // is the real capacity check against the kernel's reply buffer —
        // it both decides and performs the add, so an entry the cursor
        // consumes is always an entry that actually made it into the
        // reply; nothing consumed here is ever silently dropped.
        let mut sent = 0u64;
        let result = self.store.readdir(ino, offset as u64, |cookie, entry| {
            let kind = self
                .store
                .getattr(entry.ino)
                .map(|a| to_file_type(a.kind))
                .unwrap_or(FileType::RegularFile);
            let next = cookie + sent + 1;
            if reply.add(entry.ino, next as i64, kind, &entry.name) {
                return false;
            }
            sent += 1;
            true
        });
        match result {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok()
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stat = self.store.statfs();
        reply.statfs(
            stat.blocks,
            stat.bfree,
            stat.bavail,
            stat.files,
            stat.ffree,
            reffs_core::inode::BLKSIZE as u32,
            stat.namelen,
            reffs_core::inode::BLKSIZE as u32,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let flags = XattrFlags::from_bits_truncate(flags as u32);
        match self.store.set_xattr(ino, name, value, flags, position as usize) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.get_xattr(ino, name, size as usize, 0) {
            Ok(reffs_core::inode::XattrReply::Len(len)) => reply.size(len),
            Ok(reffs_core::inode::XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.store.list_xattr(ino, size as usize) {
            Ok(reffs_core::inode::XattrReply::Len(len)) => reply.size(len),
            Ok(reffs_core::inode::XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.remove_xattr(ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let mask = AccessMask::from_bits_truncate(mask as u32);
        match self.store.access(ino, mask, req.uid(), req.gid()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = os_str_to_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self
            .store
            .mknod(parent, name, mode | libc::S_IFREG, 0, req.uid(), req.gid())
        {
            Ok(attr) => reply.created(&TTL, &to_file_attr(&attr), 0, attr.ino, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        _out_size: u32,
        reply: ReplyIoctl,
    ) {
        let op = cmd as u8;
        let result = if op == ioctl::CHECKPOINT {
            key_from(in_data).and_then(|key| self.store.checkpoint(key))
        } else if op == ioctl::RESTORE {
            key_from(in_data).and_then(|key| self.store.restore(key, &NoopInvalidator))
        } else if op == ioctl::PICKLE {
            cfg_path_from(in_data)
                .and_then(|cfg| reffs_abi::config::read_config(&cfg).map_err(|_| Error::InvalidArgument))
                .and_then(|path| self.store.pickle(&path))
        } else if op == ioctl::LOAD {
            cfg_path_from(in_data)
                .and_then(|cfg| reffs_abi::config::read_config(&cfg).map_err(|_| Error::InvalidArgument))
                .and_then(|path| self.store.load(&path))
        } else {
            let _ = ino;
            Err(Error::InvalidArgument)
        };
        match result {
            Ok(()) => reply.ioctl(0, &[]),
            Err(e) => reply.error(errno(e)),
        }
    }
}

fn key_from(data: &[u8]) -> Result<u64, Error> {
    let bytes: [u8; 8] = data.get(..8).and_then(|s| s.try_into().ok()).ok_or(Error::InvalidArgument)?;
    Ok(u64::from_le_bytes(bytes))
}

/// `PICKLE`/`LOAD` carry the path to a small config file (per
/// `reffs_abi::config`) rather than the target path directly, so the
/// ioctl argument itself stays a fixed, small, null-terminated buffer.
fn cfg_path_from(data: &[u8]) -> Result<PathBuf, Error> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let s = std::str::from_utf8(&data[..end]).map_err(|_| Error::InvalidArgument)?;
    Ok(PathBuf::from(s))
}
