//! Inode representation (C1/C2): a common header plus a tagged variant
//! payload. Dispatch is on `kind`, never on a virtual call, eliminating the
//! multiple-inheritance shape of the original source.

mod directory;
mod special;
mod xattr;

pub use directory::DirEntry;
pub use special::SpecialTag;
pub use xattr::XattrReply;

use crate::error::{Error, Result};
use parking_lot::RwLock;
use reffs_abi::NodeKind;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

pub const BLKSIZE: u64 = 512;

fn blocks_for(size: u64) -> u64 {
    size.div_ceil(BLKSIZE)
}

/// The metadata triple (attributes + times) plus the fields the façade
/// mutates directly, guarded by one reader-writer lock per §4.2.
#[derive(Clone, Debug)]
pub struct Meta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub birthtime: SystemTime,
    pub rdev: u32,
}

impl Meta {
    fn new(mode: u32, uid: u32, gid: u32, nlink: u32) -> Meta {
        let now = SystemTime::now();
        Meta {
            mode,
            uid,
            gid,
            nlink,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
            rdev: 0,
        }
    }

    fn touch_mtime(&mut self) {
        self.mtime = SystemTime::now();
        self.ctime = self.mtime;
    }

    fn touch_ctime(&mut self) {
        self.ctime = SystemTime::now();
    }
}

/// A plain, adapter-agnostic view of an inode's attributes, independent of
/// the FUSE crate's own `FileAttr` so the core does not need to depend on
/// it. `mount-reffs` converts this into `fuser::FileAttr`.
#[derive(Clone, Debug)]
pub struct Attr {
    pub ino: u64,
    pub kind: NodeKind,
    pub meta: Meta,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct SetAttrMask: u32 {
        const MODE  = 0b0000_0001;
        const UID   = 0b0000_0010;
        const GID   = 0b0000_0100;
        const SIZE  = 0b0000_1000;
        const ATIME = 0b0001_0000;
        const MTIME = 0b0010_0000;
        const CTIME = 0b0100_0000;
        const FLAGS = 0b1000_0000;
    }
}

#[derive(Default, Clone, Copy, Debug)]
pub struct SetAttrValues {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct XattrFlags: u32 {
        const CREATE  = 0b01;
        const REPLACE = 0b10;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct AccessMask: u32 {
        const F_OK = 0;
        const X_OK = 0b001;
        const W_OK = 0b010;
        const R_OK = 0b100;
    }
}

enum Payload {
    File(RwLock<Vec<u8>>),
    Directory(RwLock<Vec<DirEntry>>),
    Symlink(RwLock<String>),
    Special { tag: SpecialTag, dev: Option<u32> },
}

/// Reserves or refunds blocks/inodes against the filesystem-wide `stat`.
/// A thin handle so inode operations that need space accounting don't
/// couple to the whole `Store`; mirrors the "has_space_for" / "update
/// used blocks" helper pair from §4.4.
pub trait SpaceAccounting {
    fn try_reserve_blocks(&self, delta: i64) -> Result<()>;
    fn release_blocks(&self, delta: u64);
}

pub struct Inode {
    ino: u64,
    kind: NodeKind,
    meta: RwLock<Meta>,
    xattrs: RwLock<BTreeMap<String, Vec<u8>>>,
    lookup_count: AtomicU64,
    marked_for_deletion: AtomicBool,
    payload: Payload,
}

impl Inode {
    pub fn new_file(ino: u64, mode: u32, uid: u32, gid: u32) -> Inode {
        Inode {
            ino,
            kind: NodeKind::File,
            meta: RwLock::new(Meta::new(mode, uid, gid, 1)),
            xattrs: RwLock::new(BTreeMap::new()),
            lookup_count: AtomicU64::new(0),
            marked_for_deletion: AtomicBool::new(false),
            payload: Payload::File(RwLock::new(Vec::new())),
        }
    }

    pub fn new_directory(ino: u64, mode: u32, uid: u32, gid: u32, parent: u64) -> Inode {
        let entries = vec![
            DirEntry::new(".", ino),
            DirEntry::new("..", parent),
        ];
        let mut meta = Meta::new(mode, uid, gid, 2);
        meta.size = directory::synthetic_size(&entries);
        meta.blocks = blocks_for(meta.size);
        Inode {
            ino,
            kind: NodeKind::Directory,
            meta: RwLock::new(meta),
            xattrs: RwLock::new(BTreeMap::new()),
            lookup_count: AtomicU64::new(0),
            marked_for_deletion: AtomicBool::new(false),
            payload: Payload::Directory(RwLock::new(entries)),
        }
    }

    pub fn new_symlink(ino: u64, mode: u32, uid: u32, gid: u32, target: String) -> Inode {
        let mut meta = Meta::new(mode, uid, gid, 1);
        meta.size = target.len() as u64;
        meta.blocks = blocks_for(meta.size);
        Inode {
            ino,
            kind: NodeKind::Symlink,
            meta: RwLock::new(meta),
            xattrs: RwLock::new(BTreeMap::new()),
            lookup_count: AtomicU64::new(0),
            marked_for_deletion: AtomicBool::new(false),
            payload: Payload::Symlink(RwLock::new(target)),
        }
    }

    pub fn new_special(
        ino: u64,
        kind: NodeKind,
        tag: SpecialTag,
        mode: u32,
        uid: u32,
        gid: u32,
        dev: Option<u32>,
    ) -> Inode {
        let mut meta = Meta::new(mode, uid, gid, 1);
        meta.rdev = dev.unwrap_or(0);
        Inode {
            ino,
            kind,
            meta: RwLock::new(meta),
            xattrs: RwLock::new(BTreeMap::new()),
            lookup_count: AtomicU64::new(0),
            marked_for_deletion: AtomicBool::new(false),
            payload: Payload::Special { tag, dev },
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn nlink(&self) -> u32 {
        self.meta.read().nlink
    }

    pub fn set_nlink(&self, nlink: u32) {
        self.meta.write().nlink = nlink;
    }

    pub fn inc_nlink(&self) {
        self.meta.write().nlink += 1;
    }

    /// Decrements `nlink`, saturating at 0, and returns the new value.
    pub fn dec_nlink(&self) -> u32 {
        let mut meta = self.meta.write();
        meta.nlink = meta.nlink.saturating_sub(1);
        meta.nlink
    }

    pub fn size(&self) -> u64 {
        self.meta.read().size
    }

    pub fn mode(&self) -> u32 {
        self.meta.read().mode
    }

    /// §3 invariant 6: not yet unlinked-and-forgotten.
    pub fn is_live(&self) -> bool {
        self.nlink() > 0
    }

    // -- reply_entry / reply_create / reply_attr -------------------------

    pub fn note_lookup(&self) -> Attr {
        self.lookup_count.fetch_add(1, Ordering::SeqCst);
        self.attr()
    }

    pub fn attr(&self) -> Attr {
        Attr {
            ino: self.ino,
            kind: self.kind,
            meta: self.meta.read().clone(),
        }
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::SeqCst)
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::SeqCst)
    }

    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::SeqCst);
    }

    /// `forget(n)`: decrement `lookup_count` by `n`, saturating at 0.
    /// Returns true when the inode has become eligible for destruction
    /// (`lookup_count == 0 && nlink == 0`); the caller (the façade) is
    /// responsible for actually removing it from the table.
    pub fn forget(&self, n: u64) -> bool {
        let mut cur = self.lookup_count.load(Ordering::SeqCst);
        loop {
            let next = cur.saturating_sub(n);
            match self.lookup_count.compare_exchange_weak(
                cur,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        self.lookup_count.load(Ordering::SeqCst) == 0 && self.nlink() == 0
    }

    pub fn set_attr(&self, mask: SetAttrMask, values: SetAttrValues) -> Result<()> {
        if mask.contains(SetAttrMask::SIZE) {
            match self.kind {
                NodeKind::Directory => return Err(Error::IsDir),
                NodeKind::File => {}
                _ => return Err(Error::InvalidArgument),
            }
        }
        {
            let mut meta = self.meta.write();
            if mask.contains(SetAttrMask::MODE) {
                meta.mode = values.mode.unwrap_or(meta.mode);
            }
            if mask.contains(SetAttrMask::UID) {
                meta.uid = values.uid.unwrap_or(meta.uid);
            }
            if mask.contains(SetAttrMask::GID) {
                meta.gid = values.gid.unwrap_or(meta.gid);
            }
            if mask.contains(SetAttrMask::ATIME) {
                meta.atime = values.atime.unwrap_or(meta.atime);
            }
            if mask.contains(SetAttrMask::MTIME) {
                meta.mtime = values.mtime.unwrap_or(meta.mtime);
            }
            meta.touch_ctime();
        }
        if mask.contains(SetAttrMask::SIZE) {
            self.truncate(values.size.unwrap_or(0))?;
        }
        Ok(())
    }

    pub fn access(&self, mask: AccessMask, uid: u32, gid: u32) -> Result<()> {
        if mask == AccessMask::F_OK {
            return Ok(());
        }
        let meta = self.meta.read();
        let shift = if uid == meta.uid {
            6
        } else if gid == meta.gid {
            3
        } else {
            0
        };
        let granted = (meta.mode >> shift) & 0o7;
        let requested = mask.bits() & 0o7;
        if granted & requested == requested {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    // -- file payload -----------------------------------------------------

    fn as_file(&self) -> Result<&RwLock<Vec<u8>>> {
        match &self.payload {
            Payload::File(buf) => Ok(buf),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn read(&self, size: usize, off: u64) -> Result<Vec<u8>> {
        let buf = self.as_file()?.read();
        let file_size = self.meta.read().size;
        if off >= file_size {
            self.meta.write().atime = SystemTime::now();
            return Ok(Vec::new());
        }
        let avail = (file_size - off) as usize;
        let n = size.min(avail);
        let start = off as usize;
        let out = buf[start..start + n].to_vec();
        drop(buf);
        self.meta.write().atime = SystemTime::now();
        Ok(out)
    }

    pub fn write(&self, data: &[u8], off: u64, space: &dyn SpaceAccounting) -> Result<usize> {
        let mut buf = self.as_file()?.write();
        let end = off
            .checked_add(data.len() as u64)
            .ok_or(Error::InvalidArgument)?;
        let new_len = blocks_for(end.max(buf.len() as u64)) * BLKSIZE;
        if new_len as usize > buf.len() {
            let old_blocks = blocks_for(buf.len() as u64);
            let new_blocks = new_len / BLKSIZE;
            space.try_reserve_blocks((new_blocks - old_blocks) as i64)?;
            buf.resize(new_len as usize, 0);
        }
        let old_size = self.meta.read().size;
        if off > old_size {
            for b in &mut buf[old_size as usize..off as usize] {
                *b = 0;
            }
        }
        buf[off as usize..end as usize].copy_from_slice(data);
        let new_size = end.max(old_size);
        drop(buf);
        {
            let mut meta = self.meta.write();
            meta.size = new_size;
            meta.blocks = new_len / BLKSIZE;
            meta.touch_mtime();
        }
        Ok(data.len())
    }

    pub fn truncate(&self, n: u64) -> Result<()> {
        let mut buf = self.as_file()?.write();
        let new_len = (blocks_for(n) * BLKSIZE) as usize;
        buf.resize(new_len, 0);
        drop(buf);
        let mut meta = self.meta.write();
        meta.size = n;
        meta.blocks = new_len as u64 / BLKSIZE;
        meta.touch_mtime();
        Ok(())
    }

    // -- symlink payload ---------------------------------------------------

    pub fn readlink(&self) -> Result<String> {
        match &self.payload {
            Payload::Symlink(target) => Ok(target.read().clone()),
            _ => Err(Error::InvalidArgument),
        }
    }

    // -- special payload ---------------------------------------------------

    pub fn special_tag(&self) -> Option<SpecialTag> {
        match &self.payload {
            Payload::Special { tag, .. } => Some(*tag),
            _ => None,
        }
    }

    pub fn rdev(&self) -> u32 {
        self.meta.read().rdev
    }

    // -- xattrs --------------------------------------------------------

    pub fn set_xattr(
        &self,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
        position: usize,
    ) -> Result<()> {
        xattr::set(&self.xattrs, name, value, flags, position)?;
        self.meta.write().touch_ctime();
        Ok(())
    }

    pub fn get_xattr(&self, name: &str, size: usize, position: usize) -> Result<XattrReply> {
        xattr::get(&self.xattrs, name, size, position)
    }

    pub fn list_xattr(&self, size: usize) -> Result<XattrReply> {
        xattr::list(&self.xattrs, size)
    }

    pub fn remove_xattr(&self, name: &str) -> Result<()> {
        xattr::remove(&self.xattrs, name)?;
        self.meta.write().touch_ctime();
        Ok(())
    }

    // -- directory payload (delegated to inode::directory) -----------------

    pub(crate) fn directory(&self) -> Result<&RwLock<Vec<DirEntry>>> {
        match &self.payload {
            Payload::Directory(entries) => Ok(entries),
            _ => Err(Error::NotDir),
        }
    }

    // -- raw payload access for the pickle codec --------------------------

    pub(crate) fn file_bytes_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.as_file()?.read().clone())
    }

    pub(crate) fn xattrs_snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.xattrs.read().clone()
    }

}

/// Payload shape for reconstructing an inode from a pickle record, mirroring
/// `Payload` without exposing it outside this module.
pub(crate) enum PickledPayload {
    File(Vec<u8>),
    Directory(Vec<DirEntry>),
    Symlink(String),
    Special { tag: SpecialTag, dev: Option<u32> },
}

impl Inode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_pickle(
        ino: u64,
        kind: NodeKind,
        meta: Meta,
        lookup_count: u64,
        marked_for_deletion: bool,
        xattrs: BTreeMap<String, Vec<u8>>,
        payload: PickledPayload,
    ) -> Inode {
        let payload = match payload {
            PickledPayload::File(bytes) => Payload::File(RwLock::new(bytes)),
            PickledPayload::Directory(entries) => Payload::Directory(RwLock::new(entries)),
            PickledPayload::Symlink(target) => Payload::Symlink(RwLock::new(target)),
            PickledPayload::Special { tag, dev } => Payload::Special { tag, dev },
        };
        Inode {
            ino,
            kind,
            meta: RwLock::new(meta),
            xattrs: RwLock::new(xattrs),
            lookup_count: AtomicU64::new(lookup_count),
            marked_for_deletion: AtomicBool::new(marked_for_deletion),
            payload,
        }
    }
}

impl Inode {
    /// Deep-clones an inode's metadata, xattrs and payload bytes,
    /// independent of the original's locks. Used by the snapshot engine,
    /// which needs checkpoints that cannot be disturbed by later
    /// mutation of the live inode.
    pub fn deep_clone(&self) -> Inode {
        let payload = match &self.payload {
            Payload::File(buf) => Payload::File(RwLock::new(buf.read().clone())),
            Payload::Directory(entries) => Payload::Directory(RwLock::new(entries.read().clone())),
            Payload::Symlink(target) => Payload::Symlink(RwLock::new(target.read().clone())),
            Payload::Special { tag, dev } => Payload::Special {
                tag: *tag,
                dev: *dev,
            },
        };
        Inode {
            ino: self.ino,
            kind: self.kind,
            meta: RwLock::new(self.meta.read().clone()),
            xattrs: RwLock::new(self.xattrs.read().clone()),
            lookup_count: AtomicU64::new(self.lookup_count.load(Ordering::SeqCst)),
            marked_for_deletion: AtomicBool::new(self.marked_for_deletion.load(Ordering::SeqCst)),
            payload,
        }
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnlimitedSpace;
    impl SpaceAccounting for UnlimitedSpace {
        fn try_reserve_blocks(&self, _delta: i64) -> Result<()> {
            Ok(())
        }
        fn release_blocks(&self, _delta: u64) {}
    }

    #[test]
    fn write_then_read_round_trips() {
        let file = Inode::new_file(1, 0o644, 0, 0);
        let n = file.write(b"hello world", 0, &UnlimitedSpace).unwrap();
        assert_eq!(n, 11);
        assert_eq!(file.read(5, 0).unwrap(), b"hello");
        assert_eq!(file.read(100, 6).unwrap(), b"world");
        assert_eq!(file.size(), 11);
    }

    #[test]
    fn write_past_eof_zero_fills_the_gap() {
        let file = Inode::new_file(1, 0o644, 0, 0);
        file.write(b"x", 10, &UnlimitedSpace).unwrap();
        let data = file.read(11, 0).unwrap();
        assert_eq!(&data[..10], &[0u8; 10]);
        assert_eq!(&data[10..], b"x");
    }

    #[test]
    fn read_past_eof_is_empty() {
        let file = Inode::new_file(1, 0o644, 0, 0);
        file.write(b"abc", 0, &UnlimitedSpace).unwrap();
        assert!(file.read(10, 100).unwrap().is_empty());
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let file = Inode::new_file(1, 0o644, 0, 0);
        file.write(b"0123456789", 0, &UnlimitedSpace).unwrap();
        file.truncate(4).unwrap();
        assert_eq!(file.size(), 4);
        assert_eq!(file.read(10, 0).unwrap(), b"0123");
        file.truncate(6).unwrap();
        assert_eq!(file.size(), 6);
        assert_eq!(file.read(6, 0).unwrap(), &[b'0', b'1', b'2', b'3', 0, 0]);
    }

    #[test]
    fn setattr_on_directory_rejects_size() {
        let dir = Inode::new_directory(1, 0o755, 0, 0, 1);
        let mut values = SetAttrValues::default();
        values.size = Some(0);
        let result = dir.set_attr(SetAttrMask::SIZE, values);
        assert!(matches!(result, Err(Error::IsDir)));
    }

    #[test]
    fn access_grants_owner_then_group_then_other() {
        let file = Inode::new_file(1, 0o640, 100, 200);
        assert!(file.access(AccessMask::R_OK | AccessMask::W_OK, 100, 200).is_ok());
        assert!(file.access(AccessMask::R_OK, 1, 200).is_ok());
        assert!(file.access(AccessMask::W_OK, 1, 200).is_err());
        assert!(file.access(AccessMask::R_OK, 1, 1).is_err());
    }

    #[test]
    fn xattr_set_get_list_remove() {
        let file = Inode::new_file(1, 0o644, 0, 0);
        file.set_xattr("user.a", b"1", XattrFlags::empty(), 0).unwrap();
        file.set_xattr("user.b", b"2", XattrFlags::empty(), 0).unwrap();
        assert!(matches!(
            file.set_xattr("user.a", b"x", XattrFlags::CREATE, 0),
            Err(Error::Exists)
        ));
        match file.get_xattr("user.a", 0, 0).unwrap() {
            XattrReply::Len(n) => assert_eq!(n, 1),
            _ => panic!("expected Len"),
        }
        match file.get_xattr("user.a", 1, 0).unwrap() {
            XattrReply::Data(d) => assert_eq!(d, b"1"),
            _ => panic!("expected Data"),
        }
        assert!(matches!(
            file.get_xattr("user.a", 16, 0),
            Err(Error::Range)
        ));
        file.remove_xattr("user.a").unwrap();
        assert!(matches!(file.get_xattr("user.a", 1, 0), Err(Error::XattrMissing)));
        match file.list_xattr(1024).unwrap() {
            XattrReply::Data(names) => assert_eq!(names, b"user.b\0"),
            _ => panic!("expected Data"),
        }
    }

    #[test]
    fn deep_clone_is_independent_of_original() {
        let file = Inode::new_file(1, 0o644, 0, 0);
        file.write(b"abc", 0, &UnlimitedSpace).unwrap();
        let clone = file.deep_clone();
        file.write(b"xyz", 0, &UnlimitedSpace).unwrap();
        assert_eq!(clone.read(3, 0).unwrap(), b"abc");
        assert_eq!(file.read(3, 0).unwrap(), b"xyz");
    }

    #[test]
    fn forget_reports_collectible_only_when_both_counts_hit_zero() {
        let file = Inode::new_file(1, 0o644, 0, 0);
        file.note_lookup();
        file.note_lookup();
        assert!(!file.forget(1)); // lookup_count 1, nlink still 1
        file.dec_nlink();
        assert!(file.forget(1)); // lookup_count 0, nlink 0
    }
}
