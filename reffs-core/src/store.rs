//! Filesystem façade (C4): the operations consumed by the FUSE adapter.
//! Every operation takes a shared acquisition on the filesystem-wide
//! snapshot barrier; checkpoint/restore/load take it exclusively. This is
//! the only global synchronisation point — per-inode operations
//! otherwise proceed in parallel.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::inode::{
    AccessMask, Attr, DirEntry, Inode, SetAttrMask, SetAttrValues, SpaceAccounting, SpecialTag,
    XattrFlags, XattrReply,
};
use crate::pickle;
use crate::readdir::{ReaddirManager, DEFAULT_MAX_ENTRIES};
use crate::snapshot::Snapshots;
use crate::table::{Table, ROOT_INO};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use reffs_abi::NodeKind;
use std::path::Path;

pub const FSID: u64 = 0x52_65_66_46_53_00_00_01; // "RefFS" + version byte
pub const NAMELEN: u32 = 255;

#[derive(Clone, Debug)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

/// Callbacks the adapter supplies so restore can invalidate the kernel's
/// VFS caches before the live state is swapped out from under it.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate_inode(&self, ino: u64);
    fn invalidate_entry(&self, parent: u64, name: &str);
}

/// An invalidator that does nothing, for callers (tests, scenarios in
/// §8) that drive the façade directly without a mounted kernel channel.
pub struct NullInvalidator;

impl CacheInvalidator for NullInvalidator {
    fn invalidate_inode(&self, _ino: u64) {}
    fn invalidate_entry(&self, _parent: u64, _name: &str) {}
}

struct StatHandle<'a>(&'a RwLock<StatFs>);

impl SpaceAccounting for StatHandle<'_> {
    fn try_reserve_blocks(&self, delta: i64) -> Result<()> {
        if delta <= 0 {
            self.release_blocks((-delta) as u64);
            return Ok(());
        }
        let delta = delta as u64;
        let mut stat = self.0.write();
        if stat.bfree < delta {
            return Err(Error::NoSpace);
        }
        stat.bfree -= delta;
        stat.bavail = stat.bfree;
        Ok(())
    }

    fn release_blocks(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut stat = self.0.write();
        stat.bfree = (stat.bfree + delta).min(stat.blocks);
        stat.bavail = stat.bfree;
    }
}

impl StatHandle<'_> {
    fn try_reserve_inode(&self) -> Result<()> {
        let mut stat = self.0.write();
        if stat.ffree == 0 {
            return Err(Error::NoSpace);
        }
        stat.ffree -= 1;
        Ok(())
    }

    fn release_inode(&self) {
        let mut stat = self.0.write();
        stat.ffree = (stat.ffree + 1).min(stat.files);
    }
}

pub struct Store {
    barrier: RwLock<()>,
    rename_mutex: Mutex<()>,
    table: Table,
    stat: RwLock<StatFs>,
    readdir: ReaddirManager,
    snapshots: Snapshots,
}

impl Store {
    pub fn new(config: &StoreConfig) -> Store {
        let blocks = config.size_bytes / crate::inode::BLKSIZE;
        let table = Table::new();
        let root_ino = table.add(|ino| Inode::new_directory(ino, 0o755, 0, 0, ino));
        debug_assert_eq!(root_ino, ROOT_INO);
        let stat = StatFs {
            blocks,
            bfree: blocks,
            bavail: blocks,
            files: config.inodes,
            ffree: config.inodes.saturating_sub(1),
            fsid: FSID,
            namelen: NAMELEN,
        };
        Store {
            barrier: RwLock::new(()),
            rename_mutex: Mutex::new(()),
            table,
            stat: RwLock::new(stat),
            readdir: ReaddirManager::new(),
            snapshots: Snapshots::new(),
        }
    }

    fn barrier_read(&self) -> RwLockReadGuard<'_, ()> {
        self.barrier.read()
    }

    fn space(&self) -> StatHandle<'_> {
        StatHandle(&self.stat)
    }

    fn get_live(&self, ino: u64) -> Result<std::sync::Arc<Inode>> {
        self.table.get_checked(ino)
    }

    fn destroy_if_unreferenced(&self, inode: &Inode) {
        if inode.nlink() == 0 && inode.lookup_count() == 0 {
            match inode.kind() {
                NodeKind::File => self.space().release_blocks(inode.size().div_ceil(crate::inode::BLKSIZE)),
                NodeKind::Directory => {
                    self.space().release_blocks(inode.size().div_ceil(crate::inode::BLKSIZE))
                }
                _ => {}
            }
            self.table.delete(inode.ino());
            self.space().release_inode();
        } else if inode.nlink() == 0 {
            inode.mark_for_deletion();
        }
    }

    // -- node creation (§4.4) --------------------------------------------

    fn node_kind_for_mode(mode: u32) -> Result<(NodeKind, Option<SpecialTag>)> {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Ok((NodeKind::File, None)),
            libc::S_IFDIR => Ok((NodeKind::Directory, None)),
            libc::S_IFLNK => Ok((NodeKind::Symlink, None)),
            libc::S_IFCHR => Ok((NodeKind::CharDev, Some(SpecialTag::CharDev))),
            libc::S_IFBLK => Ok((NodeKind::BlockDev, Some(SpecialTag::BlockDev))),
            libc::S_IFIFO => Ok((NodeKind::Fifo, Some(SpecialTag::Fifo))),
            libc::S_IFSOCK => Ok((NodeKind::Socket, Some(SpecialTag::Sock))),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn mknod(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        rdev: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Attr> {
        let _b = self.barrier_read();
        let parent_inode = self.get_live(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        if parent_inode.child_ino(name)? != 0 {
            return Err(Error::Exists);
        }
        let (kind, tag) = Self::node_kind_for_mode(mode)?;
        if kind == NodeKind::Directory {
            return Err(Error::InvalidArgument); // use mkdir
        }
        self.space().try_reserve_inode()?;
        let ino = self.table.add(|ino| match (kind, tag) {
            (NodeKind::File, _) => Inode::new_file(ino, mode, uid, gid),
            (_, Some(tag)) => Inode::new_special(ino, kind, tag, mode, uid, gid, Some(rdev)),
            _ => unreachable!(),
        });
        let inode = self.table.get(ino).expect("just inserted");
        if let Err(e) = parent_inode.add_child(name, ino, &self.space()) {
            self.table.delete(ino);
            self.space().release_inode();
            return Err(e);
        }
        Ok(inode.note_lookup())
    }

    pub fn mkdir(&self, parent: u64, name: &str, mode: u32, uid: u32, gid: u32) -> Result<Attr> {
        let _b = self.barrier_read();
        let parent_inode = self.get_live(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        if parent_inode.child_ino(name)? != 0 {
            return Err(Error::Exists);
        }
        self.space().try_reserve_inode()?;
        let ino = self
            .table
            .add(|ino| Inode::new_directory(ino, mode, uid, gid, parent));
        let inode = self.table.get(ino).expect("just inserted");
        if let Err(e) = parent_inode.add_child(name, ino, &self.space()) {
            self.table.delete(ino);
            self.space().release_inode();
            return Err(e);
        }
        parent_inode.inc_nlink();
        Ok(inode.note_lookup())
    }

    pub fn symlink(
        &self,
        parent: u64,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<Attr> {
        let _b = self.barrier_read();
        let parent_inode = self.get_live(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        if parent_inode.child_ino(name)? != 0 {
            return Err(Error::Exists);
        }
        self.space().try_reserve_inode()?;
        let ino = self
            .table
            .add(|ino| Inode::new_symlink(ino, 0o777, uid, gid, target.to_string()));
        let inode = self.table.get(ino).expect("just inserted");
        if let Err(e) = parent_inode.add_child(name, ino, &self.space()) {
            self.table.delete(ino);
            self.space().release_inode();
            return Err(e);
        }
        Ok(inode.note_lookup())
    }

    pub fn readlink(&self, ino: u64) -> Result<String> {
        let _b = self.barrier_read();
        self.get_live(ino)?.readlink()
    }

    // -- removal ----------------------------------------------------------

    pub fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        let _b = self.barrier_read();
        let parent_inode = self.get_live(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        let ino = parent_inode.child_ino(name)?;
        if ino == 0 {
            return Err(Error::NotFound);
        }
        let target = self.get_live(ino)?;
        if target.is_dir() {
            return Err(Error::IsDir);
        }
        parent_inode.remove_child(name, &self.space())?;
        target.dec_nlink();
        self.destroy_if_unreferenced(&target);
        Ok(())
    }

    pub fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        let _b = self.barrier_read();
        if name == "." || name == ".." {
            return Err(Error::InvalidArgument);
        }
        let parent_inode = self.get_live(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        let ino = parent_inode.child_ino(name)?;
        if ino == 0 {
            return Err(Error::NotFound);
        }
        if ino == parent {
            return Err(Error::InvalidArgument);
        }
        let target = self.get_live(ino)?;
        if !target.is_dir() {
            return Err(Error::NotDir);
        }
        let table = &self.table;
        if !target.is_empty(&|child_ino| {
            table
                .get(child_ino)
                .map(|i| i.is_live())
                .unwrap_or(false)
        })? {
            return Err(Error::NotEmpty);
        }
        parent_inode.remove_child(name, &self.space())?;
        target.set_nlink(0);
        parent_inode.dec_nlink();
        self.destroy_if_unreferenced(&target);
        Ok(())
    }

    // -- rename (§4.4, design note 3) -------------------------------------

    pub fn rename(&self, parent: u64, name: &str, new_parent: u64, new_name: &str) -> Result<()> {
        let _b = self.barrier_read();
        if name == "." || name == ".." {
            return Err(Error::InvalidArgument);
        }
        let _rename_guard = self.rename_mutex.lock();

        let src_parent = self.get_live(parent)?;
        let dst_parent = self.get_live(new_parent)?;
        if !src_parent.is_dir() || !dst_parent.is_dir() {
            return Err(Error::NotDir);
        }

        // Acquire the (up to two) distinct directory locks in ascending
        // inode-number order, per design note 3, and drive the rest of the
        // operation off the held guards directly — `parking_lot`'s locks
        // are not reentrant, so re-locking through `child_ino`/`add_child`
        // and friends here would deadlock a same-directory rename.
        if src_parent.ino() == dst_parent.ino() {
            let mut entries = src_parent.directory()?.write();
            self.rename_within(&src_parent, &mut entries, name, new_name)
        } else if src_parent.ino() < dst_parent.ino() {
            let mut src_entries = src_parent.directory()?.write();
            let mut dst_entries = dst_parent.directory()?.write();
            self.rename_across(
                &src_parent,
                &mut src_entries,
                &dst_parent,
                &mut dst_entries,
                name,
                new_name,
            )
        } else {
            let mut dst_entries = dst_parent.directory()?.write();
            let mut src_entries = src_parent.directory()?.write();
            self.rename_across(
                &src_parent,
                &mut src_entries,
                &dst_parent,
                &mut dst_entries,
                name,
                new_name,
            )
        }
    }

    fn rename_within(
        &self,
        parent: &Inode,
        entries: &mut Vec<DirEntry>,
        name: &str,
        new_name: &str,
    ) -> Result<()> {
        let src_ino = Inode::child_ino_in(entries, name);
        if src_ino == 0 {
            return Err(Error::NotFound);
        }
        if name == new_name {
            return Ok(());
        }
        let dst_ino = Inode::child_ino_in(entries, new_name);
        if dst_ino != 0 {
            let src_inode = self.get_live(src_ino)?;
            let dst_inode = self.get_live(dst_ino)?;
            self.replace_rename_target(&src_inode, &dst_inode, parent)?;
            parent.update_child_in(entries, new_name, src_ino)?;
        } else {
            parent.insert_child_in(entries, new_name, src_ino, &self.space())?;
        }
        parent.remove_child_in(entries, name, &self.space())?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_across(
        &self,
        src_parent: &Inode,
        src_entries: &mut Vec<DirEntry>,
        dst_parent: &Inode,
        dst_entries: &mut Vec<DirEntry>,
        name: &str,
        new_name: &str,
    ) -> Result<()> {
        let src_ino = Inode::child_ino_in(src_entries, name);
        if src_ino == 0 {
            return Err(Error::NotFound);
        }
        let src_inode = self.get_live(src_ino)?;
        let dst_ino = Inode::child_ino_in(dst_entries, new_name);
        if dst_ino != 0 {
            let dst_inode = self.get_live(dst_ino)?;
            self.replace_rename_target(&src_inode, &dst_inode, dst_parent)?;
            dst_parent.update_child_in(dst_entries, new_name, src_ino)?;
        } else {
            dst_parent.insert_child_in(dst_entries, new_name, src_ino, &self.space())?;
        }
        src_parent.remove_child_in(src_entries, name, &self.space())?;

        if src_inode.is_dir() {
            src_inode.update_child("..", dst_parent.ino())?;
            src_parent.dec_nlink();
            dst_parent.inc_nlink();
        }
        Ok(())
    }

    fn replace_rename_target(
        &self,
        src_inode: &Inode,
        dst_inode: &Inode,
        dst_parent: &Inode,
    ) -> Result<()> {
        match (src_inode.is_dir(), dst_inode.is_dir()) {
            (true, false) => return Err(Error::NotDir),
            (false, true) => return Err(Error::IsDir),
            _ => {}
        }
        if dst_inode.is_dir() {
            let table = &self.table;
            if !dst_inode.is_empty(&|child_ino| {
                table.get(child_ino).map(|i| i.is_live()).unwrap_or(false)
            })? {
                return Err(Error::NotEmpty);
            }
            dst_inode.set_nlink(0);
            dst_parent.dec_nlink();
        } else {
            dst_inode.dec_nlink();
        }
        self.destroy_if_unreferenced(dst_inode);
        Ok(())
    }

    pub fn link(&self, ino: u64, new_parent: u64, new_name: &str) -> Result<Attr> {
        let _b = self.barrier_read();
        let target = self.get_live(ino)?;
        if target.is_dir() {
            return Err(Error::InvalidArgument);
        }
        let parent_inode = self.get_live(new_parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        if parent_inode.child_ino(new_name)? != 0 {
            return Err(Error::Exists);
        }
        parent_inode.add_child(new_name, ino, &self.space())?;
        target.inc_nlink();
        Ok(target.note_lookup())
    }

    // -- lookup / attributes ----------------------------------------------

    pub fn lookup(&self, parent: u64, name: &str) -> Result<Attr> {
        let _b = self.barrier_read();
        let parent_inode = self.get_live(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        let ino = parent_inode.child_ino(name)?;
        if ino == 0 {
            return Err(Error::NotFound);
        }
        Ok(self.get_live(ino)?.note_lookup())
    }

    pub fn getattr(&self, ino: u64) -> Result<Attr> {
        let _b = self.barrier_read();
        Ok(self.get_live(ino)?.attr())
    }

    pub fn setattr(&self, ino: u64, mask: SetAttrMask, values: SetAttrValues) -> Result<Attr> {
        let _b = self.barrier_read();
        let inode = self.get_live(ino)?;
        inode.set_attr(mask, values)?;
        Ok(inode.attr())
    }

    pub fn forget(&self, ino: u64, n: u64) {
        let _b = self.barrier_read();
        if let Some(inode) = self.table.get(ino) {
            if inode.forget(n) {
                self.destroy_if_unreferenced(&inode);
            }
        }
    }

    pub fn access(&self, ino: u64, mask: AccessMask, uid: u32, gid: u32) -> Result<()> {
        let _b = self.barrier_read();
        self.get_live(ino)?.access(mask, uid, gid)
    }

    pub fn statfs(&self) -> StatFs {
        let _b = self.barrier_read();
        self.stat.read().clone()
    }

    // -- file I/O -----------------------------------------------------------

    pub fn read(&self, ino: u64, size: usize, off: u64) -> Result<Vec<u8>> {
        let _b = self.barrier_read();
        self.get_live(ino)?.read(size, off)
    }

    pub fn write(&self, ino: u64, data: &[u8], off: u64) -> Result<usize> {
        let _b = self.barrier_read();
        self.get_live(ino)?.write(data, off, &self.space())
    }

    pub fn truncate(&self, ino: u64, size: u64) -> Result<()> {
        let _b = self.barrier_read();
        self.get_live(ino)?.truncate(size)
    }

    // -- xattrs -----------------------------------------------------------

    pub fn set_xattr(
        &self,
        ino: u64,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
        position: usize,
    ) -> Result<()> {
        let _b = self.barrier_read();
        self.get_live(ino)?.set_xattr(name, value, flags, position)
    }

    pub fn get_xattr(&self, ino: u64, name: &str, size: usize, position: usize) -> Result<XattrReply> {
        let _b = self.barrier_read();
        self.get_live(ino)?.get_xattr(name, size, position)
    }

    pub fn list_xattr(&self, ino: u64, size: usize) -> Result<XattrReply> {
        let _b = self.barrier_read();
        self.get_live(ino)?.list_xattr(size)
    }

    pub fn remove_xattr(&self, ino: u64, name: &str) -> Result<()> {
        let _b = self.barrier_read();
        self.get_live(ino)?.remove_xattr(name)
    }

    // -- readdir (C5) -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn readdir(
        &self,
        ino: u64,
        offset: u64,
        fits: impl FnMut(u64, &DirEntry) -> bool,
    ) -> Result<(u64, Vec<DirEntry>)> {
        let _b = self.barrier_read();
        let dir = self.get_live(ino)?;
        if !dir.is_dir() {
            return Err(Error::NotDir);
        }
        let table = &self.table;
        let (cookie, batch) = self.readdir.read(
            offset,
            || dir.children_snapshot().unwrap_or_default(),
            &|child_ino| table.get(child_ino).map(|i| i.is_live()).unwrap_or(false),
            fits,
            DEFAULT_MAX_ENTRIES,
        );
        Ok((cookie, batch))
    }

    // -- ioctl dispatch (§6) ------------------------------------------------

    pub fn checkpoint(&self, key: u64) -> Result<()> {
        let _b = self.barrier.write();
        self.snapshots.checkpoint(&self.table, &self.stat, key)
    }

    pub fn restore(&self, key: u64, invalidator: &dyn CacheInvalidator) -> Result<()> {
        let _b = self.barrier.write();
        self.snapshots
            .restore(&self.table, &self.stat, key, invalidator)
    }

    pub fn pickle(&self, path: &Path) -> Result<()> {
        let _b = self.barrier.write();
        pickle::pickle(&self.table, &self.stat, &self.snapshots, path)
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let _b = self.barrier.write();
        pickle::load(&self.table, &self.stat, &self.snapshots, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(&StoreConfig::default())
    }

    #[test]
    fn mkdir_then_lookup_finds_it() {
        let s = store();
        let attr = s.mkdir(ROOT_INO, "sub", 0o755, 0, 0).unwrap();
        let found = s.lookup(ROOT_INO, "sub").unwrap();
        assert_eq!(found.ino, attr.ino);
        assert_eq!(found.kind, NodeKind::Directory);
    }

    #[test]
    fn mkdir_duplicate_name_fails() {
        let s = store();
        s.mkdir(ROOT_INO, "sub", 0o755, 0, 0).unwrap();
        assert!(matches!(
            s.mkdir(ROOT_INO, "sub", 0o755, 0, 0),
            Err(Error::Exists)
        ));
    }

    #[test]
    fn unlink_then_lookup_fails() {
        let s = store();
        s.mknod(ROOT_INO, "f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        s.unlink(ROOT_INO, "f").unwrap();
        assert!(matches!(s.lookup(ROOT_INO, "f"), Err(Error::NotFound)));
    }

    #[test]
    fn rmdir_rejects_non_empty_directory() {
        let s = store();
        s.mkdir(ROOT_INO, "sub", 0o755, 0, 0).unwrap();
        let sub = s.lookup(ROOT_INO, "sub").unwrap().ino;
        s.mknod(sub, "f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        assert!(matches!(s.rmdir(ROOT_INO, "sub"), Err(Error::NotEmpty)));
    }

    #[test]
    fn rename_within_same_directory() {
        let s = store();
        s.mknod(ROOT_INO, "a", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        s.rename(ROOT_INO, "a", ROOT_INO, "b").unwrap();
        assert!(matches!(s.lookup(ROOT_INO, "a"), Err(Error::NotFound)));
        assert!(s.lookup(ROOT_INO, "b").is_ok());
    }

    #[test]
    fn rename_across_directories_updates_dotdot() {
        let s = store();
        s.mkdir(ROOT_INO, "src", 0o755, 0, 0).unwrap();
        s.mkdir(ROOT_INO, "dst", 0o755, 0, 0).unwrap();
        let src = s.lookup(ROOT_INO, "src").unwrap().ino;
        let dst = s.lookup(ROOT_INO, "dst").unwrap().ino;
        s.mkdir(src, "moved", 0o755, 0, 0).unwrap();
        s.rename(src, "moved", dst, "moved").unwrap();

        let moved = s.lookup(dst, "moved").unwrap().ino;
        let dotdot = s.readdir(moved, 0, |_, _| true).unwrap().1;
        let parent_ino = dotdot.iter().find(|e| e.name == "..").unwrap().ino;
        assert_eq!(parent_ino, dst);
    }

    #[test]
    fn rename_onto_existing_file_replaces_it() {
        let s = store();
        s.mknod(ROOT_INO, "a", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        let b_attr = s.mknod(ROOT_INO, "b", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        s.rename(ROOT_INO, "a", ROOT_INO, "b").unwrap();
        assert!(matches!(s.lookup(ROOT_INO, "a"), Err(Error::NotFound)));
        let renamed = s.lookup(ROOT_INO, "b").unwrap();
        assert_ne!(renamed.ino, b_attr.ino);
        s.forget(b_attr.ino, 1);
        assert!(matches!(s.getattr(b_attr.ino), Err(Error::NotFound)));
    }

    #[test]
    fn link_increments_nlink_and_both_names_resolve() {
        let s = store();
        let attr = s.mknod(ROOT_INO, "a", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        s.link(attr.ino, ROOT_INO, "b").unwrap();
        let a = s.lookup(ROOT_INO, "a").unwrap();
        let b = s.lookup(ROOT_INO, "b").unwrap();
        assert_eq!(a.ino, b.ino);
        assert_eq!(b.meta.nlink, 2);
    }

    #[test]
    fn write_read_and_truncate_through_the_facade() {
        let s = store();
        let attr = s.mknod(ROOT_INO, "f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        s.write(attr.ino, b"abcdef", 0).unwrap();
        assert_eq!(s.read(attr.ino, 3, 2).unwrap(), b"cde");
        s.truncate(attr.ino, 2).unwrap();
        assert_eq!(s.getattr(attr.ino).unwrap().meta.size, 2);
    }

    #[test]
    fn readdir_paginates_across_calls() {
        let s = store();
        for i in 0..10 {
            s.mknod(ROOT_INO, &format!("f{i}"), libc::S_IFREG | 0o644, 0, 0, 0)
                .unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        let mut offset = 0u64;
        loop {
            let (cookie, batch) = s.readdir(ROOT_INO, offset, |_, _| true).unwrap();
            if batch.is_empty() {
                break;
            }
            for entry in &batch {
                seen.insert(entry.name.clone());
            }
            offset = cookie + batch.len() as u64;
        }
        for i in 0..10 {
            assert!(seen.contains(&format!("f{i}")));
        }
        assert!(seen.contains("."));
        assert!(seen.contains(".."));
    }

    #[test]
    fn checkpoint_and_restore_round_trip() {
        let s = store();
        s.checkpoint(1).unwrap();
        s.mknod(ROOT_INO, "ephemeral", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        assert!(s.lookup(ROOT_INO, "ephemeral").is_ok());
        s.restore(1, &NullInvalidator).unwrap();
        assert!(matches!(s.lookup(ROOT_INO, "ephemeral"), Err(Error::NotFound)));
    }

    #[test]
    fn pickle_and_load_round_trip() {
        let s = store();
        s.mkdir(ROOT_INO, "dir", 0o755, 0, 0).unwrap();
        let dir_ino = s.lookup(ROOT_INO, "dir").unwrap().ino;
        let f = s.mknod(dir_ino, "f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        s.write(f.ino, b"persisted", 0).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("snapshot.rffs");
        s.pickle(&path).unwrap();

        let reloaded = store();
        reloaded.load(&path).unwrap();
        let dir_ino = reloaded.lookup(ROOT_INO, "dir").unwrap().ino;
        let f = reloaded.lookup(dir_ino, "f").unwrap();
        assert_eq!(reloaded.read(f.ino, 64, 0).unwrap(), b"persisted");
    }

    #[test]
    fn retained_checkpoint_survives_pickle_load_then_restores() {
        let s = store();
        s.mknod(ROOT_INO, "before", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        s.checkpoint(7).unwrap();
        s.mknod(ROOT_INO, "after", libc::S_IFREG | 0o644, 0, 0, 0)
            .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("snapshot.rffs");
        s.pickle(&path).unwrap();

        let reloaded = store();
        reloaded.load(&path).unwrap();
        assert!(reloaded.lookup(ROOT_INO, "after").is_ok());

        reloaded.restore(7, &NullInvalidator).unwrap();
        assert!(reloaded.lookup(ROOT_INO, "before").is_ok());
        assert!(matches!(
            reloaded.lookup(ROOT_INO, "after"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn statfs_reflects_inode_usage() {
        let s = store();
        let before = s.statfs().ffree;
        s.mknod(ROOT_INO, "f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        let after = s.statfs().ffree;
        assert_eq!(after, before - 1);
    }
}
