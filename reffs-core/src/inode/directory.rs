use super::{blocks_for, Inode, SpaceAccounting};
use crate::error::{Error, Result};

/// Notional per-entry accounting cost, resolving design-note open question
/// 4: a fixed constant plus the name length, matching the on-disk
/// `Dirent` size this workspace's own lineage used for the same purpose.
pub const DIR_ENTRY_COST: u64 = 32;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, ino: u64) -> DirEntry {
        DirEntry {
            name: name.into(),
            ino,
        }
    }

    fn cost(&self) -> u64 {
        DIR_ENTRY_COST + self.name.len() as u64
    }
}

pub(super) fn synthetic_size(entries: &[DirEntry]) -> u64 {
    entries.iter().map(DirEntry::cost).sum()
}

impl Inode {
    pub fn child_ino(&self, name: &str) -> Result<u64> {
        let entries = self.directory()?.read();
        Ok(entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.ino)
            .unwrap_or(0))
    }

    pub fn add_child(&self, name: &str, ino: u64, space: &dyn SpaceAccounting) -> Result<()> {
        let dir = self.directory()?;
        let mut entries = dir.write();
        if entries.iter().any(|e| e.name == name) {
            return Err(Error::Exists);
        }
        let old_blocks = blocks_for(synthetic_size(&entries));
        entries.push(DirEntry::new(name, ino));
        let new_size = synthetic_size(&entries);
        let new_blocks = blocks_for(new_size);
        if new_blocks > old_blocks {
            if let Err(e) = space.try_reserve_blocks((new_blocks - old_blocks) as i64) {
                entries.pop();
                return Err(e);
            }
        }
        drop(entries);
        let mut meta = self.meta.write();
        meta.size = new_size;
        meta.blocks = new_blocks;
        meta.touch_mtime();
        Ok(())
    }

    pub fn update_child(&self, name: &str, new_ino: u64) -> Result<()> {
        let dir = self.directory()?;
        let mut entries = dir.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or(Error::NotFound)?;
        entry.ino = new_ino;
        drop(entries);
        self.meta.write().touch_mtime();
        Ok(())
    }

    pub fn remove_child(&self, name: &str, space: &dyn SpaceAccounting) -> Result<()> {
        let dir = self.directory()?;
        let mut entries = dir.write();
        let pos = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(Error::NotFound)?;
        let old_blocks = blocks_for(synthetic_size(&entries));
        entries.remove(pos);
        let new_size = synthetic_size(&entries);
        let new_blocks = blocks_for(new_size);
        if old_blocks > new_blocks {
            space.release_blocks(old_blocks - new_blocks);
        }
        drop(entries);
        let mut meta = self.meta.write();
        meta.size = new_size;
        meta.blocks = new_blocks;
        meta.touch_mtime();
        Ok(())
    }

    /// True if no entries besides `.`/`..` reference a still-live inode.
    /// `is_live` answers whether a given inode number currently has
    /// `nlink > 0`; the table is the only thing that can answer that.
    pub fn is_empty(&self, is_live: &dyn Fn(u64) -> bool) -> Result<bool> {
        let entries = self.directory()?.read();
        Ok(!entries
            .iter()
            .any(|e| e.name != "." && e.name != ".." && is_live(e.ino)))
    }

    pub fn children_snapshot(&self) -> Result<Vec<DirEntry>> {
        Ok(self.directory()?.read().clone())
    }
}

/// Entry-vector-level counterparts of `child_ino`/`add_child`/
/// `update_child`/`remove_child`, operating on an already-acquired guard
/// rather than taking the directory lock themselves. Rename needs to hold
/// both directories' locks for the whole operation (§5 lock order item 3),
/// and `parking_lot`'s locks are not reentrant, so the façade drives these
/// directly instead of going through the self-locking methods above.
impl Inode {
    pub(crate) fn child_ino_in(entries: &[DirEntry], name: &str) -> u64 {
        entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.ino)
            .unwrap_or(0)
    }

    pub(crate) fn insert_child_in(
        &self,
        entries: &mut Vec<DirEntry>,
        name: &str,
        ino: u64,
        space: &dyn SpaceAccounting,
    ) -> Result<()> {
        if entries.iter().any(|e| e.name == name) {
            return Err(Error::Exists);
        }
        let old_blocks = blocks_for(synthetic_size(entries));
        entries.push(DirEntry::new(name, ino));
        let new_size = synthetic_size(entries);
        let new_blocks = blocks_for(new_size);
        if new_blocks > old_blocks {
            if let Err(e) = space.try_reserve_blocks((new_blocks - old_blocks) as i64) {
                entries.pop();
                return Err(e);
            }
        }
        let mut meta = self.meta.write();
        meta.size = new_size;
        meta.blocks = new_blocks;
        meta.touch_mtime();
        Ok(())
    }

    pub(crate) fn update_child_in(
        &self,
        entries: &mut [DirEntry],
        name: &str,
        new_ino: u64,
    ) -> Result<()> {
        let entry = entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or(Error::NotFound)?;
        entry.ino = new_ino;
        self.meta.write().touch_mtime();
        Ok(())
    }

    pub(crate) fn remove_child_in(
        &self,
        entries: &mut Vec<DirEntry>,
        name: &str,
        space: &dyn SpaceAccounting,
    ) -> Result<()> {
        let pos = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(Error::NotFound)?;
        let old_blocks = blocks_for(synthetic_size(entries));
        entries.remove(pos);
        let new_size = synthetic_size(entries);
        let new_blocks = blocks_for(new_size);
        if old_blocks > new_blocks {
            space.release_blocks(old_blocks - new_blocks);
        }
        let mut meta = self.meta.write();
        meta.size = new_size;
        meta.blocks = new_blocks;
        meta.touch_mtime();
        Ok(())
    }
}
