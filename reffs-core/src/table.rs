//! Inode table (C3): the arena. All cross-inode references are inode
//! numbers, never raw pointers, so snapshot/restore, pickle/load and
//! cache invalidation only ever walk plain data.

use crate::error::{Error, Result};
use crate::inode::Inode;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

/// Inode number 0 is the "not found" sentinel; slot 0 itself holds a
/// placeholder so real inodes start at 1, the root.
pub const ROOT_INO: u64 = 1;

pub struct Table {
    slots: RwLock<Vec<Option<Arc<Inode>>>>,
    deleted: Mutex<VecDeque<u64>>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            slots: RwLock::new(vec![None]),
            deleted: Mutex::new(VecDeque::new()),
        }
    }

    /// Inserts `inode` and returns its assigned inode number, reusing a
    /// freed slot when one is available.
    pub fn add(&self, make: impl FnOnce(u64) -> Inode) -> u64 {
        let mut deleted = self.deleted.lock();
        let mut slots = self.slots.write();
        if let Some(ino) = deleted.pop_front() {
            slots[ino as usize] = Some(Arc::new(make(ino)));
            return ino;
        }
        let ino = slots.len() as u64;
        slots.push(Some(Arc::new(make(ino))));
        ino
    }

    pub fn get(&self, ino: u64) -> Option<Arc<Inode>> {
        if ino == 0 {
            return None;
        }
        let slots = self.slots.read();
        slots.get(ino as usize).and_then(|slot| slot.clone())
    }

    pub fn get_checked(&self, ino: u64) -> Result<Arc<Inode>> {
        self.get(ino).filter(|i| i.is_live()).ok_or(Error::NotFound)
    }

    /// Removes a slot and returns it to the free list. Only valid for an
    /// inode that is no longer referenced (`nlink == 0 && lookup_count ==
    /// 0`); callers must have already checked that.
    pub fn delete(&self, ino: u64) {
        let mut deleted = self.deleted.lock();
        let mut slots = self.slots.write();
        slots[ino as usize] = None;
        deleted.push_back(ino);
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deleted_len(&self) -> usize {
        self.deleted.lock().len()
    }

    /// Live (non-`None`) inode count, used for `stat.files` bookkeeping
    /// and invariant checks.
    pub fn live_count(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    /// Iterates every live inode; used by checkpoint/restore and pickle,
    /// which need to visit the whole arena.
    pub fn for_each_live(&self, mut f: impl FnMut(&Arc<Inode>)) {
        for slot in self.slots.read().iter().flatten() {
            f(slot);
        }
    }

    pub(crate) fn snapshot_ids(&self) -> Vec<Option<u64>> {
        self.slots
            .read()
            .iter()
            .map(|slot| slot.as_ref().map(|i| i.ino()))
            .collect()
    }

    pub(crate) fn deleted_snapshot(&self) -> Vec<u64> {
        self.deleted.lock().iter().copied().collect()
    }

    /// Atomically replaces the whole arena. Used only by snapshot restore
    /// and pickle load.
    pub(crate) fn install(&self, slots: Vec<Option<Arc<Inode>>>, deleted: VecDeque<u64>) {
        *self.slots.write() = slots;
        *self.deleted.lock() = deleted;
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::Inode;

    fn mkfile(ino: u64) -> Inode {
        Inode::new_file(ino, 0o644, 0, 0)
    }

    #[test]
    fn add_assigns_increasing_inos_and_skips_sentinel() {
        let table = Table::new();
        let a = table.add(mkfile);
        let b = table.add(mkfile);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(table.len(), 3); // slot 0 (sentinel) + a + b
    }

    #[test]
    fn delete_reuses_freed_slot() {
        let table = Table::new();
        let a = table.add(mkfile);
        table.delete(a);
        assert!(table.get(a).is_none());
        assert_eq!(table.deleted_len(), 1);
        let b = table.add(mkfile);
        assert_eq!(b, a, "freed slot should be reused before growing the arena");
        assert_eq!(table.deleted_len(), 0);
    }

    #[test]
    fn get_checked_rejects_unlinked_inode() {
        let table = Table::new();
        let ino = table.add(|ino| Inode::new_file(ino, 0o644, 0, 0));
        let inode = table.get(ino).unwrap();
        inode.dec_nlink();
        assert!(table.get_checked(ino).is_err());
    }

    #[test]
    fn get_zero_is_always_none() {
        let table = Table::new();
        table.add(mkfile);
        assert!(table.get(0).is_none());
    }

    #[test]
    fn for_each_live_visits_only_occupied_slots() {
        let table = Table::new();
        let a = table.add(mkfile);
        let b = table.add(mkfile);
        table.delete(a);
        let mut seen = Vec::new();
        table.for_each_live(|inode| seen.push(inode.ino()));
        assert_eq!(seen, vec![b]);
    }
}
