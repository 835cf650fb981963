//! Snapshot engine (C6): deep-copies the entire store under the global
//! barrier, keyed by a caller-supplied 64-bit token. Snapshots are kept
//! by value (design note: "snapshot pool stored by value") so restoring
//! clones *into* the live arena and the snapshot stays reusable.

use crate::error::{Error, Result};
use crate::inode::Inode;
use crate::store::{CacheInvalidator, StatFs};
use crate::table::Table;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};

pub struct Snapshot {
    slots: Vec<Option<Inode>>,
    deleted: VecDeque<u64>,
    stat: StatFs,
}

pub struct Snapshots {
    map: Mutex<HashMap<u64, Snapshot>>,
}

impl Snapshots {
    pub fn new() -> Snapshots {
        Snapshots {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Caller must already hold the barrier exclusively.
    pub fn checkpoint(&self, table: &Table, stat: &RwLock<StatFs>, key: u64) -> Result<()> {
        let mut map = self.map.lock();
        if map.contains_key(&key) {
            return Err(Error::SnapshotExists);
        }
        let mut slots = Vec::with_capacity(table.len());
        table_raw_clone(table, &mut slots);
        let snapshot = Snapshot {
            slots,
            deleted: table.deleted_snapshot().into(),
            stat: stat.read().clone(),
        };
        map.insert(key, snapshot);
        Ok(())
    }

    /// Caller must already hold the barrier exclusively. Invalidates
    /// kernel caches for the *current* live state before swapping, since
    /// the VFS cache is otherwise unaware the swap happened.
    pub fn restore(
        &self,
        table: &Table,
        stat: &RwLock<StatFs>,
        key: u64,
        invalidator: &dyn CacheInvalidator,
    ) -> Result<()> {
        let map = self.map.lock();
        let snapshot = map.get(&key).ok_or(Error::SnapshotNotFound)?;

        table.for_each_live(|inode| {
            invalidator.invalidate_inode(inode.ino());
            if inode.is_dir() {
                if let Ok(children) = inode.children_snapshot() {
                    for child in children {
                        if child.name != "." && child.name != ".." {
                            invalidator.invalidate_entry(inode.ino(), &child.name);
                        }
                    }
                }
            }
        });

        let cloned: Vec<Option<Inode>> = snapshot
            .slots
            .iter()
            .map(|slot| slot.as_ref().map(Inode::deep_clone))
            .collect();
        let cloned: Vec<Option<std::sync::Arc<Inode>>> = cloned
            .into_iter()
            .map(|slot| slot.map(std::sync::Arc::new))
            .collect();
        table.install(cloned, snapshot.deleted.clone());
        *stat.write() = snapshot.stat.clone();
        Ok(())
    }
}

impl Default for Snapshots {
    fn default() -> Snapshots {
        Snapshots::new()
    }
}

impl Snapshot {
    pub(crate) fn slots(&self) -> &[Option<Inode>] {
        &self.slots
    }

    pub(crate) fn deleted(&self) -> &VecDeque<u64> {
        &self.deleted
    }

    pub(crate) fn stat(&self) -> &StatFs {
        &self.stat
    }
}

impl Snapshots {
    /// Used by the pickle codec: walks the retained snapshots in an
    /// unspecified but stable-for-the-duration-of-the-call order.
    pub(crate) fn for_each(&self, mut f: impl FnMut(u64, &Snapshot)) {
        let map = self.map.lock();
        for (key, snapshot) in map.iter() {
            f(*key, snapshot);
        }
    }

    pub(crate) fn from_parts(slots: Vec<Option<Inode>>, deleted: VecDeque<u64>, stat: StatFs) -> Snapshot {
        Snapshot { slots, deleted, stat }
    }

    /// Replaces the whole retained set, for the pickle codec's `load`.
    pub(crate) fn install_all(&self, snapshots: Vec<(u64, Snapshot)>) {
        *self.map.lock() = snapshots.into_iter().collect();
    }
}

fn table_raw_clone(table: &Table, out: &mut Vec<Option<Inode>>) {
    // `for_each_live` only visits occupied slots; we need `None` holes to
    // line up index-for-index with the live table, so walk ids directly.
    for maybe_ino in table.snapshot_ids() {
        out.push(maybe_ino.and_then(|ino| table.get(ino)).map(|rc| rc.deep_clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::SpaceAccounting;
    use crate::table::ROOT_INO;

    struct Unlimited;
    impl SpaceAccounting for Unlimited {
        fn try_reserve_blocks(&self, _delta: i64) -> Result<()> {
            Ok(())
        }
        fn release_blocks(&self, _delta: u64) {}
    }

    struct NoopInvalidator;
    impl CacheInvalidator for NoopInvalidator {
        fn invalidate_inode(&self, _ino: u64) {}
        fn invalidate_entry(&self, _parent: u64, _name: &str) {}
    }

    fn fresh_table() -> Table {
        let table = Table::new();
        let root = table.add(|ino| Inode::new_directory(ino, 0o755, 0, 0, ino));
        assert_eq!(root, ROOT_INO);
        table
    }

    #[test]
    fn restore_reverts_mutations_made_after_the_checkpoint() {
        let table = fresh_table();
        let stat = RwLock::new(StatFs {
            blocks: 100,
            bfree: 100,
            bavail: 100,
            files: 10,
            ffree: 9,
            fsid: 0,
            namelen: 255,
        });
        let snapshots = Snapshots::new();
        snapshots.checkpoint(&table, &stat, 1).unwrap();

        let root = table.get(ROOT_INO).unwrap();
        let file_ino = table.add(|ino| Inode::new_file(ino, 0o644, 0, 0));
        root.add_child("new_file", file_ino, &Unlimited).unwrap();
        assert_eq!(table.get(file_ino).map(|i| i.ino()), Some(file_ino));

        snapshots.restore(&table, &stat, 1, &NoopInvalidator).unwrap();

        let root_after = table.get(ROOT_INO).unwrap();
        assert_eq!(root_after.child_ino("new_file").unwrap(), 0);
    }

    #[test]
    fn checkpoint_rejects_duplicate_key() {
        let table = fresh_table();
        let stat = RwLock::new(StatFs {
            blocks: 1,
            bfree: 1,
            bavail: 1,
            files: 1,
            ffree: 0,
            fsid: 0,
            namelen: 255,
        });
        let snapshots = Snapshots::new();
        snapshots.checkpoint(&table, &stat, 7).unwrap();
        assert!(matches!(
            snapshots.checkpoint(&table, &stat, 7),
            Err(Error::SnapshotExists)
        ));
    }

    #[test]
    fn restore_unknown_key_fails() {
        let table = fresh_table();
        let stat = RwLock::new(StatFs {
            blocks: 1,
            bfree: 1,
            bavail: 1,
            files: 1,
            ffree: 0,
            fsid: 0,
            namelen: 255,
        });
        let snapshots = Snapshots::new();
        assert!(matches!(
            snapshots.restore(&table, &stat, 42, &NoopInvalidator),
            Err(Error::SnapshotNotFound)
        ));
    }

    #[test]
    fn checkpoint_is_reusable_after_a_restore() {
        let table = fresh_table();
        let stat = RwLock::new(StatFs {
            blocks: 10,
            bfree: 10,
            bavail: 10,
            files: 10,
            ffree: 9,
            fsid: 0,
            namelen: 255,
        });
        let snapshots = Snapshots::new();
        snapshots.checkpoint(&table, &stat, 1).unwrap();
        snapshots.restore(&table, &stat, 1, &NoopInvalidator).unwrap();
        // The snapshot pool keeps values, not references into the live
        // arena, so restoring a second time must still succeed.
        snapshots.restore(&table, &stat, 1, &NoopInvalidator).unwrap();
    }
}
