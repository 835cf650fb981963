//! On-disk pickle/load codec (C7): a deterministic binary snapshot of the
//! whole store, headed by a `{file_size, sha256}` record so `load` can
//! detect truncation or corruption before it ever touches the live arena.
//!
//! Every integer on the wire is explicit-width little-endian (design note:
//! redesigned from a native-endian struct dump so a pickle produced on one
//! host loads correctly on any other). The fixed header is the only part
//! laid out with `zerocopy`; the body is variable-length and framed by
//! hand, one length-prefixed field at a time.

use crate::error::{Error, Result};
use crate::inode::{DirEntry, Inode, Meta, PickledPayload, SpecialTag};
use crate::snapshot::{Snapshot, Snapshots};
use crate::store::StatFs;
use crate::table::Table;
use parking_lot::RwLock;
use reffs_abi::NodeKind;
use sha2::{Digest, Sha256};
use static_assertions::const_assert_eq;
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const MAGIC: [u8; 4] = *b"RFFS";
const FORMAT_VERSION: u32 = 1;

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Header {
    magic: [u8; 4],
    version: u32,
    file_size: u64,
    sha256: [u8; 32],
}

const_assert_eq!(std::mem::size_of::<Header>(), 4 + 4 + 8 + 32);

pub fn pickle(table: &Table, stat: &RwLock<StatFs>, snapshots: &Snapshots, path: &Path) -> Result<()> {
    let mut body = Vec::new();
    write_statfs(&stat.read(), &mut body);
    write_table(table, &mut body);
    write_snapshots(snapshots, &mut body);

    let digest = Sha256::digest(&body);
    let mut sha256 = [0u8; 32];
    sha256.copy_from_slice(&digest);

    let header = Header {
        magic: MAGIC,
        version: FORMAT_VERSION,
        file_size: body.len() as u64,
        sha256,
    };

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(header.as_bytes())?;
    out.write_all(&body)?;
    out.flush()?;
    Ok(())
}

pub fn load(table: &Table, stat: &RwLock<StatFs>, snapshots: &Snapshots, path: &Path) -> Result<()> {
    let mut input = BufReader::new(File::open(path)?);

    let mut header_bytes = [0u8; std::mem::size_of::<Header>()];
    input.read_exact(&mut header_bytes)?;
    let header = Header::read_from_bytes(&header_bytes[..]).map_err(|_| Error::SizeMismatch)?;
    if header.magic != MAGIC || header.version != FORMAT_VERSION {
        return Err(Error::InvalidArgument);
    }

    let mut body = Vec::new();
    input.read_to_end(&mut body)?;
    if body.len() as u64 != header.file_size {
        return Err(Error::SizeMismatch);
    }
    if Sha256::digest(&body).as_slice() != header.sha256.as_slice() {
        return Err(Error::HashMismatch);
    }

    let mut cursor = Cursor::new(&body);
    let loaded_stat = read_statfs(&mut cursor)?;
    let (slots, deleted) = read_table(&mut cursor)?;
    let loaded_snapshots = read_snapshots(&mut cursor)?;
    table.install(slots, deleted);
    *stat.write() = loaded_stat;
    snapshots.install_all(loaded_snapshots);
    Ok(())
}

// -- framing ---------------------------------------------------------------

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::SizeMismatch)?;
        let slice = self.bytes.get(self.pos..end).ok_or(Error::SizeMismatch)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes_field(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string_field(&mut self) -> Result<String> {
        String::from_utf8(self.bytes_field()?).map_err(|_| Error::InvalidArgument)
    }

    fn time(&mut self) -> Result<SystemTime> {
        let secs = self.u64()?;
        let nanos = self.u32()?;
        Ok(UNIX_EPOCH + Duration::new(secs, nanos))
    }
}

fn write_bytes_field(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
}

fn write_time(out: &mut Vec<u8>, time: SystemTime) {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    out.extend_from_slice(&since.as_secs().to_le_bytes());
    out.extend_from_slice(&since.subsec_nanos().to_le_bytes());
}

// -- statfs ------------------------------------------------------------------

fn write_statfs(stat: &StatFs, out: &mut Vec<u8>) {
    out.extend_from_slice(&stat.blocks.to_le_bytes());
    out.extend_from_slice(&stat.bfree.to_le_bytes());
    out.extend_from_slice(&stat.bavail.to_le_bytes());
    out.extend_from_slice(&stat.files.to_le_bytes());
    out.extend_from_slice(&stat.ffree.to_le_bytes());
    out.extend_from_slice(&stat.fsid.to_le_bytes());
    out.extend_from_slice(&stat.namelen.to_le_bytes());
}

fn read_statfs(cursor: &mut Cursor<'_>) -> Result<StatFs> {
    Ok(StatFs {
        blocks: cursor.u64()?,
        bfree: cursor.u64()?,
        bavail: cursor.u64()?,
        files: cursor.u64()?,
        ffree: cursor.u64()?,
        fsid: cursor.u64()?,
        namelen: cursor.u32()?,
    })
}

// -- inode table ---------------------------------------------------------------

fn write_table(table: &Table, out: &mut Vec<u8>) {
    let len = table.len() as u64;
    out.extend_from_slice(&len.to_le_bytes());
    for ino in 0..len {
        match table.get(ino) {
            Some(inode) => {
                out.push(1);
                write_inode(&inode, out);
            }
            None => out.push(0),
        }
    }
    let deleted = table.deleted_snapshot();
    out.extend_from_slice(&(deleted.len() as u64).to_le_bytes());
    for ino in deleted {
        out.extend_from_slice(&ino.to_le_bytes());
    }
}

fn write_inode(inode: &Inode, out: &mut Vec<u8>) {
    out.extend_from_slice(&inode.ino().to_le_bytes());
    out.extend_from_slice(&(inode.kind() as u32).to_le_bytes());
    write_meta(&inode.attr().meta, out);
    out.extend_from_slice(&inode.lookup_count().to_le_bytes());
    out.push(inode.is_marked_for_deletion() as u8);

    let xattrs = inode.xattrs_snapshot();
    out.extend_from_slice(&(xattrs.len() as u64).to_le_bytes());
    for (name, value) in &xattrs {
        write_bytes_field(out, name.as_bytes());
        write_bytes_field(out, value);
    }

    match inode.kind() {
        NodeKind::File => {
            write_bytes_field(out, &inode.file_bytes_snapshot().expect("file payload"));
        }
        NodeKind::Directory => {
            let entries = inode.children_snapshot().expect("directory payload");
            out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
            for entry in entries {
                write_bytes_field(out, entry.name.as_bytes());
                out.extend_from_slice(&entry.ino.to_le_bytes());
            }
        }
        NodeKind::Symlink => {
            write_bytes_field(out, inode.readlink().expect("symlink payload").as_bytes());
        }
        NodeKind::CharDev | NodeKind::BlockDev | NodeKind::Fifo | NodeKind::Socket => {
            out.extend_from_slice(&inode.rdev().to_le_bytes());
        }
    }
}

fn write_meta(meta: &Meta, out: &mut Vec<u8>) {
    out.extend_from_slice(&meta.mode.to_le_bytes());
    out.extend_from_slice(&meta.uid.to_le_bytes());
    out.extend_from_slice(&meta.gid.to_le_bytes());
    out.extend_from_slice(&meta.nlink.to_le_bytes());
    out.extend_from_slice(&meta.size.to_le_bytes());
    out.extend_from_slice(&meta.blocks.to_le_bytes());
    write_time(out, meta.atime);
    write_time(out, meta.mtime);
    write_time(out, meta.ctime);
    write_time(out, meta.birthtime);
    out.extend_from_slice(&meta.rdev.to_le_bytes());
}

fn read_table(cursor: &mut Cursor<'_>) -> Result<(Vec<Option<std::sync::Arc<Inode>>>, VecDeque<u64>)> {
    let len = cursor.u64()? as usize;
    let mut slots = Vec::with_capacity(len);
    for ino in 0..len as u64 {
        let present = cursor.u8()?;
        if present == 0 {
            slots.push(None);
        } else {
            slots.push(Some(std::sync::Arc::new(read_inode(cursor, ino)?)));
        }
    }
    let deleted_len = cursor.u64()? as usize;
    let mut deleted = VecDeque::with_capacity(deleted_len);
    for _ in 0..deleted_len {
        deleted.push_back(cursor.u64()?);
    }
    Ok((slots, deleted))
}

// -- retained checkpoints --------------------------------------------------

fn write_snapshots(snapshots: &Snapshots, out: &mut Vec<u8>) {
    let mut body = Vec::new();
    let mut count = 0u64;
    snapshots.for_each(|key, snapshot| {
        count += 1;
        body.extend_from_slice(&key.to_le_bytes());
        write_statfs(snapshot.stat(), &mut body);
        write_slots(snapshot.slots(), snapshot.deleted(), &mut body);
    });
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&body);
}

fn read_snapshots(cursor: &mut Cursor<'_>) -> Result<Vec<(u64, Snapshot)>> {
    let count = cursor.u64()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let key = cursor.u64()?;
        let stat = read_statfs(cursor)?;
        let (slots, deleted) = read_slots(cursor)?;
        out.push((key, Snapshots::from_parts(slots, deleted, stat)));
    }
    Ok(out)
}

fn write_slots(slots: &[Option<Inode>], deleted: &VecDeque<u64>, out: &mut Vec<u8>) {
    out.extend_from_slice(&(slots.len() as u64).to_le_bytes());
    for slot in slots {
        match slot {
            Some(inode) => {
                out.push(1);
                write_inode(inode, out);
            }
            None => out.push(0),
        }
    }
    out.extend_from_slice(&(deleted.len() as u64).to_le_bytes());
    for ino in deleted {
        out.extend_from_slice(&ino.to_le_bytes());
    }
}

fn read_slots(cursor: &mut Cursor<'_>) -> Result<(Vec<Option<Inode>>, VecDeque<u64>)> {
    let len = cursor.u64()? as usize;
    let mut slots = Vec::with_capacity(len);
    for ino in 0..len as u64 {
        let present = cursor.u8()?;
        if present == 0 {
            slots.push(None);
        } else {
            slots.push(Some(read_inode(cursor, ino)?));
        }
    }
    let deleted_len = cursor.u64()? as usize;
    let mut deleted = VecDeque::with_capacity(deleted_len);
    for _ in 0..deleted_len {
        deleted.push_back(cursor.u64()?);
    }
    Ok((slots, deleted))
}

fn read_inode(cursor: &mut Cursor<'_>, expected_ino: u64) -> Result<Inode> {
    let ino = cursor.u64()?;
    if ino != expected_ino {
        return Err(Error::InvalidArgument);
    }
    let kind_tag = cursor.u32()?;
    let kind = NodeKind::from_tag(kind_tag).ok_or(Error::InvalidArgument)?;
    let meta = read_meta(cursor)?;
    let lookup_count = cursor.u64()?;
    let marked_for_deletion = cursor.u8()? != 0;

    let xattr_count = cursor.u64()?;
    let mut xattrs = BTreeMap::new();
    for _ in 0..xattr_count {
        let name = cursor.string_field()?;
        let value = cursor.bytes_field()?;
        xattrs.insert(name, value);
    }

    let payload = match kind {
        NodeKind::File => PickledPayload::File(cursor.bytes_field()?),
        NodeKind::Directory => {
            let count = cursor.u64()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = cursor.string_field()?;
                let child_ino = cursor.u64()?;
                entries.push(DirEntry::new(name, child_ino));
            }
            PickledPayload::Directory(entries)
        }
        NodeKind::Symlink => PickledPayload::Symlink(cursor.string_field()?),
        NodeKind::CharDev => PickledPayload::Special {
            tag: SpecialTag::CharDev,
            dev: Some(cursor.u32()?),
        },
        NodeKind::BlockDev => PickledPayload::Special {
            tag: SpecialTag::BlockDev,
            dev: Some(cursor.u32()?),
        },
        NodeKind::Fifo => PickledPayload::Special {
            tag: SpecialTag::Fifo,
            dev: {
                let _ = cursor.u32()?;
                None
            },
        },
        NodeKind::Socket => PickledPayload::Special {
            tag: SpecialTag::Sock,
            dev: {
                let _ = cursor.u32()?;
                None
            },
        },
    };

    Ok(Inode::from_pickle(
        ino,
        kind,
        meta,
        lookup_count,
        marked_for_deletion,
        xattrs,
        payload,
    ))
}

fn read_meta(cursor: &mut Cursor<'_>) -> Result<Meta> {
    Ok(Meta {
        mode: cursor.u32()?,
        uid: cursor.u32()?,
        gid: cursor.u32()?,
        nlink: cursor.u32()?,
        size: cursor.u64()?,
        blocks: cursor.u64()?,
        atime: cursor.time()?,
        mtime: cursor.time()?,
        ctime: cursor.time()?,
        birthtime: cursor.time()?,
        rdev: cursor.u32()?,
    })
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

    fn sample_table() -> Table {
        let table = Table::new();
        let root = table.add(|ino| Inode::new_directory(ino, 0o755, 0, 0, ino));
        assert_eq!(root, ROOT_INO);
        let root_inode = table.get(root).unwrap();

        let file = table.add(|ino| Inode::new_file(ino, 0o644, 1, 1));
        root_inode.add_child("greeting.txt", file, &Unlimited).unwrap();
        let file_inode = table.get(file).unwrap();
        file_inode.write(b"hello, pickle", 0, &Unlimited).unwrap();
        file_inode.set_xattr("user.tag", b"v1", crate::inode::XattrFlags::empty(), 0).unwrap();

        let link = table.add(|ino| Inode::new_symlink(ino, 0o777, 0, 0, "greeting.txt".to_string()));
        root_inode.add_child("alias", link, &Unlimited).unwrap();

        table
    }

    fn sample_stat() -> StatFs {
        StatFs {
            blocks: 1000,
            bfree: 500,
            bavail: 500,
            files: 100,
            ffree: 97,
            fsid: 0xfeed,
            namelen: 255,
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let table = sample_table();
        let stat = RwLock::new(sample_stat());
        let snapshots = Snapshots::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.rffs");

        pickle(&table, &stat, &snapshots, &path).unwrap();

        let loaded_table = Table::new();
        let loaded_stat = RwLock::new(StatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            fsid: 0,
            namelen: 0,
        });
        let loaded_snapshots = Snapshots::new();
        load(&loaded_table, &loaded_stat, &loaded_snapshots, &path).unwrap();

        assert_eq!(loaded_table.len(), table.len());
        assert_eq!(loaded_stat.read().fsid, 0xfeed);
        assert_eq!(loaded_stat.read().bfree, 500);

        let root = loaded_table.get(ROOT_INO).unwrap();
        let file_ino = root.child_ino("greeting.txt").unwrap();
        let file = loaded_table.get(file_ino).unwrap();
        assert_eq!(file.read(64, 0).unwrap(), b"hello, pickle");
        match file.get_xattr("user.tag", 2, 0).unwrap() {
            crate::inode::XattrReply::Data(v) => assert_eq!(v, b"v1"),
            _ => panic!("expected xattr data"),
        }

        let link_ino = root.child_ino("alias").unwrap();
        let link = loaded_table.get(link_ino).unwrap();
        assert_eq!(link.readlink().unwrap(), "greeting.txt");
    }

    #[test]
    fn load_rejects_truncated_file() {
        let table = sample_table();
        let stat = RwLock::new(sample_stat());
        let snapshots = Snapshots::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.rffs");
        pickle(&table, &stat, &snapshots, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 16]).unwrap();

        let loaded_table = Table::new();
        let loaded_stat = RwLock::new(sample_stat());
        let loaded_snapshots = Snapshots::new();
        let err = load(&loaded_table, &loaded_stat, &loaded_snapshots, &path).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch));
    }

    #[test]
    fn load_rejects_corrupted_body() {
        let table = sample_table();
        let stat = RwLock::new(sample_stat());
        let snapshots = Snapshots::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.rffs");
        pickle(&table, &stat, &snapshots, &path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let loaded_table = Table::new();
        let loaded_stat = RwLock::new(sample_stat());
        let loaded_snapshots = Snapshots::new();
        let err = load(&loaded_table, &loaded_stat, &loaded_snapshots, &path).unwrap_err();
        assert!(matches!(err, Error::HashMismatch));
    }

    #[test]
    fn retained_checkpoints_survive_a_pickle_load_cycle() {
        use crate::store::NullInvalidator;

        let table = sample_table();
        let stat = RwLock::new(sample_stat());
        let snapshots = Snapshots::new();
        snapshots.checkpoint(&table, &stat, 7).unwrap();

        let root = table.get(ROOT_INO).unwrap();
        let extra = table.add(|ino| Inode::new_file(ino, 0o644, 0, 0));
        root.add_child("post_checkpoint.txt", extra, &Unlimited).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.rffs");
        pickle(&table, &stat, &snapshots, &path).unwrap();

        let loaded_table = Table::new();
        let loaded_stat = RwLock::new(sample_stat());
        let loaded_snapshots = Snapshots::new();
        load(&loaded_table, &loaded_stat, &loaded_snapshots, &path).unwrap();

        // The pickle carries the post-checkpoint state...
        let loaded_root = loaded_table.get(ROOT_INO).unwrap();
        assert_ne!(loaded_root.child_ino("post_checkpoint.txt").unwrap(), 0);

        // ...but the retained checkpoint under key 7 is still there and
        // still restores the original pre-checkpoint state.
        loaded_snapshots
            .restore(&loaded_table, &loaded_stat, 7, &NullInvalidator)
            .unwrap();
        let restored_root = loaded_table.get(ROOT_INO).unwrap();
        assert_eq!(restored_root.child_ino("post_checkpoint.txt").unwrap(), 0);
        assert_ne!(restored_root.child_ino("greeting.txt").unwrap(), 0);
    }
}
