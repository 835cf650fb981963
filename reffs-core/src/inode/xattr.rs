use crate::error::{Error, Result};
use crate::inode::XattrFlags;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Xattrs = BTreeMap<String, Vec<u8>>;

/// A `get_xattr`/`list_xattr` reply: either the probed length (caller
/// passed `size == 0`) or the actual bytes.
pub enum XattrReply {
    Len(u32),
    Data(Vec<u8>),
}

pub(super) fn set(
    map: &RwLock<Xattrs>,
    name: &str,
    value: &[u8],
    flags: XattrFlags,
    position: usize,
) -> Result<()> {
    let mut map = map.write();
    let exists = map.contains_key(name);
    if flags.contains(XattrFlags::CREATE) && exists {
        return Err(Error::Exists);
    }
    if flags.contains(XattrFlags::REPLACE) && !exists {
        return Err(Error::XattrMissing);
    }
    let buf = map.entry(name.to_string()).or_default();
    let needed = position + value.len();
    if buf.len() < needed {
        buf.resize(needed, 0);
    }
    buf[position..needed].copy_from_slice(value);
    Ok(())
}

pub(super) fn get(
    map: &RwLock<Xattrs>,
    name: &str,
    size: usize,
    position: usize,
) -> Result<XattrReply> {
    let map = map.read();
    let buf = map.get(name).ok_or(Error::XattrMissing)?;
    let tail = buf.get(position..).unwrap_or(&[]);
    if size == 0 {
        return Ok(XattrReply::Len(tail.len() as u32));
    }
    if tail.len() < size {
        return Err(Error::Range);
    }
    Ok(XattrReply::Data(tail[..size].to_vec()))
}

pub(super) fn list(map: &RwLock<Xattrs>, size: usize) -> Result<XattrReply> {
    let map = map.read();
    let mut names = Vec::new();
    for name in map.keys() {
        names.extend_from_slice(name.as_bytes());
        names.push(0);
    }
    if size == 0 {
        return Ok(XattrReply::Len(names.len() as u32));
    }
    if names.len() > size {
        return Err(Error::Range);
    }
    Ok(XattrReply::Data(names))
}

pub(super) fn remove(map: &RwLock<Xattrs>, name: &str) -> Result<()> {
    let mut map = map.write();
    if map.remove(name).is_none() {
        return Err(Error::XattrMissing);
    }
    Ok(())
}
