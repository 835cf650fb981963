/// Tag distinguishing the four inode payload variants, shared between the
/// core store, the pickle codec and anything else that needs to talk about
/// an inode's shape without depending on `reffs-core` directly.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeKind {
    File = 1,
    Directory = 2,
    Symlink = 3,
    CharDev = 4,
    BlockDev = 5,
    Fifo = 6,
    Socket = 7,
}

impl NodeKind {
    pub fn from_tag(tag: u32) -> Option<NodeKind> {
        Some(match tag {
            1 => NodeKind::File,
            2 => NodeKind::Directory,
            3 => NodeKind::Symlink,
            4 => NodeKind::CharDev,
            5 => NodeKind::BlockDev,
            6 => NodeKind::Fifo,
            7 => NodeKind::Socket,
            _ => return None,
        })
    }

    pub fn is_special(self) -> bool {
        matches!(
            self,
            NodeKind::CharDev | NodeKind::BlockDev | NodeKind::Fifo | NodeKind::Socket
        )
    }
}
