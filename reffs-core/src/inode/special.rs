/// Sub-tag for the `Special` payload, distinguishing the flavors of
/// non-file, non-directory, non-symlink node the façade can mint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpecialTag {
    NoBlock,
    CharDev,
    BlockDev,
    Fifo,
    Sock,
}
