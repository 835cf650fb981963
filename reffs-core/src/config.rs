//! Mount-time configuration (§4.8). Parsed from the `-o key=value,…`
//! option string the CLI collects; kept in the core so the scenarios in
//! §8 can build a `Store` without going through `mount-reffs` at all.

use crate::error::{Error, Result};

pub const DEFAULT_SIZE_BYTES: u64 = 1 << 30; // 1 GiB
pub const DEFAULT_INODES: u64 = 1_000_000;
pub const DEFAULT_SUBTYPE: &str = "reffs";

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub size_bytes: u64,
    pub inodes: u64,
    pub subtype: String,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            size_bytes: DEFAULT_SIZE_BYTES,
            inodes: DEFAULT_INODES,
            subtype: DEFAULT_SUBTYPE.to_string(),
        }
    }
}

impl StoreConfig {
    /// Parses the comma-separated `-o key=value,...` option string.
    pub fn parse_options(opts: &str) -> Result<StoreConfig> {
        let mut config = StoreConfig::default();
        for kv in opts.split(',').filter(|s| !s.is_empty()) {
            let (key, value) = kv.split_once('=').ok_or(Error::InvalidArgument)?;
            match key {
                "size" => config.size_bytes = parse_size(value)?,
                "inodes" => config.inodes = value.parse().map_err(|_| Error::InvalidArgument)?,
                "subtype" => config.subtype = value.to_string(),
                _ => return Err(Error::InvalidArgument),
            }
        }
        Ok(config)
    }
}

fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('K') => (&value[..value.len() - 1], 1u64 << 10),
        Some('M') => (&value[..value.len() - 1], 1u64 << 20),
        Some('G') => (&value[..value.len() - 1], 1u64 << 30),
        Some('T') => (&value[..value.len() - 1], 1u64 << 40),
        Some('P') => (&value[..value.len() - 1], 1u64 << 50),
        Some('E') => (&value[..value.len() - 1], 1u64 << 60),
        _ => (value, 1),
    };
    let n: u64 = digits.parse().map_err(|_| Error::InvalidArgument)?;
    n.checked_mul(multiplier).ok_or(Error::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("10").unwrap(), 10);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * (1 << 20));
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("abc").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn parse_options_defaults() {
        let config = StoreConfig::parse_options("").unwrap();
        assert_eq!(config.size_bytes, DEFAULT_SIZE_BYTES);
        assert_eq!(config.inodes, DEFAULT_INODES);
        assert_eq!(config.subtype, DEFAULT_SUBTYPE);
    }

    #[test]
    fn parse_options_overrides() {
        let config = StoreConfig::parse_options("size=2M,inodes=100,subtype=foo").unwrap();
        assert_eq!(config.size_bytes, 2 * (1 << 20));
        assert_eq!(config.inodes, 100);
        assert_eq!(config.subtype, "foo");
    }

    #[test]
    fn parse_options_rejects_unknown_key() {
        assert!(StoreConfig::parse_options("bogus=1").is_err());
    }
}
