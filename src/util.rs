//! Utility functions and shared constants
use std::path::Path;

use crate::error::{Error, Result};

/// Technically Linux requires sysfs to be at `/sys`, calling it a system
/// configuration error otherwise.
///
/// But some distros experiment with filesystem layout changes, including of
/// `/sys`, so do this to allow easily changing it.
pub const SYSFS_PATH: &str = "/sys";

/// Kernel Module location. Same reasons as [`SYSFS_PATH`].
pub const MODULE_PATH: &str = "/lib/modules";

/// Directories searched for `*.conf` configuration files, in priority order.
pub const CONFIG_PATHS: &[&str] = &[
    "/etc/modprobe.d",
    "/run/modprobe.d",
    "/usr/local/lib/modprobe.d",
    "/lib/modprobe.d",
];

/// Recognized module file suffixes, uncompressed first.
pub const KMOD_EXTENSIONS: &[&str] = &[".ko", ".ko.gz", ".ko.xz", ".ko.zst"];

/// Normalize a module name: `-` becomes `_`, anything from the first `.`
/// (the file extension) on is dropped.
///
/// Normalization is idempotent.
pub fn modname_normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '-' => out.push('_'),
            '.' => break,
            c => out.push(c),
        }
    }
    out
}

/// Normalize an alias pattern: `-` becomes `_` except inside `[...]`
/// character classes, which are preserved verbatim.
///
/// # Errors
///
/// - [`Error::InvalidInput`] on an unmatched `[` or a stray `]`
pub fn alias_normalize(alias: &str) -> Result<String> {
    let bytes = alias.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'-' => out.push(b'_'),
            b']' => return Err(Error::InvalidInput(format!("unmatched bracket in {alias}"))),
            b'[' => {
                while i < bytes.len() && bytes[i] != b']' {
                    out.push(bytes[i]);
                    i += 1;
                }
                if i == bytes.len() {
                    return Err(Error::InvalidInput(format!("unmatched bracket in {alias}")));
                }
                out.push(b']');
            }
            c => out.push(c),
        }
        i += 1;
    }
    // Replacing `-` can never break UTF-8: continuation bytes are >= 0x80.
    String::from_utf8(out).map_err(|_| Error::InvalidInput(format!("bad alias {alias}")))
}

/// Derive the normalized module name from a filesystem path.
///
/// Returns [`None`] for paths without a file name.
pub fn path_to_modname(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.is_empty() {
        return None;
    }
    Some(modname_normalize(name))
}

/// Whether `path` ends with a recognized module extension.
pub fn path_ends_with_kmod_ext(path: &str) -> bool {
    KMOD_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Microsecond mtime stamp of `path`, used for staleness checks.
///
/// Returns 0 when the file cannot be stat'ed; callers treat a zero stamp as
/// always stale.
pub fn path_mstamp(path: &Path) -> u64 {
    use std::time::UNIX_EPOCH;

    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::Result;

    use super::*;

    #[test]
    fn normalize_name() {
        assert_eq!(modname_normalize("mod-foo"), "mod_foo");
        assert_eq!(modname_normalize("snd-pcm.ko"), "snd_pcm");
        assert_eq!(modname_normalize("ext4.ko.xz"), "ext4");
        // idempotent
        assert_eq!(
            modname_normalize(&modname_normalize("dm-crypt")),
            modname_normalize("dm-crypt")
        );
    }

    #[test]
    fn normalize_alias() -> Result<()> {
        let n = alias_normalize("mod-foo_[a-z]")?;
        assert_eq!(n, "mod_foo_[a-z]");
        assert_eq!(n.len(), 13);

        // dashes inside ranges survive, everything else flips
        assert_eq!(alias_normalize("pci:v-d[0-9]*")?, "pci:v_d[0-9]*");

        // idempotent
        let once = alias_normalize("usb-storage-[0-7]")?;
        assert_eq!(alias_normalize(&once)?, once);
        Ok(())
    }

    #[test]
    fn normalize_alias_rejects_unmatched_brackets() {
        assert!(alias_normalize("mod[a-z").is_err());
        assert!(alias_normalize("mod]").is_err());
    }

    #[test]
    fn modname_from_path() {
        let p = PathBuf::from("/lib/modules/6.1.0/kernel/fs/ext4/ext4.ko");
        assert_eq!(path_to_modname(&p).unwrap(), "ext4");
        let p = PathBuf::from("kernel/drivers/block/virtio-blk.ko.zst");
        assert_eq!(path_to_modname(&p).unwrap(), "virtio_blk");
    }

    #[test]
    fn kmod_extensions() {
        assert!(path_ends_with_kmod_ext("a/b/c.ko"));
        assert!(path_ends_with_kmod_ext("c.ko.xz"));
        assert!(!path_ends_with_kmod_ext("c.txt"));
        assert!(!path_ends_with_kmod_ext("cko"));
    }
}
