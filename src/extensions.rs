//! Linux-specific extensions to std types
use std::{fs::File, path::Path};

use rustix::{
    fd::IntoFd,
    fs::{memfd_create, MemfdFlags},
};

/// Internal implementation details
mod imp {
    use std::fs::File;

    pub trait FileExtSeal {}

    impl FileExtSeal for File {}
}

/// Impl for [`FileExt::create_memory`]
fn create_memory_impl(path: &Path, flags: MemfdFlags) -> File {
    memfd_create(path, flags).unwrap().into_fd().into()
}

/// Extends [`File`] with linux-specific methods
///
/// This trait is sealed
pub trait FileExt: imp::FileExtSeal {
    /// Like [`File::create`], except the file exists only in memory.
    /// The file is opened for both reading and writing.
    ///
    /// # Implementation
    ///
    /// This uses `memfd_create(2)`.
    /// The `MFD_CLOEXEC` and `MFD_ALLOW_SEALING` flags are set.
    ///
    /// As the file exists only in memory, `path` doesn't matter
    /// and is only used as a debugging marker in `/proc/self/fd/`.
    /// The same name/path may exist multiple times.
    ///
    /// # Panics
    ///
    /// - If `path` is more than 249 bytes. This is a Linux Kernel limit.
    /// - If `path` has any internal null bytes.
    /// - The per process/system file limit is reached.
    /// - Insufficient memory.
    fn create_memory<P: AsRef<Path>>(path: P) -> File {
        create_memory_impl(
            path.as_ref(),
            MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING,
        )
    }
}

impl FileExt for File {}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use anyhow::Result;

    use super::*;

    #[test]
    fn memory_file_reads_back() -> Result<()> {
        let mut f = File::create_memory("test-image");
        f.write_all(b"payload")?;
        f.seek(SeekFrom::Start(0))?;
        let mut buf = String::new();
        f.read_to_string(&mut buf)?;
        assert_eq!(buf, "payload");
        Ok(())
    }
}
