//! Error handling stuff
use displaydoc::Display;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type shared by the module management core.
///
/// Individual modules define richer local errors where their failure modes
/// are self-contained (see [`crate::index::OpenError`] and
/// [`crate::elf::ElfError`]); those convert into this type at the operation
/// boundary.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum Error {
    /// IO Failed
    Io(#[from] io::Error),

    /// `{0}` not found
    NotFound(String),

    /// invalid input: {0}
    InvalidInput(String),

    /// module `{0}` is already loaded
    AlreadyLoaded(String),

    /// module `{0}` is in use
    InUse(String),

    /// module `{0}` is blacklisted
    Blacklisted(String),

    /// dependency cycle detected: {0}
    Cycle(String),

    /// couldn't load module `{0}`: {1}
    LoadError(String, String),

    /// couldn't unload module `{0}`: {1}
    UnloadError(String, String),
}
