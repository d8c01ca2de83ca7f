//! Linux kernel module management
//!
//! The three entangled jobs of module tooling, as a library: resolving the
//! transitive closure of modules a name or alias pulls in, extracting
//! metadata from module ELF objects, and compiling/querying the on-disk
//! alias indexes without reparsing them.
//!
//! # Implementation details
//!
//! Runtime state comes from `/sys/module` and `/proc`, so this library
//! requires them to exist. Index files are memory-mapped and navigated in
//! place; a [`context::Context`] ties the module directory, configuration,
//! indexes and the module pool together.
//!
//! Loading and unloading go through the `finit_module`/`init_module` and
//! `delete_module` syscalls and need `CAP_SYS_MODULE`.

pub mod config;
pub mod context;
pub mod depmod;
pub mod elf;
pub mod error;
pub mod extensions;
pub mod index;
pub mod lookup;
pub mod module;
pub mod module_file;
pub mod probe;
pub mod system;
mod util;

pub use crate::{
    context::{Context, IndexKind, Validation},
    error::{Error, Result},
    module::Module,
    probe::{ProbeFlags, ProbeRunner},
};
pub use crate::util::{alias_normalize, modname_normalize};
