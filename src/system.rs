//! Information about the running kernel
use nix::sys::utsname::uname;

use crate::error::Result;

/// Identity of the running kernel.
#[derive(Debug, Clone)]
pub struct KernelInfo {
    release: String,
}

impl KernelInfo {
    /// Kernel release string (`uname -r`), e.g. `6.1.0-17-amd64`.
    pub fn release(&self) -> &str {
        &self.release
    }
}

/// Query the running kernel via `uname(2)`.
///
/// # Errors
///
/// - [`crate::error::Error::Io`] if the syscall fails
pub fn kernel_info() -> Result<KernelInfo> {
    let uts = uname().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(KernelInfo {
        release: uts.release().to_string_lossy().into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_nonempty() {
        let info = kernel_info().unwrap();
        assert!(!info.release().is_empty());
    }
}
