use crate::pal::{FALLBACK_PAGE_SIZE, Platform};

/// Singleton instance of `BuildTargetPlatform`, used by public API types
/// to hook up to the correct PAL implementation.
pub(crate) static BUILD_TARGET_PLATFORM: BuildTargetPlatform = BuildTargetPlatform;

#[derive(Debug)]
pub(crate) struct BuildTargetPlatform;

impl Platform for BuildTargetPlatform {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf has no preconditions; it returns -1 for unsupported names.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        usize::try_from(raw)
            .ok()
            .filter(|size| *size > 0)
            .unwrap_or(FALLBACK_PAGE_SIZE)
    }
}
