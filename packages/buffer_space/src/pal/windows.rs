use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::pal::{FALLBACK_PAGE_SIZE, Platform};

/// Singleton instance of `BuildTargetPlatform`, used by public API types
/// to hook up to the correct PAL implementation.
pub(crate) static BUILD_TARGET_PLATFORM: BuildTargetPlatform = BuildTargetPlatform;

#[derive(Debug)]
pub(crate) struct BuildTargetPlatform;

impl Platform for BuildTargetPlatform {
    fn page_size(&self) -> usize {
        let mut info = SYSTEM_INFO::default();

        // SAFETY: The pointer refers to a live, writable SYSTEM_INFO on our stack.
        unsafe {
            GetSystemInfo(&raw mut info);
        }

        usize::try_from(info.dwPageSize)
            .ok()
            .filter(|size| *size > 0)
            .unwrap_or(FALLBACK_PAGE_SIZE)
    }
}
