//! Memory-mapped file support with architecture-specific size limits.

use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;

/// Maximum map size for different architectures.
#[cfg(any(target_arch = "x86", target_arch = "arm"))]
pub const MAX_MAP_SIZE: usize = 0x7FFF_FFFF; // 2GB on 32-bit

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const MAX_MAP_SIZE: usize = usize::MAX; // No practical limit on 64-bit

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "arm",
    target_arch = "x86_64",
    target_arch = "aarch64"
)))]
pub const MAX_MAP_SIZE: usize = 0x7FFF_FFFF; // Default to 2GB for unknown architectures

/// A read-only, shared memory mapping of a partition file.
pub struct PlatformMmap {
    mmap: Mmap,
    #[allow(dead_code)]
    file: File,
}

impl PlatformMmap {
    /// Creates a read-only memory mapping of `length` bytes of `file`.
    pub fn new_readonly(file: File, length: usize) -> io::Result<Self> {
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            if length > MAX_MAP_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "map size {} exceeds maximum {} for this architecture",
                        length, MAX_MAP_SIZE
                    ),
                ));
            }
        }

        let mmap = unsafe { MmapOptions::new().len(length).map(&file)? };

        Ok(PlatformMmap { mmap, file })
    }

    /// Returns the mapped region as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the length of the mapped region.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Checks whether the mapped region is empty.
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Advises the kernel to expect random access. Partition reads jump
    /// between extents, so readahead rarely helps.
    #[cfg(unix)]
    pub fn advise_random(&self) -> io::Result<()> {
        use libc::{MADV_RANDOM, madvise};

        let ret = unsafe {
            madvise(
                self.mmap.as_ptr() as *mut libc::c_void,
                self.mmap.len(),
                MADV_RANDOM,
            )
        };

        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn advise_random(&self) -> io::Result<()> {
        Ok(())
    }
}
