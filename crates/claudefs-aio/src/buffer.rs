//! Page-aligned heap buffers for direct I/O.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{AioError, AioResult};

/// Default alignment, one page.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Zero-initialized heap buffer with a fixed alignment.
///
/// The allocation never moves, so its address stays valid for the kernel
/// while the buffer itself is moved between engine stages.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

// The buffer owns its allocation exclusively.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `len` zeroed bytes aligned to [`DEFAULT_ALIGNMENT`].
    pub fn new(len: usize) -> AioResult<Self> {
        Self::with_alignment(len, DEFAULT_ALIGNMENT)
    }

    /// Allocates `len` zeroed bytes aligned to `align`.
    ///
    /// `align` must be a power of two and a multiple of the pointer size.
    pub fn with_alignment(len: usize, align: usize) -> AioResult<Self> {
        if len == 0 {
            return Err(AioError::InvalidArgument(
                "buffer length must be non-zero".to_string(),
            ));
        }
        if !align.is_power_of_two() || align < std::mem::size_of::<usize>() {
            return Err(AioError::InvalidArgument(format!(
                "invalid buffer alignment {}",
                align
            )));
        }

        let mut raw: *mut libc::c_void = std::ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut raw, align, len) };
        if ret != 0 {
            return Err(AioError::from_errno("posix_memalign", ret));
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or(AioError::ResourceExhausted {
            resource: "aligned buffer memory",
        })?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, len) };

        Ok(Self { ptr, len, align })
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> AioResult<Self> {
        let mut buf = Self::new(data.len())?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    /// Raw pointer handed to the kernel.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Buffer alignment in bytes.
    pub fn alignment(&self) -> usize {
        self.align
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("align", &self.align)
            .finish()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_aligned_and_zeroed() {
        let mut buf = AlignedBuffer::new(8192).unwrap();
        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.as_mut_ptr() as usize % DEFAULT_ALIGNMENT, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_custom_alignment() {
        let mut buf = AlignedBuffer::with_alignment(512, 512).unwrap();
        assert_eq!(buf.alignment(), 512);
        assert_eq!(buf.as_mut_ptr() as usize % 512, 0);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(matches!(
            AlignedBuffer::new(0),
            Err(AioError::InvalidArgument(_))
        ));
        assert!(matches!(
            AlignedBuffer::with_alignment(4096, 3000),
            Err(AioError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_slice_and_mutation() {
        let mut buf = AlignedBuffer::from_slice(&[1, 2, 3, 4]).unwrap();
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
        buf[0] = 9;
        assert_eq!(buf[0], 9);
    }

    #[test]
    fn test_address_stable_across_moves() {
        let mut buf = AlignedBuffer::new(4096).unwrap();
        let before = buf.as_mut_ptr();
        let mut moved = Box::new(buf);
        assert_eq!(moved.as_mut_ptr(), before);
    }
}
