//! Shared-memory buffer allocation: `memfd`-backed buffers for
//! CPU-rendered/software outputs where no GPU allocator is available.
//!
//! Grounded on `smithay`'s `utils::sealed_file::SealedFile` (keymap sharing
//! via a sealed `memfd`), generalized into a pixel buffer and rebased on
//! `rustix` rather than `nix` to match this crate's syscall layer.

use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

use rustix::fs::{ftruncate, MemfdFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use super::{Allocator, Buffer, Format, Fourcc, Modifier};

/// Errors from the shm allocator.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// `memfd_create` failed.
    #[error("failed to create memfd: {0}")]
    MemfdCreate(#[source] rustix::io::Errno),
    /// Sizing the memfd failed.
    #[error("failed to size memfd: {0}")]
    Truncate(#[source] rustix::io::Errno),
    /// `mmap` failed.
    #[error("failed to map memfd: {0}")]
    Mmap(#[source] rustix::io::Errno),
    /// The requested format/modifier is not linear; shm buffers are always
    /// row-major linear memory.
    #[error("shm buffers only support the implicit/linear modifier")]
    UnsupportedModifier,
}

/// Allocates `memfd`-backed, CPU-mapped linear buffers. Carries no host
/// resources of its own (every buffer owns its own memfd), so it is safe to
/// have many instances or none at all — construction is just a marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShmAllocator;

impl Allocator for ShmAllocator {
    type Buffer = ShmBuffer;
    type Error = ShmError;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<ShmBuffer, Self::Error> {
        if !modifiers.is_empty()
            && !modifiers.contains(&Modifier::Linear)
            && !modifiers.contains(&Modifier::Invalid)
        {
            return Err(ShmError::UnsupportedModifier);
        }

        let bpp = super::format::get_bpp(fourcc).unwrap_or(32) as u32;
        let stride = width * (bpp / 8);
        let size = (stride as u64) * (height as u64);

        let fd: OwnedFd = rustix::fs::memfd_create("scanout-core-shm", MemfdFlags::CLOEXEC)
            .map_err(ShmError::MemfdCreate)?;
        ftruncate(&fd, size).map_err(ShmError::Truncate)?;

        // SAFETY: `fd` was just sized to `size` bytes above and is valid for
        // the duration of this mapping; the mapping outlives this call via `ShmBuffer`.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(ShmError::Mmap)?;

        Ok(ShmBuffer {
            fd,
            ptr: NonNull::new(ptr).expect("mmap returned a null pointer on success"),
            size: size as usize,
            width,
            height,
            stride,
            format: Format {
                code: fourcc,
                modifier: Modifier::Linear,
            },
        })
    }
}

/// A `memfd`-backed shared-memory buffer, CPU-mapped for the lifetime of the handle.
#[derive(Debug)]
pub struct ShmBuffer {
    fd: OwnedFd,
    ptr: NonNull<std::ffi::c_void>,
    size: usize,
    width: u32,
    height: u32,
    stride: u32,
    format: Format,
}

// The mapping is exclusively owned by this buffer; no other code holds `ptr`.
unsafe impl Send for ShmBuffer {}

impl Buffer for ShmBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> Format {
        self.format
    }
}

impl ShmBuffer {
    /// Row stride in bytes.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// The underlying memfd, for handing off to a client (e.g. as a `wl_shm` pool fd).
    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    /// Read-only view of the mapped pixels.
    pub fn data(&self) -> &[u8] {
        // SAFETY: `ptr` is valid and mapped for `size` bytes for the life of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.size) }
    }

    /// Mutable view of the mapped pixels. Callers must not write while the
    /// buffer is attached as a scan-out framebuffer.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive access is guaranteed by `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.size) }
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` describe exactly the mapping created in `create_buffer`.
        unsafe {
            let _ = munmap(self.ptr.as_ptr(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_correctly_sized_linear_buffer() {
        let mut alloc = ShmAllocator;
        let buf = alloc
            .create_buffer(4, 4, Fourcc::Argb8888, &[])
            .expect("shm allocation should succeed");
        assert_eq!(buf.width(), 4);
        assert_eq!(buf.height(), 4);
        assert_eq!(buf.stride(), 16);
        assert_eq!(buf.data().len(), 64);
        assert_eq!(buf.format().modifier, Modifier::Linear);
    }

    #[test]
    fn rejects_non_linear_modifier_request() {
        let mut alloc = ShmAllocator;
        let err = alloc
            .create_buffer(4, 4, Fourcc::Argb8888, &[Modifier::from(12345u64)])
            .unwrap_err();
        assert!(matches!(err, ShmError::UnsupportedModifier));
    }
}
