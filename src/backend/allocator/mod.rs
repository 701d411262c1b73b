//! Buffer allocation: the immutable [`Buffer`] handle, the DRM format
//! catalogue, and the concrete allocators ([`gbm`], [`dumb`], [`shm`]) that
//! produce buffers from it.

pub mod dmabuf;
pub mod dumb;
pub mod format;
pub mod gbm;
pub mod shm;
pub mod swapchain;

pub use format::FormatSet;
pub use swapchain::{Slot, Swapchain};

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

/// An immutable-dimensions, immutable-format buffer handle.
///
/// Once created, a buffer's width/height/format never change; only its
/// contents may change, and only while no holder is currently scanning it
/// out (see the swapchain's acquired/released protocol).
pub trait Buffer {
    /// Width in pixels.
    fn width(&self) -> u32;
    /// Height in pixels.
    fn height(&self) -> u32;
    /// Width and height as a pair.
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Pixel format, including the modifier this buffer was allocated with.
    fn format(&self) -> Format;
}

/// Something that can produce new [`Buffer`]s of a requested size, format
/// and modifier set.
pub trait Allocator {
    /// The concrete buffer type produced.
    type Buffer: Buffer;
    /// Error type returned on allocation failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Allocate a new buffer. `modifiers` lists acceptable modifiers in
    /// preference order; an empty slice means "implicit/linear only".
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error>;
}

/// Buffers that can be exported as a [`dmabuf::Dmabuf`] for hand-off to
/// another process or subsystem (e.g. framebuffer registration, clients).
pub trait AsDmabuf {
    /// Error type returned if exporting fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Export this buffer as a dmabuf.
    fn export(&self) -> Result<dmabuf::Dmabuf, Self::Error>;
}