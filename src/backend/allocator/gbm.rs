//! Buffers created through [libgbm](gbm): the primary allocator for
//! scan-out and client buffers on real hardware.
//!
//! The re-exported [`GbmDevice`](gbm::Device) implements [`Allocator`] and
//! [`GbmBuffer`](gbm::BufferObject) satisfies [`Buffer`] while also allowing
//! conversion to and from [`Dmabuf`]s.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use tracing::instrument;

pub use gbm::{BufferObject as GbmBuffer, BufferObjectFlags as GbmBufferFlags, Device as GbmDevice};

use super::{dmabuf::Dmabuf, AsDmabuf, Allocator, Buffer, Format, Fourcc, Modifier};

/// Wraps a [`GbmDevice`] to implement [`Allocator`].
#[derive(Clone, Debug)]
pub struct GbmAllocator<A: AsFd + 'static> {
    device: GbmDevice<A>,
    default_flags: GbmBufferFlags,
}

impl<A: AsFd + 'static> AsRef<GbmDevice<A>> for GbmAllocator<A> {
    fn as_ref(&self) -> &GbmDevice<A> {
        &self.device
    }
}

impl<A: AsFd + 'static> AsFd for GbmAllocator<A> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

impl<A: AsFd + 'static> GbmAllocator<A> {
    /// Wrap `device`, using `default_flags` for every [`Allocator::create_buffer`] call.
    pub fn new(device: GbmDevice<A>, default_flags: GbmBufferFlags) -> GbmAllocator<A> {
        GbmAllocator { device, default_flags }
    }

    /// Like [`Allocator::create_buffer`] but with an explicit flag override
    /// for one-off allocations (e.g. a cursor plane buffer, which needs
    /// `GbmBufferFlags::CURSOR` rather than the swapchain's scan-out flags).
    #[instrument(level = "trace", skip(self), err)]
    pub fn create_buffer_with_flags(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
        flags: GbmBufferFlags,
    ) -> Result<GbmBuffer<()>, std::io::Error> {
        let result = if modifiers.is_empty() {
            self.device.create_buffer_object(width, height, fourcc, flags)
        } else {
            self.device
                .create_buffer_object_with_modifiers(width, height, fourcc, modifiers.iter().copied())
        };

        match result {
            Ok(bo) => Ok(bo),
            Err(err) => {
                if modifiers.contains(&Modifier::Invalid) || modifiers.contains(&Modifier::Linear) {
                    self.device.create_buffer_object(width, height, fourcc, flags)
                } else {
                    Err(err)
                }
            }
        }
    }
}

impl<A: AsFd + 'static> Allocator for GbmAllocator<A> {
    type Buffer = GbmBuffer<()>;
    type Error = std::io::Error;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<GbmBuffer<()>, Self::Error> {
        self.create_buffer_with_flags(width, height, fourcc, modifiers, self.default_flags)
    }
}

impl<T> Buffer for GbmBuffer<T> {
    fn width(&self) -> u32 {
        self.width().unwrap_or(0)
    }

    fn height(&self) -> u32 {
        self.height().unwrap_or(0)
    }

    fn format(&self) -> Format {
        Format {
            code: gbm::BufferObject::format(self).unwrap_or(Fourcc::Argb8888),
            modifier: self.modifier().unwrap_or(Modifier::Invalid),
        }
    }
}

/// Errors converting a GBM buffer object to a dmabuf.
#[derive(thiserror::Error, Debug)]
pub enum GbmConvertError {
    /// The underlying GBM device was destroyed before export.
    #[error("the gbm device was destroyed")]
    DeviceDestroyed(#[from] gbm::DeviceDestroyedError),
    /// Exporting produced more planes than this crate's dmabuf representation supports.
    #[error("buffer has too many planes to export as a dmabuf")]
    TooManyPlanes,
    /// The kernel returned an invalid fd for the requested plane.
    #[error("buffer returned an invalid file descriptor")]
    InvalidFd(#[from] gbm::InvalidFdError),
}

impl From<gbm::FdError> for GbmConvertError {
    fn from(err: gbm::FdError) -> Self {
        match err {
            gbm::FdError::DeviceDestroyed(err) => err.into(),
            gbm::FdError::InvalidFd(err) => err.into(),
        }
    }
}

impl<T> AsDmabuf for GbmBuffer<T> {
    type Error = GbmConvertError;

    fn export(&self) -> Result<Dmabuf, GbmConvertError> {
        let planes = self.plane_count()? as i32;
        let mut offsets = Vec::with_capacity(planes as usize);
        let mut strides = Vec::with_capacity(planes as usize);
        let mut fds: Vec<OwnedFd> = Vec::with_capacity(planes as usize);

        for idx in 0..planes {
            fds.push(self.fd_for_plane(idx)?);
            offsets.push(self.offset(idx)?);
            strides.push(self.stride_for_plane(idx)? as u32);
        }

        Dmabuf::new(self, planes as usize, &offsets, &strides, fds).ok_or(GbmConvertError::TooManyPlanes)
    }
}

impl Dmabuf {
    /// Import this dmabuf into `gbm`, creating a GBM buffer object backed by
    /// the same underlying memory.
    pub fn import_to<A: AsFd + 'static, T>(
        &self,
        gbm: &GbmDevice<A>,
        usage: GbmBufferFlags,
    ) -> std::io::Result<GbmBuffer<T>> {
        const MAX_PLANES: usize = 4;
        let mut handles = [None; MAX_PLANES];
        for (i, fd) in self.handles().take(MAX_PLANES).enumerate() {
            handles[i] = Some(fd.try_clone_to_owned()?);
        }
        let mut strides = [0i32; MAX_PLANES];
        for (i, s) in self.strides().iter().take(MAX_PLANES).enumerate() {
            strides[i] = *s as i32;
        }
        let mut offsets = [0i32; MAX_PLANES];
        for (i, o) in self.offsets().iter().take(MAX_PLANES).enumerate() {
            offsets[i] = *o as i32;
        }

        if self.has_modifier() || self.num_planes() > 1 || self.offsets()[0] != 0 {
            gbm.import_buffer_object_from_dma_buf_with_modifiers(
                self.num_planes() as u32,
                handles,
                self.width(),
                self.height(),
                self.format().code,
                usage,
                strides,
                offsets,
                self.format().modifier,
            )
        } else {
            gbm.import_buffer_object_from_dma_buf(
                handles[0].take().unwrap(),
                self.width(),
                self.height(),
                strides[0] as u32,
                self.format().code,
                if self.format().modifier == Modifier::Linear {
                    usage | GbmBufferFlags::LINEAR
                } else {
                    usage
                },
            )
        }
    }
}
