//! "Dumb buffer" allocation: the fallback allocator available on every KMS
//! driver, at the cost of being always linear and CPU-mapped (no GPU
//! rendering access). Used for headless/software-only outputs and as a
//! last resort when GBM is unavailable.

use std::fmt;

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{dumbbuffer::DumbBuffer as Handle, Device as ControlDevice};

use super::{Allocator, Buffer, Format, Fourcc, Modifier};
use crate::backend::drm::device::{DrmDevice, DrmDeviceFd};

/// A dumb buffer: kernel-allocated, linear-only, CPU-mappable memory bound
/// to one DRM device.
pub struct DumbBuffer {
    fd: DrmDeviceFd,
    handle: Handle,
    format: Format,
}

impl fmt::Debug for DumbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbBuffer")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .finish()
    }
}

impl Allocator for DrmDevice {
    type Buffer = DumbBuffer;
    type Error = drm::SystemError;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<DumbBuffer, Self::Error> {
        // Dumb buffers are always linear; reject a request that explicitly
        // excludes Linear/Invalid rather than silently ignoring it.
        if !modifiers.is_empty() && modifiers.iter().all(|&x| x != Modifier::Invalid && x != Modifier::Linear) {
            return Err(drm::SystemError::InvalidArgument);
        }

        let handle = self.fd().create_dumb_buffer((width, height), fourcc, 32)?;

        Ok(DumbBuffer {
            fd: self.fd().clone(),
            handle,
            format: Format {
                code: fourcc,
                modifier: Modifier::Linear,
            },
        })
    }
}

impl Buffer for DumbBuffer {
    fn width(&self) -> u32 {
        self.handle.size().0
    }

    fn height(&self) -> u32 {
        self.handle.size().1
    }

    fn format(&self) -> Format {
        self.format
    }
}

impl DrmBuffer for DumbBuffer {
    fn size(&self) -> (u32, u32) {
        self.handle.size()
    }

    fn format(&self) -> drm_fourcc::DrmFourcc {
        self.format.code
    }

    fn pitch(&self) -> u32 {
        self.handle.pitch()
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handle.handle()
    }
}

impl DumbBuffer {
    /// Raw handle to the underlying buffer.
    ///
    /// Becomes invalid once this wrapper is dropped or the owning device is closed.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.fd.destroy_dumb_buffer(self.handle.handle()) {
            tracing::warn!(error = %err, "failed to destroy dumb buffer");
        }
    }
}
