//! The legacy (pre-atomic) KMS backend: `SetCrtc`/`PageFlip`/`Cursor`
//! ioctls instead of one atomic property blob.
//!
//! Grounded on `smithay`'s `device/legacy.rs`: a modeset always goes through
//! `set_crtc`, a content-only update goes through `page_flip`, and the
//! hardware cursor is a dedicated small buffer rather than a plane. Legacy
//! KMS has no concept of overlay planes, so a [`super::CrtcCommit`] with more
//! than one plane only ever applies the first (the primary) and logs the rest
//! as dropped.

use std::collections::HashMap;

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{crtc, framebuffer, plane, Device as ControlDevice, Mode, PageFlipFlags};
use drm_fourcc::DrmFourcc;
use tracing::warn;

use super::{Backend, CommitFlags, CrtcCommit};
use crate::backend::drm::device::DrmDeviceFd;
use crate::backend::drm::inventory::Inventory;
use crate::error::Error;

/// A cursor image is just a GEM handle plus its size; legacy KMS addresses it
/// directly rather than through a framebuffer id.
struct CursorImage {
    handle: drm::buffer::Handle,
    width: u32,
    height: u32,
}

impl DrmBuffer for CursorImage {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Argb8888
    }

    fn pitch(&self) -> u32 {
        self.width * 4
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handle
    }
}

/// Legacy mode-setting backend.
pub struct LegacyBackend {
    fd: DrmDeviceFd,
    primary_planes: HashMap<crtc::Handle, plane::Handle>,
}

impl LegacyBackend {
    /// Build a legacy backend, recording each CRTC's primary plane so
    /// [`Backend::crtc_commit`] knows which plane's framebuffer to apply.
    pub fn new(fd: &DrmDeviceFd, inventory: &Inventory) -> Self {
        let mut primary_planes = HashMap::new();
        for crtc in &inventory.crtcs {
            if let Some(plane) = inventory.primary_plane_for_crtc(crtc.handle) {
                primary_planes.insert(crtc.handle, plane.handle);
            }
        }
        LegacyBackend { fd: fd.clone(), primary_planes }
    }

    fn framebuffer_size(&self, fb: framebuffer::Handle) -> Result<(u32, u32), Error> {
        let info = self.fd.get_framebuffer(fb).map_err(|source| Error::access("get_framebuffer", &self.fd, source))?;
        Ok(info.size())
    }

    fn buffer_handle(&self, fb: framebuffer::Handle) -> Result<drm::buffer::Handle, Error> {
        let info = self.fd.get_framebuffer(fb).map_err(|source| Error::access("get_framebuffer", &self.fd, source))?;
        info.buffer()
            .ok_or(Error::InvalidState("legacy cursor requires a framebuffer backed by a gem buffer handle"))
    }
}

impl Backend for LegacyBackend {
    fn conn_enable(&mut self, connector: drm::control::connector::Handle, crtc: crtc::Handle, mode: Option<Mode>) -> Result<(), Error> {
        self.fd
            .set_crtc(crtc, None, (0, 0), &[connector], mode)
            .map_err(|source| Error::KmsLegacyFailure { errmsg: "set_crtc", crtc, source })
    }

    fn crtc_commit(&mut self, commit: &CrtcCommit, flags: CommitFlags) -> Result<(), Error> {
        if flags.test_only {
            // Legacy KMS has no dry-run ioctl; treat TEST_ONLY as always passing
            // and let the real commit below surface any actual failure.
            return Ok(());
        }

        if commit.planes.len() > 1 {
            warn!(crtc = ?commit.crtc, dropped = commit.planes.len() - 1, "legacy kms can only drive the primary plane");
        }
        let Some(primary) = commit.planes.first() else {
            return Err(Error::InvalidState("crtc commit has no planes"));
        };

        if flags.allow_modeset || commit.mode.is_some() {
            self.fd
                .set_crtc(commit.crtc, primary.framebuffer, (0, 0), &commit.connectors, commit.mode)
                .map_err(|source| Error::KmsLegacyFailure { errmsg: "set_crtc", crtc: commit.crtc, source })
        } else {
            self.fd
                .page_flip(
                    commit.crtc,
                    primary.framebuffer.ok_or(Error::InvalidState("commit has no framebuffer to flip to"))?,
                    PageFlipFlags::PageFlipEvent,
                    None,
                )
                .map_err(|source| Error::KmsLegacyFailure { errmsg: "page_flip", crtc: commit.crtc, source })
        }
    }

    fn crtc_set_cursor(&mut self, crtc: crtc::Handle, framebuffer: Option<framebuffer::Handle>) -> Result<(), Error> {
        let image = match framebuffer {
            Some(fb) => {
                let handle = self.buffer_handle(fb)?;
                let (width, height) = self.framebuffer_size(fb)?;
                Some(CursorImage { handle, width, height })
            }
            // A cleared cursor is a zero-sized image, not a missing one:
            // `DRM_IOCTL_MODE_CURSOR` with width=0/height=0 hides it without
            // needing a sentinel handle.
            None => None,
        };
        self.fd
            .set_cursor(crtc, image.as_ref())
            .map_err(|source| Error::KmsLegacyFailure { errmsg: "set_cursor", crtc, source })
    }

    fn crtc_move_cursor(&mut self, crtc: crtc::Handle, position: (i32, i32)) -> Result<(), Error> {
        self.fd
            .move_cursor(crtc, position)
            .map_err(|source| Error::KmsLegacyFailure { errmsg: "move_cursor", crtc, source })
    }
}
