//! The two interchangeable KMS commit backends behind one contract.
//!
//! Grounded on `smithay`'s `device::DrmDeviceInternal::{Atomic, Legacy}`:
//! a closed sum type dispatched once at construction time, per this crate's
//! Design Notes resolution to prefer a sum type over either a trait object
//! or a function-table-of-callbacks.

pub mod atomic;
pub mod legacy;

use drm::control::{connector, crtc, framebuffer, plane, Mode};

use crate::error::Error;

/// One property change to submit as part of a commit.
#[derive(Debug, Clone, Copy)]
pub struct PlaneState {
    /// Plane being configured.
    pub plane: plane::Handle,
    /// Framebuffer to scan out, or `None` to disable the plane.
    pub framebuffer: Option<framebuffer::Handle>,
    /// Destination rectangle on the CRTC, `(x, y, w, h)`, in pixels.
    pub dst: (i32, i32, u32, u32),
    /// Source rectangle within the buffer, `(x, y, w, h)`, in whole pixels.
    ///
    /// The atomic backend is the only one that needs SRC_X/Y/W/H in the
    /// kernel's 16.16 fixed-point form; it does that `<< 16` itself from
    /// these plain values, so callers never shift this field and backends
    /// never see an already-shifted one.
    pub src: (u32, u32, u32, u32),
}

/// Whether a commit should be validated only (`TEST_ONLY`) or actually
/// applied, and whether a modeset is allowed as part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitFlags {
    /// Dry-run only; no hardware state changes.
    pub test_only: bool,
    /// Allow a full modeset as part of this commit (required the first time
    /// a CRTC is enabled, or whenever the mode/connector set changes).
    pub allow_modeset: bool,
}

/// A full description of one CRTC's desired state, ready to submit.
#[derive(Debug, Clone)]
pub struct CrtcCommit {
    /// CRTC targeted.
    pub crtc: crtc::Handle,
    /// Whether the CRTC should be active after this commit.
    pub active: bool,
    /// Mode to apply, if `active` and a modeset is happening.
    pub mode: Option<Mode>,
    /// Connectors to attach to this CRTC, if a modeset is happening.
    pub connectors: Vec<connector::Handle>,
    /// Plane states to apply alongside the CRTC.
    pub planes: Vec<PlaneState>,
}

/// The commit contract both backends implement identically from the
/// caller's point of view.
pub trait Backend {
    /// Enable (or disable, if `mode` is `None`) a connector on a CRTC.
    fn conn_enable(&mut self, connector: connector::Handle, crtc: crtc::Handle, mode: Option<Mode>) -> Result<(), Error>;

    /// Submit a full CRTC commit, honoring `flags`.
    fn crtc_commit(&mut self, commit: &CrtcCommit, flags: CommitFlags) -> Result<(), Error>;

    /// Update the cursor plane's image. A `None` framebuffer hides the cursor.
    fn crtc_set_cursor(&mut self, crtc: crtc::Handle, framebuffer: Option<framebuffer::Handle>) -> Result<(), Error>;

    /// Move the cursor plane without changing its image.
    fn crtc_move_cursor(&mut self, crtc: crtc::Handle, position: (i32, i32)) -> Result<(), Error>;

    /// Gamma ramp size for a CRTC, if the backend supports gamma control.
    fn crtc_get_gamma_size(&self, _crtc: crtc::Handle) -> Option<u32> {
        None
    }

    /// Set a gamma ramp for a CRTC, if the backend supports gamma control.
    fn crtc_set_gamma(&mut self, _crtc: crtc::Handle, _ramp: &[(u16, u16, u16)]) -> Result<(), Error> {
        Err(Error::InvalidState("gamma control is not supported by this backend"))
    }
}

/// Which kind of KMS API this device ended up negotiating.
#[derive(Debug)]
pub enum KmsBackend {
    /// `DRM_CLIENT_CAP_ATOMIC` was available; every commit is one atomic ioctl.
    Atomic(atomic::AtomicBackend),
    /// Fallback using the legacy per-object mode-setting ioctls.
    Legacy(legacy::LegacyBackend),
}

impl KmsBackend {
    fn inner(&mut self) -> &mut dyn Backend {
        match self {
            KmsBackend::Atomic(b) => b,
            KmsBackend::Legacy(b) => b,
        }
    }
}

impl Backend for KmsBackend {
    fn conn_enable(&mut self, connector: connector::Handle, crtc: crtc::Handle, mode: Option<Mode>) -> Result<(), Error> {
        self.inner().conn_enable(connector, crtc, mode)
    }

    fn crtc_commit(&mut self, commit: &CrtcCommit, flags: CommitFlags) -> Result<(), Error> {
        self.inner().crtc_commit(commit, flags)
    }

    fn crtc_set_cursor(&mut self, crtc: crtc::Handle, framebuffer: Option<framebuffer::Handle>) -> Result<(), Error> {
        self.inner().crtc_set_cursor(crtc, framebuffer)
    }

    fn crtc_move_cursor(&mut self, crtc: crtc::Handle, position: (i32, i32)) -> Result<(), Error> {
        self.inner().crtc_move_cursor(crtc, position)
    }

    fn crtc_get_gamma_size(&self, crtc: crtc::Handle) -> Option<u32> {
        match self {
            KmsBackend::Atomic(b) => b.crtc_get_gamma_size(crtc),
            KmsBackend::Legacy(b) => b.crtc_get_gamma_size(crtc),
        }
    }

    fn crtc_set_gamma(&mut self, crtc: crtc::Handle, ramp: &[(u16, u16, u16)]) -> Result<(), Error> {
        self.inner().crtc_set_gamma(crtc, ramp)
    }
}
