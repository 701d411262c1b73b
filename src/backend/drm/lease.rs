//! DRM leasing (C10, device-side half): carving a sub-fd out of the primary
//! device for a set of connectors/CRTCs/planes via `drmModeCreateLease`.
//!
//! Grounded on `smithay`'s `wayland::drm_lease` module, stripped of its
//! `wp_drm_lease_v1` wire-protocol plumbing (out of scope here — this crate
//! exposes the DRM-object bookkeeping only; a host compositor's Wayland
//! layer decides which connectors to offer and wires client requests to
//! [`DrmLeaseBuilder`]).

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use drm::control::{connector, crtc, plane, Device as ControlDevice, RawResourceHandle};
use rustix::fs::OFlags;
use tracing::{info, instrument, warn};

use crate::backend::drm::device::DrmDeviceFd;
use crate::error::Error;

/// Accumulates the set of CRTCs/connectors/planes to hand to one lease
/// request before calling [`DrmLeaseBuilder::build`].
#[derive(Debug)]
pub struct DrmLeaseBuilder {
    fd: DrmDeviceFd,
    crtcs: HashSet<crtc::Handle>,
    connectors: HashSet<connector::Handle>,
    planes: HashSet<plane::Handle>,
}

impl DrmLeaseBuilder {
    /// Start a new, empty lease request against `fd`.
    pub fn new(fd: &DrmDeviceFd) -> Self {
        DrmLeaseBuilder {
            fd: fd.clone(),
            crtcs: HashSet::new(),
            connectors: HashSet::new(),
            planes: HashSet::new(),
        }
    }

    /// Add a CRTC to the resources being leased.
    pub fn add_crtc(&mut self, crtc: crtc::Handle) {
        self.crtcs.insert(crtc);
    }

    /// Add a connector to the resources being leased.
    pub fn add_connector(&mut self, conn: connector::Handle) {
        self.connectors.insert(conn);
    }

    /// Add a plane to the resources being leased.
    pub fn add_plane(&mut self, plane: plane::Handle) {
        self.planes.insert(plane);
    }

    /// Call `drmModeCreateLease` for the accumulated object set, producing a
    /// [`DrmLease`] whose fd the requesting client can be handed.
    #[instrument(skip(self), fields(crtcs = self.crtcs.len(), connectors = self.connectors.len(), planes = self.planes.len()))]
    pub fn build(self) -> Result<DrmLease, Error> {
        let objects: Vec<RawResourceHandle> = self
            .planes
            .iter()
            .copied()
            .map(Into::into)
            .chain(self.connectors.iter().copied().map(Into::into))
            .chain(self.crtcs.iter().copied().map(Into::into))
            .collect();

        let (id, fd) = self.fd.create_lease(&objects, OFlags::CLOEXEC.bits())?;

        info!(lease_id = id.get(), "drm lease created");
        Ok(DrmLease {
            fd: self.fd,
            crtcs: self.crtcs,
            connectors: self.connectors,
            planes: self.planes,
            lease_id: id,
            handed_out: Arc::new(std::sync::Mutex::new(Some(fd))),
            revoked: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// An active DRM lease. Revokes itself (`drmModeRevokeLease`) on drop unless
/// already revoked.
#[derive(Debug)]
pub struct DrmLease {
    fd: DrmDeviceFd,
    crtcs: HashSet<crtc::Handle>,
    connectors: HashSet<connector::Handle>,
    planes: HashSet<plane::Handle>,
    lease_id: NonZeroU32,
    handed_out: Arc<std::sync::Mutex<Option<OwnedFd>>>,
    revoked: Arc<AtomicBool>,
}

impl DrmLease {
    /// CRTCs granted by this lease.
    pub fn crtcs(&self) -> impl Iterator<Item = &crtc::Handle> {
        self.crtcs.iter()
    }

    /// Connectors granted by this lease.
    pub fn connectors(&self) -> impl Iterator<Item = &connector::Handle> {
        self.connectors.iter()
    }

    /// Planes granted by this lease.
    pub fn planes(&self) -> impl Iterator<Item = &plane::Handle> {
        self.planes.iter()
    }

    /// The kernel lessee id (`drmModeListLessees` identifies leases by this).
    pub fn id(&self) -> u32 {
        self.lease_id.get()
    }

    /// Take the lease fd, to hand to the leasing client. Calling this twice
    /// returns `None` the second time.
    pub fn take_fd(&self) -> Option<OwnedFd> {
        self.handed_out.lock().unwrap().take()
    }

    /// Whether this lease has already been revoked (by us or by the kernel).
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Revoke the lease, e.g. in response to a kernel-initiated revocation
    /// observed by the event pump (POLLHUP on the lease fd, or the leased
    /// connector disappearing from a re-inventory). A no-op if already
    /// revoked, including by a previous [`Drop`].
    #[instrument(skip(self), fields(lease_id = self.lease_id.get()))]
    pub fn revoke(&self) {
        if self.revoked.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("revoking drm lease");
        if let Err(err) = self.fd.revoke_lease(self.lease_id) {
            warn!(error = %err, "failed to revoke drm lease");
        }
    }
}

impl Drop for DrmLease {
    fn drop(&mut self) {
        self.revoke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_deduplicates_repeated_objects() {
        let crtc: crtc::Handle = unsafe { std::mem::transmute(1u32) };
        let mut builder_crtcs = HashSet::new();
        builder_crtcs.insert(crtc);
        builder_crtcs.insert(crtc);
        assert_eq!(builder_crtcs.len(), 1);
    }
}
