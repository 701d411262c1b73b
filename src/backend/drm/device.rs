//! The open DRM device: owns the file descriptor, the property cache, the
//! resource inventory, and dispatches to whichever [`KmsBackend`] the
//! kernel actually supports.
//!
//! Grounded on `smithay`'s `backend::drm::device::{DrmDevice, FdWrapper}`:
//! master-lock acquisition on open and release on drop, `ClientCapability`
//! negotiation, and a ref-counted fd wrapper so surfaces/buffers can outlive
//! a particular `DrmDevice` value without holding a raw fd themselves.

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use drm::control::Device as ControlDevice;
use drm::Device as BasicDevice;
use tracing::{info, instrument, warn};

use crate::backend::drm::inventory::Inventory;
use crate::backend::drm::kms::{atomic::AtomicBackend, legacy::LegacyBackend, KmsBackend};
use crate::backend::drm::node::DrmNode;
use crate::backend::drm::property::PropertyCache;
use crate::error::Error;
use crate::utils::{DevPath, DeviceFd};

#[derive(Debug)]
struct DrmDeviceFdInner {
    fd: DeviceFd,
    privileged: bool,
}

impl Drop for DrmDeviceFdInner {
    fn drop(&mut self) {
        info!(dev = ?self.fd.dev_path(), "dropping drm device");
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                warn!(error = %err, "failed to release drm master lock");
            }
        }
    }
}

impl AsFd for DrmDeviceFdInner {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for DrmDeviceFdInner {}
impl ControlDevice for DrmDeviceFdInner {}

/// Ref-counted handle to an open DRM device fd. Acquires the DRM master
/// lock on first construction and releases it when the last clone drops.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<DrmDeviceFdInner>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}
impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl DrmDeviceFd {
    fn new(fd: DeviceFd) -> Self {
        let mut inner = DrmDeviceFdInner { fd, privileged: false };
        // Newer kernels grant mode-setting rights if no other master is
        // active, so a failure here just means "unprivileged", not fatal.
        match inner.acquire_master_lock() {
            Ok(()) => inner.privileged = true,
            Err(_) => warn!("unable to become drm master, assuming unprivileged mode"),
        }
        DrmDeviceFd(Arc::new(inner))
    }

    pub(crate) fn is_privileged(&self) -> bool {
        self.0.privileged
    }
}

/// An open DRM device and everything scanned from it at open time.
pub struct DrmDevice {
    fd: DrmDeviceFd,
    node: DrmNode,
    inventory: Inventory,
    properties: PropertyCache,
    kms: KmsBackend,
    active: Arc<std::sync::atomic::AtomicBool>,
}

impl fmt::Debug for DrmDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmDevice")
            .field("node", &self.node)
            .field("crtcs", &self.inventory.crtcs.len())
            .field("connectors", &self.inventory.connectors.len())
            .field("planes", &self.inventory.planes.len())
            .finish()
    }
}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Set via `SCANOUT_CORE_FORCE_LEGACY=1` to force the legacy backend even
/// when the kernel advertises atomic mode-setting; useful for exercising
/// the legacy path on hardware that supports both.
const FORCE_LEGACY_ENV: &str = "SCANOUT_CORE_FORCE_LEGACY";

impl DrmDevice {
    /// Open a device from an already-owned fd (typically handed over by a
    /// session authority such as `libseat`).
    #[instrument(skip(fd), fields(dev))]
    pub fn new(fd: OwnedFd) -> Result<Self, Error> {
        let fd = DrmDeviceFd::new(DeviceFd::from(fd));
        let node = DrmNode::from_file(&fd).map_err(|_| Error::InvalidState("fd is not a drm node"))?;
        tracing::Span::current().record("dev", tracing::field::display(&node));

        fd.set_client_capability(drm::ClientCapability::UniversalPlanes, true)
            .map_err(|source| Error::access("set_client_cap(UniversalPlanes)", &fd, source))?;

        let force_legacy = std::env::var(FORCE_LEGACY_ENV).is_ok_and(|v| v == "1");
        let use_atomic = !force_legacy && fd.set_client_capability(drm::ClientCapability::Atomic, true).is_ok();

        let inventory = Inventory::scan(&fd)?;
        let properties = build_property_cache(&fd, &inventory)?;

        let kms = if use_atomic {
            info!("using atomic kms backend");
            KmsBackend::Atomic(AtomicBackend::new(&fd, &inventory, &properties)?)
        } else {
            info!("using legacy kms backend");
            KmsBackend::Legacy(LegacyBackend::new(&fd, &inventory))
        };

        Ok(DrmDevice {
            fd,
            node,
            inventory,
            properties,
            kms,
            active: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        })
    }

    /// The device's fd, for allocators that need raw ioctl access.
    pub fn fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    /// The device node identity (used to key per-GPU state and compare ids on hotplug).
    pub fn node(&self) -> DrmNode {
        self.node
    }

    /// The resource inventory scanned at open time. Call [`Self::rescan`] after a hotplug event.
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// The cached property table.
    pub fn properties(&self) -> &PropertyCache {
        &self.properties
    }

    /// Which KMS backend this device ended up using.
    pub fn kms(&self) -> &KmsBackend {
        &self.kms
    }

    /// Whether the owning session is currently active (not VT-switched away).
    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::Acquire)
    }

    /// The session-activity flag backing [`Self::is_active`], shared so an
    /// [`Output`](crate::backend::drm::Output) can be bound to it via
    /// `Output::bind_active_flag` and drop commits silently while paused.
    pub fn active_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        self.active.clone()
    }

    /// Re-enumerate connectors/CRTCs/planes, e.g. after a udev hotplug event.
    #[instrument(skip(self))]
    pub fn rescan(&mut self) -> Result<(), Error> {
        self.inventory = Inventory::scan(&self.fd)?;
        self.properties = build_property_cache(&self.fd, &self.inventory)?;
        Ok(())
    }

    /// Mark this device paused following a session `PauseSession` event.
    /// Outputs bound to [`Self::active_flag`] (via `Output::bind_active_flag`)
    /// start rejecting commits with [`Error::SessionPaused`] immediately; the
    /// fd itself is left open until [`Self::resume`].
    #[instrument(skip(self))]
    pub fn pause(&mut self) {
        self.active.store(false, std::sync::atomic::Ordering::Release);
        info!("drm device paused");
    }

    /// Resume this device after a session `ActivateSession` event, handing
    /// over a freshly reopened fd for the same device node. `new_fd` is
    /// dup2'd onto the existing fd number, so `DrmDeviceFd` clones already
    /// held by outputs/buffers keep referring to a live descriptor, then
    /// `new_fd` itself is dropped. Re-arms the activity flag last so no
    /// commit can race the dup2.
    #[instrument(skip(self, new_fd))]
    pub fn resume(&mut self, new_fd: OwnedFd) -> Result<(), Error> {
        rustix::io::dup2(&new_fd, &self.fd)
            .map_err(|errno| Error::Io(std::io::Error::from_raw_os_error(errno.raw_os_error())))?;
        self.active.store(true, std::sync::atomic::Ordering::Release);
        info!("drm device resumed");
        Ok(())
    }
}

fn build_property_cache(fd: &DrmDeviceFd, inventory: &Inventory) -> Result<PropertyCache, Error> {
    use crate::backend::drm::property::ResourceHandle;

    let mut table = std::collections::HashMap::new();
    for c in &inventory.connectors {
        merge_props(fd, &mut table, c.handle)?;
    }
    for c in &inventory.crtcs {
        merge_props(fd, &mut table, c.handle)?;
    }
    for p in &inventory.planes {
        merge_props(fd, &mut table, p.handle)?;
    }
    Ok(PropertyCache::from_table(table))
}

fn merge_props<D: ControlDevice, R: crate::backend::drm::property::ResourceHandle>(
    fd: &D,
    table: &mut std::collections::HashMap<drm::control::RawResourceHandle, std::collections::HashMap<String, crate::backend::drm::property::CachedProperty>>,
    handle: R,
) -> Result<(), Error> {
    let cache = PropertyCache::build(fd, std::iter::once(handle))?;
    table.extend(cache.into_table());
    Ok(())
}
