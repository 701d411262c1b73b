//! Resource inventory: enumerates the CRTCs, connectors and planes a DRM
//! device exposes and classifies them for the matcher.
//!
//! Grounded on `smithay`'s `DrmDevice::new`/`resources()` (`device/mod.rs`),
//! which calls `resource_handles()` once and keeps the `ResourceHandles`
//! around rather than re-querying per surface.

use std::collections::HashMap;

use drm::control::{connector, crtc, plane, Device as ControlDevice, PlaneType};

use crate::error::Error;

/// A connector and the state that matters for matching/lifecycle decisions.
#[derive(Debug, Clone)]
pub struct Connector {
    /// Kernel handle.
    pub handle: connector::Handle,
    /// Current connection state as last queried.
    pub state: connector::State,
    /// CRTCs this connector's encoders can drive, as a bitmask in CRTC list order.
    pub possible_crtcs: Vec<crtc::Handle>,
}

/// A CRTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crtc {
    /// Kernel handle.
    pub handle: crtc::Handle,
    /// Index of this CRTC within the device's CRTC list; this is the bit
    /// position used in every `possible_crtcs`/`possible_planes` mask.
    pub index: usize,
}

/// Plane classification, mirroring `drm::control::PlaneType` but without the
/// `Unrecognized` ambiguity at the call sites that only care about the three
/// kernel-defined kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    /// Exactly one per CRTC; carries the main framebuffer.
    Primary,
    /// Zero or more per CRTC; composited on top of the primary plane.
    Overlay,
    /// At most one per CRTC; hardware cursor plane.
    Cursor,
}

/// A plane and the CRTCs it can be bound to.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Kernel handle.
    pub handle: plane::Handle,
    /// Primary/overlay/cursor classification.
    pub kind: PlaneKind,
    /// CRTCs this plane can be attached to.
    pub possible_crtcs: Vec<crtc::Handle>,
}

/// A point-in-time enumeration of a device's display resources.
#[derive(Debug, Default)]
pub struct Inventory {
    /// All CRTCs, in kernel-reported order (index == bit position in masks).
    pub crtcs: Vec<Crtc>,
    /// All connectors.
    pub connectors: Vec<Connector>,
    /// All planes.
    pub planes: Vec<Plane>,
}

impl Inventory {
    /// Enumerate every resource on `dev`.
    ///
    /// Requires `DRM_CLIENT_CAP_UNIVERSAL_PLANES` to already be set on `dev`
    /// so that cursor/overlay planes are reported alongside primary planes
    /// (matching `smithay::backend::drm::device::DrmDevice::new`).
    pub fn scan<D: ControlDevice>(dev: &D) -> Result<Self, Error> {
        let res = dev
            .resource_handles()
            .map_err(|source| Error::access("drmModeGetResources", dev, source))?;

        let crtcs: Vec<Crtc> = res
            .crtcs()
            .iter()
            .enumerate()
            .map(|(index, &handle)| Crtc { handle, index })
            .collect();
        let crtc_index: HashMap<crtc::Handle, usize> =
            crtcs.iter().map(|c| (c.handle, c.index)).collect();

        let mut connectors = Vec::with_capacity(res.connectors().len());
        for &handle in res.connectors() {
            let info = dev
                .get_connector(handle, false)
                .map_err(|source| Error::access("drmModeGetConnector", dev, source))?;
            let possible_crtcs = possible_crtcs_for_connector(dev, &info, &crtcs)?;
            connectors.push(Connector {
                handle,
                state: info.state(),
                possible_crtcs,
            });
        }

        let plane_res = dev
            .plane_handles()
            .map_err(|source| Error::access("drmModeGetPlaneResources", dev, source))?;
        let mut planes = Vec::with_capacity(plane_res.len());
        for &handle in plane_res.iter() {
            let info = dev
                .get_plane(handle)
                .map_err(|source| Error::access("drmModeGetPlane", dev, source))?;
            let kind = plane_kind(dev, handle)?;
            let possible_crtcs = crtcs
                .iter()
                .filter(|c| info.possible_crtcs().contains(c.index as u32))
                .map(|c| c.handle)
                .collect();
            planes.push(Plane {
                handle,
                kind,
                possible_crtcs,
            });
        }
        let _ = crtc_index;

        Ok(Inventory {
            crtcs,
            connectors,
            planes,
        })
    }

    /// Planes of a given kind that can be driven by `crtc`.
    pub fn planes_for_crtc(&self, crtc: crtc::Handle, kind: PlaneKind) -> impl Iterator<Item = &Plane> {
        self.planes
            .iter()
            .filter(move |p| p.kind == kind && p.possible_crtcs.contains(&crtc))
    }

    /// The single primary plane for a CRTC, if present (there should always be exactly one).
    pub fn primary_plane_for_crtc(&self, crtc: crtc::Handle) -> Option<&Plane> {
        self.planes_for_crtc(crtc, PlaneKind::Primary).next()
    }
}

fn possible_crtcs_for_connector<D: ControlDevice>(
    dev: &D,
    info: &connector::Info,
    crtcs: &[Crtc],
) -> Result<Vec<crtc::Handle>, Error> {
    let mut possible = Vec::new();
    for &enc_handle in info.encoders() {
        let enc = dev
            .get_encoder(enc_handle)
            .map_err(|source| Error::access("drmModeGetEncoder", dev, source))?;
        for c in crtcs {
            if enc.possible_crtcs().contains(c.index as u32) && !possible.contains(&c.handle) {
                possible.push(c.handle);
            }
        }
    }
    Ok(possible)
}

fn plane_kind<D: ControlDevice>(dev: &D, handle: plane::Handle) -> Result<PlaneKind, Error> {
    let props = dev
        .get_properties(handle)
        .map_err(|source| Error::access("get_properties", dev, source))?;
    for (id, value) in props.as_props_and_values() {
        if let Ok(info) = dev.get_property(*id) {
            if info.name().to_str() == Ok("type") {
                return Ok(match *value as u32 {
                    x if x == PlaneType::Primary as u32 => PlaneKind::Primary,
                    x if x == PlaneType::Cursor as u32 => PlaneKind::Cursor,
                    _ => PlaneKind::Overlay,
                });
            }
        }
    }
    // Universal planes must carry a "type" enum property; absence means the
    // device did not actually enable universal planes.
    Ok(PlaneKind::Overlay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planes_for_crtc_filters_by_kind_and_mask() {
        let crtc_a: crtc::Handle = unsafe { std::mem::transmute(1u32) };
        let crtc_b: crtc::Handle = unsafe { std::mem::transmute(2u32) };
        let plane_handle: plane::Handle = unsafe { std::mem::transmute(10u32) };
        let inv = Inventory {
            crtcs: vec![Crtc { handle: crtc_a, index: 0 }, Crtc { handle: crtc_b, index: 1 }],
            connectors: vec![],
            planes: vec![Plane {
                handle: plane_handle,
                kind: PlaneKind::Primary,
                possible_crtcs: vec![crtc_a],
            }],
        };
        assert_eq!(inv.planes_for_crtc(crtc_a, PlaneKind::Primary).count(), 1);
        assert_eq!(inv.planes_for_crtc(crtc_b, PlaneKind::Primary).count(), 0);
        assert_eq!(inv.planes_for_crtc(crtc_a, PlaneKind::Cursor).count(), 0);
    }
}
