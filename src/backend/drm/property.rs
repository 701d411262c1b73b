//! DRM property cache.
//!
//! KMS exposes object properties (connector/CRTC/plane/framebuffer) only by
//! numeric id, resolved at runtime per device via a name lookup ioctl. Doing
//! that lookup on every commit is wasteful and, for enum/blob properties,
//! throws away information (the set of valid enum values, or a blob's raw
//! bytes) that is only available at query time. [`PropertyCache`] queries
//! every property of every object once at device-open time and thereafter
//! serves name -> id lookups and blob reads from memory.
//!
//! Grounded on the snapshotting done in `device/atomic.rs`'s `add_props`/
//! `map_props` helpers, generalized into a reusable, queryable cache rather
//! than a one-shot restore-on-drop snapshot.

use std::collections::HashMap;

use drm::control::{property, Device as ControlDevice, RawResourceHandle};

use crate::error::Error;

/// A cached property: its id plus the parts of its metadata we care about.
#[derive(Debug, Clone)]
pub struct CachedProperty {
    handle: property::Handle,
    info: property::Info,
}

impl CachedProperty {
    /// The property's id on this device.
    pub fn handle(&self) -> property::Handle {
        self.handle
    }

    /// The full property metadata as returned by the kernel.
    pub fn info(&self) -> &property::Info {
        &self.info
    }
}

/// Per-object-type property table: object handle -> property name -> cached property.
#[derive(Debug, Default)]
pub struct PropertyCache {
    table: HashMap<RawResourceHandle, HashMap<String, CachedProperty>>,
}

impl PropertyCache {
    /// Query and cache every property of `objects` on `dev`.
    pub fn build<D, O>(dev: &D, objects: impl IntoIterator<Item = O>) -> Result<Self, Error>
    where
        D: ControlDevice,
        O: ResourceHandle,
    {
        let mut table = HashMap::new();
        for obj in objects {
            let raw = obj.into_raw();
            let props = dev
                .get_properties(obj.into_drm_handle())
                .map_err(|source| Error::access("get_properties", dev, source))?;
            let mut by_name = HashMap::new();
            for (id, _value) in props.as_props_and_values() {
                let info = dev
                    .get_property(*id)
                    .map_err(|source| Error::access("get_property", dev, source))?;
                let name = info.name().to_str().unwrap_or_default().to_string();
                by_name.insert(name, CachedProperty { handle: *id, info });
            }
            table.insert(raw, by_name);
        }
        Ok(PropertyCache { table })
    }

    /// Resolve a property id by object and property name.
    pub fn property_handle(&self, obj: impl ResourceHandle, name: &str) -> Option<property::Handle> {
        self.table.get(&obj.into_raw())?.get(name).map(|p| p.handle)
    }

    /// Full cached metadata for an object's property, by name.
    pub fn property(&self, obj: impl ResourceHandle, name: &str) -> Option<&CachedProperty> {
        self.table.get(&obj.into_raw())?.get(name)
    }

    /// All property names known for an object.
    pub fn names(&self, obj: impl ResourceHandle) -> impl Iterator<Item = &str> {
        self.table
            .get(&obj.into_raw())
            .into_iter()
            .flat_map(|m| m.keys().map(String::as_str))
    }

    /// Build a cache directly from a pre-populated table (used to merge
    /// several single-object [`PropertyCache::build`] calls into one).
    pub(crate) fn from_table(
        table: HashMap<RawResourceHandle, HashMap<String, CachedProperty>>,
    ) -> Self {
        PropertyCache { table }
    }

    /// Decompose back into the raw table, to merge into a larger cache.
    pub(crate) fn into_table(self) -> HashMap<RawResourceHandle, HashMap<String, CachedProperty>> {
        self.table
    }
}

/// Bridges the handful of DRM resource handle types (`connector::Handle`,
/// `crtc::Handle`, `plane::Handle`, ...) to a common raw form so the cache
/// can be keyed generically.
pub trait ResourceHandle: Copy {
    /// The concrete `drm::control::*::Handle` this converts to for ioctls.
    type DrmHandle: Into<RawResourceHandle> + Copy;

    /// Convert to the handle expected by `get_properties`.
    fn into_drm_handle(self) -> Self::DrmHandle;

    /// Convert to the raw handle used as the cache key.
    fn into_raw(self) -> RawResourceHandle {
        self.into_drm_handle().into()
    }
}

macro_rules! impl_resource_handle {
    ($ty:path) => {
        impl ResourceHandle for $ty {
            type DrmHandle = $ty;

            fn into_drm_handle(self) -> Self::DrmHandle {
                self
            }
        }
    };
}

impl_resource_handle!(drm::control::connector::Handle);
impl_resource_handle!(drm::control::crtc::Handle);
impl_resource_handle!(drm::control::plane::Handle);
impl_resource_handle!(drm::control::framebuffer::Handle);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_has_no_entries() {
        let cache = PropertyCache::default();
        assert!(cache.table.is_empty());
    }
}
