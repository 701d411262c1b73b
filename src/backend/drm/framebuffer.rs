//! KMS framebuffer registration (part of C5): turning an allocated buffer
//! into a `drmModeAddFB2` framebuffer id.
//!
//! Grounded on `smithay`'s habit of stashing a registered framebuffer id as
//! swapchain slot userdata (`backend/drm/compositor/mod.rs`) so a buffer
//! that's committed on consecutive frames isn't re-registered each time.

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{framebuffer, Device as ControlDevice};

use crate::backend::allocator::Slot;
use crate::error::Error;

#[derive(Clone, Copy)]
struct Registered(framebuffer::Handle);

/// Return the framebuffer id for `slot`'s buffer, registering it with `dev`
/// the first time this particular slot is seen.
pub fn get_or_register<D, B>(dev: &D, slot: &Slot<B>) -> Result<framebuffer::Handle, Error>
where
    D: ControlDevice,
    B: DrmBuffer,
{
    if let Some(guard) = slot.userdata::<Registered>() {
        if let Some(&Registered(handle)) = guard.as_ref().and_then(|b| b.downcast_ref::<Registered>()) {
            return Ok(handle);
        }
    }

    let handle = dev
        .add_framebuffer(&**slot, 24, 32)
        .map_err(|source| Error::access("add_framebuffer", dev, source))?;
    slot.set_userdata(Registered(handle));
    Ok(handle)
}

/// Destroy the cached framebuffer id for `slot`, if one was registered.
/// Call this before the slot's buffer is reused for an incompatible format
/// (e.g. the modifier-less retry in [`crate::backend::drm::output`]), or the
/// device keeps a stale framebuffer id alive pointing at recycled memory.
pub fn forget<D: ControlDevice, B>(dev: &D, slot: &Slot<B>) {
    let Some(guard) = slot.userdata::<Registered>() else {
        return;
    };
    let handle = guard.as_ref().and_then(|b| b.downcast_ref::<Registered>()).map(|r| r.0);
    drop(guard);
    if let Some(handle) = handle {
        slot.clear_userdata();
        let _ = dev.destroy_framebuffer(handle);
    }
}
