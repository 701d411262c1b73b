//! Small general-purpose utilities shared across the backend.

pub mod fd;
pub mod signaling;

pub use fd::{DevPath, DeviceFd};
pub use signaling::{Linkable, SignalToken, Signaler};

/// This resource has been destroyed and can no longer be used.
#[derive(Debug)]
pub struct DeadResource;

impl std::fmt::Display for DeadResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("This resource has been destroyed and can no longer be used.")
    }
}

impl std::error::Error for DeadResource {}
