#![warn(missing_debug_implementations, rust_2018_idioms)]

//! A Wayland compositor's output-display core: drives connector → CRTC →
//! plane pipelines through DRM/KMS, binds them to a buffer allocator, and
//! exposes an [`Output`](backend::drm::Output) lifecycle and a
//! [`Buffer`](backend::allocator::Buffer) ownership contract to upstream
//! layers (surfaces, damage tracking, screencopy, XDG shell, renderers).
//! Those upstream layers are not implemented here.
//!
//! Out of scope: Wayland wire protocol dispatch, input devices/seats,
//! surface trees, XDG shell state, damage accumulation, GL rendering,
//! screencopy, drag-and-drop.

pub mod backend;
pub mod error;
pub mod utils;

pub use error::Error;
