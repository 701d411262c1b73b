//! Session device lease (C10, session-authority half): taking and releasing
//! raw device file descriptors through a session authority (`libseat`), and
//! the pause/resume events that follow a VT switch.
//!
//! Grounded on `smithay`'s `backend::session` module, narrowed to the shape
//! its `libseat` implementation (kept verbatim in [`libseat`]) actually
//! needs: `OwnedFd`-returning `open`/`close` and a plain [`Event`] enum
//! delivered through `calloop::EventSource`, rather than the older
//! `RawFd`/`SessionObserver` callback-registration API `smithay` has since
//! moved past for this backend.

use std::path::Path;

use rustix::fs::OFlags;
use std::os::unix::io::OwnedFd;

#[cfg(feature = "backend_session_libseat")]
pub mod libseat;

/// General session interface: open/close devices, switch VTs, query seat
/// activity.
pub trait Session {
    /// Error type of the implementation.
    type Error: AsErrno;

    /// Open a device node at `path` with the given flags, returning an
    /// owned fd the session authority has authorized.
    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error>;

    /// Close a previously opened device. `fd` is also closed on drop
    /// regardless, so this is for releasing the session authority's grant
    /// promptly rather than waiting on `Drop`.
    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error>;

    /// Switch to the given virtual terminal.
    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error>;

    /// Whether this session currently holds device access (not VT-switched away).
    fn is_active(&self) -> bool;

    /// The seat name this session belongs to (e.g. `"seat0"`).
    fn seat(&self) -> String;
}

/// Delivered by a session's `calloop::EventSource` when the seat is
/// suspended or restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The session just regained device access (e.g. switched back to this VT).
    ActivateSession,
    /// The session just lost device access; open devices are unusable until
    /// the matching `ActivateSession`.
    PauseSession,
}

/// Allows errors to be described by an OS error number, for the fallback
/// paths that need to distinguish e.g. `ENOENT` from a revoked session.
pub trait AsErrno: std::fmt::Debug {
    /// The OS error number behind this error, if there is one.
    fn as_errno(&self) -> Option<i32>;
}

impl AsErrno for () {
    fn as_errno(&self) -> Option<i32> {
        None
    }
}
