//! Crate-wide error type.
//!
//! Every public operation that can fail funnels its error into [`Error`].
//! Subsystems keep their own narrow error enums (see
//! [`crate::backend::allocator`]'s `AllocatorError` and
//! [`crate::backend::allocator::swapchain`]'s `SwapchainError`) and convert
//! into this type at the boundary, mirroring `smithay`'s
//! `Error::Access { errmsg, dev, source }` shape.

use std::path::PathBuf;

use drm::control::crtc;

/// Which phase of an atomic commit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    /// The `DRM_MODE_ATOMIC_TEST_ONLY` dry-run failed.
    Test,
    /// The real, non-test commit failed after a successful test.
    Commit,
}

impl std::fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitPhase::Test => f.write_str("test"),
            CommitPhase::Commit => f.write_str("commit"),
        }
    }
}

/// Top level error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A buffer could not be allocated.
    #[error("failed to allocate a buffer: {0}")]
    AllocFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An atomic commit failed during the named phase.
    #[error("atomic commit failed during {phase}: {errmsg}")]
    KmsAtomicFailure {
        /// Which step of the commit failed.
        phase: CommitPhase,
        /// A short, static description of what was attempted.
        errmsg: &'static str,
        /// The device the failing CRTC belongs to, if known.
        dev: Option<PathBuf>,
        /// The underlying DRM system error.
        #[source]
        source: drm::SystemError,
    },

    /// A legacy (non-atomic) mode-setting ioctl failed.
    #[error("legacy kms call '{errmsg}' failed on crtc {crtc:?}")]
    KmsLegacyFailure {
        /// A short, static description of what was attempted.
        errmsg: &'static str,
        /// The CRTC the call targeted.
        crtc: crtc::Handle,
        /// The underlying DRM system error.
        #[source]
        source: drm::SystemError,
    },

    /// A DRM lease was revoked by the kernel or the lessor.
    #[error("drm lease revoked")]
    LeaseRevoked,

    /// The session is currently paused (VT-switched away); the operation was rejected.
    #[error("session is paused, operation rejected")]
    SessionPaused,

    /// An operation was attempted on an `Output` or `Device` in a state that
    /// does not allow it (e.g. testing an empty pending state, committing a
    /// disabled output).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A DRM ioctl failed with call-site context, mirroring `smithay`'s
    /// `Error::Access` variant.
    #[error("drm device ({dev:?}) access error, call to {errmsg} failed")]
    Access {
        /// What was being attempted.
        errmsg: &'static str,
        /// The device path, if it could be resolved.
        dev: Option<PathBuf>,
        /// The underlying DRM system error.
        #[source]
        source: drm::SystemError,
    },

    /// Wraps an arbitrary IO error (opening a device node, reading a sysfs
    /// attribute, etc).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::Access`], resolving the device path from an open fd if possible.
    pub fn access(errmsg: &'static str, dev: impl crate::utils::DevPath, source: drm::SystemError) -> Self {
        Error::Access {
            errmsg,
            dev: dev.dev_path(),
            source,
        }
    }
}
