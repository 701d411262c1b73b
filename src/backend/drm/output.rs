//! Per-connector output state machine: the pending/test/commit/page-flip
//! lifecycle, mode setting, enable/disable and cursor updates.
//!
//! Grounded on `smithay`'s `backend::drm::compositor`/`device/surface.rs`
//! pending-state-then-flush design, simplified into one explicit bitfield
//! (`PendingFields`) rather than several separate dirty flags, and wired to
//! [`Signaler`] for its listener sets per this crate's Design Notes §9.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use drm::buffer::Buffer as DrmBuffer;
use drm::control::{connector, crtc, framebuffer, plane, Mode};
use tracing::{debug, info, instrument, warn};

use crate::backend::allocator::{Allocator, Buffer as AllocBuffer, Slot, Swapchain};
use crate::backend::drm::device::DrmDeviceFd;
use crate::backend::drm::framebuffer as fb_registry;
use crate::backend::drm::kms::{Backend, CommitFlags, CrtcCommit, PlaneState};
use crate::error::Error;
use crate::utils::Signaler;

bitflags! {
    /// Which fields of [`Pending`] carry a staged value awaiting [`Output::commit`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PendingFields: u8 {
        /// `enabled` is staged.
        const ENABLED = 0b0000_0001;
        /// `mode` is staged.
        const MODE    = 0b0000_0010;
        /// `buffer` is staged.
        const BUFFER  = 0b0000_0100;
        /// `damage` is staged (tracked for upstream consumers; this crate does not interpret it).
        const DAMAGE  = 0b0000_1000;
        /// `cursor` is staged.
        const CURSOR  = 0b0001_0000;
        /// `gamma` is staged.
        const GAMMA   = 0b0010_0000;
    }
}

/// Coarse connection lifecycle, independent of the transient page-flip sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// The connector reported disconnected at last scan; the output is a disabled stub.
    Disconnected,
    /// Connected but has never completed a modeset commit.
    NeedsModeset,
    /// Connected and actively scanning out a mode.
    Connected,
}

struct Pending<B> {
    fields: PendingFields,
    enabled: bool,
    mode: Option<Mode>,
    buffer: Option<Slot<B>>,
    cursor: Option<framebuffer::Handle>,
    gamma: Option<Vec<(u16, u16, u16)>>,
}

impl<B> Default for Pending<B> {
    fn default() -> Self {
        Pending {
            fields: PendingFields::empty(),
            enabled: false,
            mode: None,
            buffer: None,
            cursor: None,
            gamma: None,
        }
    }
}

/// The listener sets a compositor subscribes to via [`Signaler::register`].
#[derive(Debug, Clone)]
pub struct OutputSignals {
    /// Fired when a page flip completes and the new front buffer is on screen.
    pub frame: Signaler<()>,
    /// Fired when a mode change commits successfully.
    pub mode: Signaler<Mode>,
    /// Fired after any successful commit (mode, buffer, cursor, or combination).
    pub commit: Signaler<()>,
    /// Fired when the output wants a new frame rendered (e.g. after vblank).
    pub needs_frame: Signaler<()>,
    /// Fired once, when the output is torn down after having reached `Connected`.
    pub destroy: Signaler<()>,
    /// Fired immediately before a commit is submitted to the backend.
    pub precommit: Signaler<()>,
}

impl Default for OutputSignals {
    fn default() -> Self {
        OutputSignals {
            frame: Signaler::new(),
            mode: Signaler::new(),
            commit: Signaler::new(),
            needs_frame: Signaler::new(),
            destroy: Signaler::new(),
            precommit: Signaler::new(),
        }
    }
}

/// One display pipeline: a connector driven by a CRTC through a primary
/// (and optionally cursor) plane, with its own buffer pool.
pub struct Output<A: Allocator> {
    fd: DrmDeviceFd,
    name: String,
    connector: connector::Handle,
    crtc: crtc::Handle,
    primary_plane: plane::Handle,
    conn_state: ConnState,
    pageflip_pending: bool,
    mode: Option<Mode>,
    front: Option<Slot<A::Buffer>>,
    swapchain: Swapchain<A>,
    pending: Pending<A::Buffer>,
    cursor_hotspot: (i32, i32),
    cursor_pos: (i32, i32),
    signals: OutputSignals,
    active: Arc<AtomicBool>,
}

impl<A: Allocator> Output<A> {
    /// Build a disabled output stub for a freshly matched connector/CRTC/plane triple.
    ///
    /// `name` is expected to already encode the connector type and index
    /// (e.g. `"DP-1"`), mirroring how `smithay` names outputs from
    /// `connector::Info::interface()`/`interface_id()` — resolving that from
    /// the raw connector belongs to the caller, which already has the
    /// [`crate::backend::drm::inventory::Inventory`] this output was matched from.
    pub fn new(
        fd: DrmDeviceFd,
        name: String,
        connector: connector::Handle,
        crtc: crtc::Handle,
        primary_plane: plane::Handle,
        swapchain: Swapchain<A>,
    ) -> Self {
        Output {
            fd,
            name,
            connector,
            crtc,
            primary_plane,
            conn_state: ConnState::NeedsModeset,
            pageflip_pending: false,
            mode: None,
            front: None,
            swapchain,
            pending: Pending::default(),
            cursor_hotspot: (0, 0),
            cursor_pos: (0, 0),
            signals: OutputSignals::default(),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Bind this output's commit path to a session's activity flag (e.g.
    /// [`crate::backend::drm::device::DrmDevice::active_flag`]), so commits
    /// silently fail with [`Error::SessionPaused`] while the session is
    /// suspended rather than racing the kernel with a stale fd.
    pub fn bind_active_flag(&mut self, active: Arc<AtomicBool>) {
        self.active = active;
    }

    /// The output's human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The CRTC this output is bound to.
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// The connector this output is bound to.
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Current (applied, not pending) mode, if the output has completed a modeset.
    pub fn current_mode(&self) -> Option<Mode> {
        self.mode
    }

    /// The lifecycle state of the underlying connector.
    pub fn connection_state(&self) -> ConnState {
        self.conn_state
    }

    /// Whether a commit has been submitted and its page-flip event is still outstanding.
    pub fn pageflip_pending(&self) -> bool {
        self.pageflip_pending
    }

    /// The listener sets a compositor subscribes to.
    pub fn signals(&self) -> &OutputSignals {
        &self.signals
    }

    /// Acquire a back-buffer from the swapchain and stage it for the next commit.
    /// Returns the slot's buffer age. Mutually exclusive with [`Self::attach_buffer`].
    pub fn attach_render(&mut self) -> Result<u8, Error> {
        let slot = self
            .swapchain
            .acquire()
            .map_err(|source| Error::AllocFailure(Box::new(source)))?
            .ok_or(Error::InvalidState("swapchain exhausted, no free slot to render into"))?;
        let age = slot.age();
        self.pending.buffer = Some(slot);
        self.pending.fields.insert(PendingFields::BUFFER);
        Ok(age)
    }

    /// Stage an externally produced buffer as the next scan-out candidate.
    /// Mutually exclusive with [`Self::attach_render`].
    pub fn attach_buffer(&mut self, buffer: Slot<A::Buffer>) {
        self.pending.buffer = Some(buffer);
        self.pending.fields.insert(PendingFields::BUFFER);
    }

    /// Stage a mode change to one of the connector's reported modes.
    pub fn set_mode(&mut self, mode: Mode) {
        self.pending.mode = Some(mode);
        self.pending.fields.insert(PendingFields::MODE);
    }

    /// Stage a mode change to a synthesized mode at the given size/refresh,
    /// via a reduced-blanking CVT timing (used for connectors, e.g. some
    /// virtual/tunneled displays, that report no native mode list).
    pub fn set_custom_mode(&mut self, width: u32, height: u32, hz: u32) {
        self.set_mode(super::cvt::reduced_blanking_mode(width, height, hz));
    }

    /// Stage enable/disable. Enabling without a staged buffer auto-attaches
    /// one via [`Self::ensure_buffer`].
    pub fn enable(&mut self, enabled: bool) -> Result<(), Error> {
        self.pending.enabled = enabled;
        self.pending.fields.insert(PendingFields::ENABLED);
        if enabled {
            self.ensure_buffer()?;
        }
        Ok(())
    }

    /// Stage a cursor image change. `None` hides the cursor.
    pub fn set_cursor(&mut self, image: Option<framebuffer::Handle>, hotspot: (i32, i32)) {
        self.pending.cursor = image;
        self.cursor_hotspot = hotspot;
        self.pending.fields.insert(PendingFields::CURSOR);
    }

    /// Move the cursor without changing its image.
    pub fn move_cursor(&mut self, x: i32, y: i32) {
        self.cursor_pos = (x, y);
        self.pending.fields.insert(PendingFields::CURSOR);
    }

    /// Stage a gamma ramp change.
    pub fn set_gamma(&mut self, ramp: Vec<(u16, u16, u16)>) {
        self.pending.gamma = Some(ramp);
        self.pending.fields.insert(PendingFields::GAMMA);
    }

    /// If no buffer is staged, acquire one from the swapchain so mode/enable
    /// commits always have scan-out content. New allocations come zeroed
    /// from the kernel (GBM/dumb/memfd all zero-fill), so no explicit clear
    /// blit is needed here; actual content compositing is out of scope.
    fn ensure_buffer(&mut self) -> Result<(), Error> {
        if !self.pending.fields.contains(PendingFields::BUFFER) && self.front.is_none() {
            self.attach_render()?;
        }
        Ok(())
    }

    fn check_preconditions(&mut self) -> Result<(), Error> {
        if self.pending.fields.contains(PendingFields::ENABLED) && self.pending.enabled {
            self.ensure_buffer()?;
        }
        if self.pending.fields.contains(PendingFields::MODE) {
            self.ensure_buffer()?;
        }
        Ok(())
    }

    fn build_commit(&self) -> Result<CrtcCommit, Error>
    where
        A::Buffer: DrmBuffer,
    {
        let fb = self
            .pending
            .buffer
            .as_ref()
            .or(self.front.as_ref())
            .map(|slot| fb_registry::get_or_register(&self.fd, slot))
            .transpose()?;

        let (w, h) = self
            .pending
            .buffer
            .as_ref()
            .map(|s| (s.width(), s.height()))
            .or_else(|| self.front.as_ref().map(|s| (s.width(), s.height())))
            .unwrap_or((0, 0));

        let active = if self.pending.fields.contains(PendingFields::ENABLED) {
            self.pending.enabled
        } else {
            self.conn_state == ConnState::Connected
        };

        Ok(CrtcCommit {
            crtc: self.crtc,
            active,
            mode: self.pending.mode.or(self.mode),
            connectors: vec![self.connector],
            planes: vec![PlaneState {
                plane: self.primary_plane,
                framebuffer: fb,
                dst: (0, 0, w, h),
                src: (0, 0, w, h),
            }],
        })
    }

    fn modeset_requested(&self) -> bool {
        self.pending.fields.intersects(PendingFields::MODE | PendingFields::ENABLED) || self.conn_state != ConnState::Connected
    }

    /// Validate the pending state against the kernel without applying it.
    #[instrument(skip(self, backend), fields(output = %self.name))]
    pub fn test(&mut self, backend: &mut dyn Backend) -> Result<(), Error>
    where
        A::Buffer: DrmBuffer,
    {
        self.check_preconditions()?;
        let commit = self.build_commit()?;
        let flags = CommitFlags { test_only: true, allow_modeset: self.modeset_requested() };
        match backend.crtc_commit(&commit, flags) {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.retry_without_modifiers() {
                    warn!("modeset test failed with a modifier-using format, retrying without modifiers");
                    self.test(backend)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// If the swapchain is currently using explicit modifiers, drop to the
    /// implicit/linear variant and re-stage a buffer. Returns whether a
    /// retry is warranted (only ever true once per staged buffer, since a
    /// modifier-less swapchain can't be downgraded further).
    fn retry_without_modifiers(&mut self) -> bool {
        if self.swapchain.modifiers().is_empty() {
            return false;
        }
        self.swapchain.clear_modifiers();
        self.pending.buffer = None;
        self.pending.fields.remove(PendingFields::BUFFER);
        self.ensure_buffer().is_ok()
    }

    /// Apply the pending state. On success the staged buffer becomes the new
    /// front buffer, `pageflip_pending` is armed, and pending state is
    /// cleared. On failure pending state is left untouched.
    #[instrument(skip(self, backend), fields(output = %self.name))]
    pub fn commit(&mut self, backend: &mut dyn Backend) -> Result<(), Error>
    where
        A::Buffer: DrmBuffer,
    {
        if !self.active.load(Ordering::Acquire) {
            debug!("session paused, dropping commit");
            return Err(Error::SessionPaused);
        }
        if self.pageflip_pending {
            return Err(Error::InvalidState("commit while page flip is still pending"));
        }
        self.check_preconditions()?;
        self.signals.precommit.signal(());

        let commit = self.build_commit()?;
        let modeset = self.modeset_requested();
        let flags = CommitFlags { test_only: false, allow_modeset: modeset };

        match backend.crtc_commit(&commit, flags) {
            Ok(()) => {}
            Err(_) if self.retry_without_modifiers() => {
                warn!("commit failed with a modifier-using format, retrying without modifiers");
                return self.commit(backend);
            }
            Err(err) => return Err(err),
        }

        if self.pending.fields.contains(PendingFields::CURSOR) {
            backend.crtc_set_cursor(self.crtc, self.pending.cursor)?;
            let (x, y) = self.cursor_pos;
            let (hx, hy) = self.cursor_hotspot;
            backend.crtc_move_cursor(self.crtc, (x - hx, y - hy))?;
        }
        if self.pending.fields.contains(PendingFields::GAMMA) {
            if let Some(ramp) = &self.pending.gamma {
                backend.crtc_set_gamma(self.crtc, ramp)?;
            }
        }

        if let Some(mode) = commit.mode {
            self.mode = Some(mode);
            self.signals.mode.signal(mode);
        }
        if let Some(buf) = self.pending.buffer.take() {
            self.front = Some(buf);
        }
        if modeset {
            info!("output reached connected state");
            self.conn_state = ConnState::Connected;
        }

        self.pending.fields = PendingFields::empty();
        self.pageflip_pending = true;
        self.signals.commit.signal(());
        Ok(())
    }

    /// Discard staged state without applying it. Dropping a staged buffer
    /// slot releases it back to the swapchain.
    pub fn rollback(&mut self) {
        self.pending.buffer = None;
        self.pending.cursor = None;
        self.pending.gamma = None;
        self.pending.fields = PendingFields::empty();
    }

    /// Invoked by the event pump when this output's page flip completes:
    /// releases the previous front buffer, clears `pageflip_pending`, and
    /// signals `frame` if the output is still connected.
    #[instrument(skip(self), fields(output = %self.name))]
    pub fn handle_page_flip(&mut self) {
        self.pageflip_pending = false;
        if self.conn_state == ConnState::Connected {
            self.signals.frame.signal(());
        }
        debug!("page flip completed");
    }

    /// Tear down the output after its connector was removed. If a
    /// commit's page flip is still outstanding the caller must drain the
    /// event pump until [`Self::pageflip_pending`] clears before calling
    /// this, per this crate's cleanup contract.
    pub fn disconnect(mut self) {
        let was_connected = self.conn_state == ConnState::Connected;
        self.conn_state = ConnState::Disconnected;
        if was_connected {
            self.signals.destroy.signal(());
        }
    }
}
