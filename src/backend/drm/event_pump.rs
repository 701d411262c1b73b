//! Event pump (C9): drains the DRM device fd and a udev monitor fd into a
//! priority-ordered queue of typed events.
//!
//! Grounded on `smithay`'s `backend::udev::UdevBackend` for the monitor
//! setup/filtering (`MonitorBuilder::new().match_subsystem("drm").listen()`,
//! matching events against a tracked device id) and on
//! `backend::drm::device::DrmDevice`'s `EventSource` impl for draining
//! `receive_events()` and distinguishing `Event::PageFlip`. This crate
//! exposes both fds for the host to register with its own
//! `calloop::EventLoop` (via [`EventPump::drm_fd`]/[`EventPump::udev_fd`])
//! rather than implementing `calloop::EventSource` itself, since unlike the
//! teacher's single-fd `DrmDevice` this pump owns two independent fds and a
//! combined source would need its own token bookkeeping for no benefit over
//! two plain `calloop::generic::Generic` registrations.

use std::collections::BinaryHeap;
use std::os::unix::io::AsRawFd;

use std::os::fd::BorrowedFd;
use drm::control::Device as ControlDevice;
use tracing::{debug, instrument, trace};
use udev::{EventType, MonitorBuilder, MonitorSocket};

use crate::backend::drm::device::DrmDeviceFd;
use crate::backend::drm::node::DrmNode;
use crate::error::Error;

/// A pump-drained event. Declared in ascending priority: later variants
/// compare greater under the derived [`Ord`], so popping a [`BinaryHeap`]
/// (a max-heap) always yields `DisplayRemoved` before `DisplayAdded` before
/// `Render` before `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    /// Never queued; exists so the enum has a least element.
    None,
    /// A page flip completed on some CRTC; the host should check which of
    /// its outputs has a pending flip and advance its state machine.
    Render,
    /// A hotplug re-inventory matched a connector to a CRTC that had none.
    DisplayAdded,
    /// A hotplug re-inventory found a connector that lost its CRTC or
    /// disappeared entirely.
    DisplayRemoved,
}

/// Drains the DRM fd's page-flip completions and a udev `drm` subsystem
/// monitor into a max-heap, so the most urgent event (a topology change)
/// always pops ahead of a routine render tick.
pub struct EventPump {
    fd: DrmDeviceFd,
    node: DrmNode,
    monitor: MonitorSocket,
    queue: BinaryHeap<Event>,
}

impl EventPump {
    /// Build a pump for `fd`, filtering udev notifications down to the
    /// device identified by `node`.
    pub fn new(fd: DrmDeviceFd, node: DrmNode) -> Result<Self, Error> {
        let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;
        Ok(EventPump {
            fd,
            node,
            monitor,
            queue: BinaryHeap::new(),
        })
    }

    /// The DRM device fd, for registering with a `calloop::EventLoop`.
    pub fn drm_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    /// The udev monitor fd, for registering with a `calloop::EventLoop`.
    pub fn udev_fd(&self) -> BorrowedFd<'_> {
        // udev's MonitorSocket only exposes AsRawFd, not AsFd.
        unsafe { BorrowedFd::borrow_raw(self.monitor.as_raw_fd()) }
    }

    /// Drain pending page-flip completions non-blockingly, enqueuing one
    /// [`Event::Render`] per event. Call this from the calloop callback
    /// registered on [`Self::drm_fd`].
    #[instrument(skip(self))]
    pub fn dispatch_drm(&mut self) -> Result<(), Error> {
        let events = self
            .fd
            .receive_events()
            .map_err(|source| Error::access("receive_events", &self.fd, source))?;
        for event in events {
            if let drm::control::Event::PageFlip(flip) = event {
                trace!(crtc = ?flip.crtc, "page flip event");
                self.queue.push(Event::Render);
            }
        }
        Ok(())
    }

    /// Drain pending udev notifications non-blockingly. A "change" event on
    /// the watched device node enqueues [`Event::DisplayAdded`] as a
    /// provisional wakeup; the host is expected to follow up with
    /// [`crate::backend::drm::device::DrmDevice::rescan`] and a matcher run,
    /// then report the true outcome back via [`Self::push`] (which may be
    /// `DisplayAdded`, `DisplayRemoved`, both, or neither depending on what
    /// the re-inventory found). Call this from the calloop callback
    /// registered on [`Self::udev_fd`].
    #[instrument(skip(self))]
    pub fn dispatch_udev(&mut self) {
        let monitor = self.monitor.clone();
        for event in monitor {
            if event.event_type() != EventType::Change {
                continue;
            }
            let Some(devnum) = event.devnum() else { continue };
            if devnum != self.node.dev_id() {
                trace!(?devnum, "udev change event on an untracked device, ignoring");
                continue;
            }
            debug!("udev change event on active gpu, queuing provisional hotplug event");
            self.queue.push(Event::DisplayAdded);
        }
    }

    /// Enqueue an event directly, e.g. the reconciled outcome of a matcher
    /// run triggered by [`Self::dispatch_udev`].
    pub fn push(&mut self, event: Event) {
        self.queue.push(event);
    }

    /// Pop the highest-priority pending event, or `None` if the queue is
    /// empty (the host may then sleep or do other work). Mirrors
    /// `get_event`'s "returns false when empty" contract via `Option`.
    pub fn get_event(&mut self) -> Option<Event> {
        self.queue.pop()
    }

    /// Whether any event is currently queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_heap_pops_display_removed_before_display_added_before_render() {
        let mut heap = BinaryHeap::new();
        heap.push(Event::Render);
        heap.push(Event::DisplayAdded);
        heap.push(Event::DisplayRemoved);
        heap.push(Event::None);

        assert_eq!(heap.pop(), Some(Event::DisplayRemoved));
        assert_eq!(heap.pop(), Some(Event::DisplayAdded));
        assert_eq!(heap.pop(), Some(Event::Render));
        assert_eq!(heap.pop(), Some(Event::None));
        assert_eq!(heap.pop(), None);
    }
}
