//! [dmabuf](https://docs.kernel.org/driver-api/dma-buf.html) buffers: the
//! cross-process, cross-subsystem buffer handle every allocator in this
//! crate can export to.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};

use super::{Buffer, Format, Modifier};

const MAX_PLANES: usize = 4;

#[derive(Debug)]
struct DmabufInternal {
    num_planes: usize,
    offsets: [u32; MAX_PLANES],
    strides: [u32; MAX_PLANES],
    // fds beyond num_planes are unused; OwnedFd closes the real descriptor on drop.
    fds: Vec<OwnedFd>,
    width: u32,
    height: u32,
    format: Format,
}

/// Strong reference to an exported dmabuf. Cloning is cheap (ref-counted);
/// the underlying fds close when the last clone drops.
#[derive(Debug, Clone)]
pub struct Dmabuf(Arc<DmabufInternal>);

/// Weak reference to a [`Dmabuf`] that does not keep its fds alive.
#[derive(Debug, Clone)]
pub struct WeakDmabuf(Weak<DmabufInternal>);

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl PartialEq<WeakDmabuf> for Dmabuf {
    fn eq(&self, other: &WeakDmabuf) -> bool {
        other.upgrade().is_some_and(|o| Arc::ptr_eq(&self.0, &o.0))
    }
}

impl Buffer for Dmabuf {
    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }

    fn format(&self) -> Format {
        self.0.format
    }
}

impl Dmabuf {
    /// Build a dmabuf from per-plane fds, offsets and strides. Ownership of
    /// every plane fd transfers to the returned buffer, which closes them on
    /// drop. Returns `None` if `planes` is out of `1..=MAX_PLANES` or the
    /// slices disagree on length.
    pub(crate) fn new(
        src: &impl Buffer,
        planes: usize,
        offsets: &[u32],
        strides: &[u32],
        fds: Vec<OwnedFd>,
    ) -> Option<Dmabuf> {
        if planes == 0
            || planes > MAX_PLANES
            || offsets.len() < planes
            || strides.len() < planes
            || fds.len() < planes
        {
            return None;
        }

        let mut padded_offsets = [0u32; MAX_PLANES];
        let mut padded_strides = [0u32; MAX_PLANES];
        padded_offsets[..planes].copy_from_slice(&offsets[..planes]);
        padded_strides[..planes].copy_from_slice(&strides[..planes]);

        Some(Dmabuf(Arc::new(DmabufInternal {
            num_planes: planes,
            offsets: padded_offsets,
            strides: padded_strides,
            fds: fds.into_iter().take(planes).collect(),
            width: src.width(),
            height: src.height(),
            format: src.format(),
        })))
    }

    /// Number of dmabuf planes.
    pub fn num_planes(&self) -> usize {
        self.0.num_planes
    }

    /// Borrowed fds of each plane, in plane order.
    pub fn handles(&self) -> impl Iterator<Item = std::os::fd::BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        self.0.fds.iter().map(|fd| fd.as_fd())
    }

    /// Byte offsets of each plane.
    pub fn offsets(&self) -> &[u32] {
        &self.0.offsets[..self.0.num_planes]
    }

    /// Row strides of each plane, in bytes.
    pub fn strides(&self) -> &[u32] {
        &self.0.strides[..self.0.num_planes]
    }

    /// Whether this buffer carries an explicit, non-linear modifier.
    pub fn has_modifier(&self) -> bool {
        self.0.format.modifier != Modifier::Invalid && self.0.format.modifier != Modifier::Linear
    }

    /// Downgrade to a [`WeakDmabuf`].
    pub fn weak(&self) -> WeakDmabuf {
        WeakDmabuf(Arc::downgrade(&self.0))
    }
}

impl WeakDmabuf {
    /// Attempt to upgrade back to a strong [`Dmabuf`]. Fails once every
    /// strong reference has already been dropped and the fds closed.
    pub fn upgrade(&self) -> Option<Dmabuf> {
        self.0.upgrade().map(Dmabuf)
    }
}

/// Buffers that can be exported as a [`Dmabuf`].
pub trait AsDmabuf {
    /// Error type returned if exporting fails.
    type Error;

    /// Export this buffer as a new dmabuf.
    fn export(&self) -> Result<Dmabuf, Self::Error>;
}

impl AsDmabuf for Dmabuf {
    type Error = std::convert::Infallible;

    fn export(&self) -> Result<Dmabuf, Self::Error> {
        Ok(self.clone())
    }
}
