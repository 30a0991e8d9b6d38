//! Kernel framebuffers for GBM buffer objects.
//!
//! Every buffer object handed to the display gets exactly one framebuffer. Records live
//! in a table keyed by buffer identity and remove their framebuffer when dropped, so
//! the framebuffer goes away together with its buffer on every path, including errors
//! and session teardown.

use std::{collections::HashMap, io, num::NonZeroU32};

use smithay::{
    backend::{
        allocator::{Fourcc, Modifier},
        drm::DrmDeviceFd,
    },
    reexports::{
        drm::{
            buffer::{self, PlanarBuffer},
            control::{Device as ControlDevice, FbCmd2Flags, framebuffer},
        },
        gbm::{AsRaw, BufferObject},
    },
};

use crate::{DisplayError, Result};

/// Identity of a buffer object for the lifetime of its allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferKey(usize);

impl BufferKey {
    pub fn of<T: 'static>(bo: &BufferObject<T>) -> Self {
        BufferKey(bo.as_raw() as usize)
    }

    pub const fn from_raw(raw: usize) -> Self {
        BufferKey(raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub handle: u32,
    pub stride: u32,
    pub offset: u32,
}

/// Geometry of a buffer object as needed to describe it to the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    /// `None` when the allocator cannot report one.
    pub modifier: Option<Modifier>,
    pub planes: Vec<PlaneLayout>,
}

impl BufferLayout {
    pub fn of<B: PlanarBuffer + ?Sized>(buffer: &B) -> Self {
        let (width, height) = buffer.size();
        let handles = buffer.handles();
        let pitches = buffer.pitches();
        let offsets = buffer.offsets();
        let planes = handles
            .into_iter()
            .zip(pitches)
            .zip(offsets)
            .map_while(|((handle, stride), offset)| {
                handle.map(|handle| PlaneLayout {
                    handle: handle.into(),
                    stride,
                    offset,
                })
            })
            .collect();

        Self {
            width,
            height,
            format: buffer.format(),
            modifier: buffer.modifier().filter(|modifier| *modifier != Modifier::Invalid),
            planes,
        }
    }

    /// Every plane with the allocation modifier attached.
    pub fn with_modifiers(&self) -> FramebufferPlanes<'_> {
        FramebufferPlanes {
            layout: self,
            legacy: false,
        }
    }

    /// First plane only, zero offset, no modifier.
    pub fn single_plane(&self) -> FramebufferPlanes<'_> {
        FramebufferPlanes {
            layout: self,
            legacy: true,
        }
    }
}

/// A view of a [`BufferLayout`] in the shape `drmModeAddFB2` expects.
#[derive(Clone, Copy, Debug)]
pub struct FramebufferPlanes<'a> {
    layout: &'a BufferLayout,
    legacy: bool,
}

impl FramebufferPlanes<'_> {
    fn planes(&self) -> impl Iterator<Item = &PlaneLayout> {
        let count = if self.legacy { 1 } else { 4 };
        self.layout.planes.iter().take(count)
    }

    /// Whether the kernel must be told about the modifier.
    pub fn needs_modifier_flag(&self) -> bool {
        !self.legacy
            && self
                .layout
                .modifier
                .is_some_and(|modifier| modifier != Modifier::Linear)
    }
}

impl PlanarBuffer for FramebufferPlanes<'_> {
    fn size(&self) -> (u32, u32) {
        (self.layout.width, self.layout.height)
    }

    fn format(&self) -> Fourcc {
        self.layout.format
    }

    // The kernel only accepts a modifier together with the MODIFIERS flag.
    fn modifier(&self) -> Option<Modifier> {
        if self.needs_modifier_flag() {
            self.layout.modifier
        } else {
            None
        }
    }

    fn pitches(&self) -> [u32; 4] {
        let mut pitches = [0; 4];
        for (slot, plane) in pitches.iter_mut().zip(self.planes()) {
            *slot = plane.stride;
        }
        pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        let mut handles = [None; 4];
        for (slot, plane) in handles.iter_mut().zip(self.planes()) {
            *slot = NonZeroU32::new(plane.handle).map(buffer::Handle::from);
        }
        handles
    }

    fn offsets(&self) -> [u32; 4] {
        let mut offsets = [0; 4];
        if !self.legacy {
            for (slot, plane) in offsets.iter_mut().zip(self.planes()) {
                *slot = plane.offset;
            }
        }
        offsets
    }
}

/// Kernel side of framebuffer management.
pub trait FramebufferDevice: Clone {
    fn create_framebuffer(&self, planes: FramebufferPlanes<'_>) -> io::Result<framebuffer::Handle>;

    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()>;
}

impl FramebufferDevice for DrmDeviceFd {
    fn create_framebuffer(&self, planes: FramebufferPlanes<'_>) -> io::Result<framebuffer::Handle> {
        let flags = if planes.modifier().is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        self.add_planar_framebuffer(&planes, flags)
    }

    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()> {
        ControlDevice::destroy_framebuffer(self, framebuffer)
    }
}

/// A kernel framebuffer, removed when the record is dropped.
#[derive(Debug)]
pub struct FramebufferRecord<D: FramebufferDevice> {
    device: D,
    handle: framebuffer::Handle,
}

impl<D: FramebufferDevice> FramebufferRecord<D> {
    pub fn handle(&self) -> framebuffer::Handle {
        self.handle
    }
}

impl<D: FramebufferDevice> Drop for FramebufferRecord<D> {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_framebuffer(self.handle) {
            tracing::warn!(framebuffer = ?self.handle, "failed to remove framebuffer: {err}");
        } else {
            tracing::trace!(framebuffer = ?self.handle, "removed framebuffer");
        }
    }
}

/// Framebuffer per buffer object, created on first use.
#[derive(Debug)]
pub struct FramebufferCache<D: FramebufferDevice> {
    device: D,
    records: HashMap<BufferKey, FramebufferRecord<D>>,
}

impl<D: FramebufferDevice> FramebufferCache<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            records: HashMap::new(),
        }
    }

    /// Framebuffer for `key`, creating it from `layout` on the first request.
    ///
    /// `layout` is only evaluated on a cache miss.
    pub fn get_or_create(
        &mut self,
        key: BufferKey,
        layout: impl FnOnce() -> BufferLayout,
    ) -> Result<framebuffer::Handle> {
        if let Some(record) = self.records.get(&key) {
            return Ok(record.handle());
        }

        let layout = layout();
        let handle = create(&self.device, &layout)?;
        tracing::debug!(
            ?key,
            framebuffer = ?handle,
            width = layout.width,
            height = layout.height,
            format = ?layout.format,
            modifier = ?layout.modifier,
            "created framebuffer"
        );
        self.records.insert(
            key,
            FramebufferRecord {
                device: self.device.clone(),
                handle,
            },
        );
        Ok(handle)
    }

    pub fn get(&self, key: BufferKey) -> Option<framebuffer::Handle> {
        self.records.get(&key).map(FramebufferRecord::handle)
    }

    /// The buffer behind `key` was destroyed: remove its framebuffer.
    pub fn buffer_destroyed(&mut self, key: BufferKey) {
        self.records.remove(&key);
    }

    /// Remove every framebuffer; for when the whole buffer pool goes away.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn create<D: FramebufferDevice>(device: &D, layout: &BufferLayout) -> Result<framebuffer::Handle> {
    if layout.modifier.is_some() && !layout.planes.is_empty() {
        let planes = layout.with_modifiers();
        let with_flag = planes.needs_modifier_flag();
        if with_flag {
            tracing::debug!(modifier = ?layout.modifier, "using modifier");
        }
        match device.create_framebuffer(planes) {
            Ok(handle) => return Ok(handle),
            Err(err) if with_flag => tracing::warn!("modifiers failed: {err}"),
            Err(err) => tracing::debug!("planar framebuffer failed, retrying single plane: {err}"),
        }
    }

    device
        .create_framebuffer(layout.single_plane())
        .map_err(DisplayError::FramebufferCreateFailed)
}
