use std::io;

use smithay::{
    backend::{
        allocator::{Fourcc, Modifier},
        drm::DrmDeviceFd,
    },
    reexports::gbm::{BufferObject, BufferObjectFlags, Device as GbmDevice, Surface},
};

use super::output::OutputMode;
use crate::{DisplayError, Result};

pub type GbmSurface = Surface<()>;
pub type GbmBuffer = BufferObject<()>;

/// Creates scanout-capable render surfaces.
pub trait SurfaceAllocator {
    type Surface;

    fn supports_modifiers(&self) -> bool;

    fn create_with_modifiers(
        &self,
        size: (u32, u32),
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> io::Result<Self::Surface>;

    /// Implicit layout, scanout and rendering usage.
    fn create_legacy(&self, size: (u32, u32), format: Fourcc) -> io::Result<Self::Surface>;
}

impl SurfaceAllocator for GbmDevice<DrmDeviceFd> {
    type Surface = GbmSurface;

    // gbm reports a backend without modifier support as a creation failure.
    fn supports_modifiers(&self) -> bool {
        true
    }

    fn create_with_modifiers(
        &self,
        (width, height): (u32, u32),
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> io::Result<GbmSurface> {
        self.create_surface_with_modifiers(width, height, format, modifiers.iter().copied())
    }

    fn create_legacy(&self, (width, height): (u32, u32), format: Fourcc) -> io::Result<GbmSurface> {
        self.create_surface(
            width,
            height,
            format,
            BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
        )
    }
}

/// Surface size: the override where it is non-zero, otherwise the mode's size.
pub fn surface_size(mode: &OutputMode, size_override: Option<(u32, u32)>) -> (u32, u32) {
    let (mode_w, mode_h) = (u32::from(mode.width), u32::from(mode.height));
    match size_override {
        Some((w, h)) => (
            if w != 0 { w } else { mode_w },
            if h != 0 { h } else { mode_h },
        ),
        None => (mode_w, mode_h),
    }
}

/// Create a render surface in `format` with `modifier`.
///
/// A non-linear modifier is only available through the modifier-aware path; a linear
/// request falls back to implicit-layout allocation.
pub fn allocate_surface<A: SurfaceAllocator>(
    allocator: &A,
    size: (u32, u32),
    format: Fourcc,
    modifier: Modifier,
) -> Result<A::Surface> {
    if allocator.supports_modifiers() {
        match allocator.create_with_modifiers(size, format, &[modifier]) {
            Ok(surface) => {
                tracing::debug!(?size, ?format, ?modifier, "created surface with modifiers");
                return Ok(surface);
            }
            Err(err) => tracing::debug!(?modifier, "modifier-aware surface creation failed: {err}"),
        }
    }

    if modifier != Modifier::Linear {
        return Err(DisplayError::UnsupportedModifier(modifier));
    }

    let surface = allocator
        .create_legacy(size, format)
        .map_err(|err| DisplayError::kernel("gbm_surface_create", err))?;
    tracing::debug!(?size, ?format, "created surface without modifiers");
    Ok(surface)
}

/// Take the buffer that rendering just finished.
pub fn lock_front_buffer(surface: &GbmSurface) -> Result<GbmBuffer> {
    // Safety: only called after the render target swapped buffers on this surface, so
    // a front buffer exists and nothing else locks from it concurrently.
    unsafe { surface.lock_front_buffer() }.map_err(|err| {
        DisplayError::kernel(
            "gbm_surface_lock_front_buffer",
            io::Error::other(format!("{err:?}")),
        )
    })
}

/// Buffers between the render surface and the screen.
///
/// At most one buffer is locked for the frame in flight and one is on screen.
/// Dropping a buffer hands it back to the surface.
#[derive(Debug)]
pub struct BufferRing<B> {
    locked: Option<B>,
    on_screen: Option<B>,
}

impl<B> Default for BufferRing<B> {
    fn default() -> Self {
        Self {
            locked: None,
            on_screen: None,
        }
    }
}

impl<B> BufferRing<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&mut self, buffer: B) -> Result<&B> {
        if self.locked.is_some() {
            return Err(DisplayError::BufferAlreadyLocked);
        }
        Ok(self.locked.insert(buffer))
    }

    pub fn locked(&self) -> Option<&B> {
        self.locked.as_ref()
    }

    pub fn on_screen(&self) -> Option<&B> {
        self.on_screen.as_ref()
    }

    /// Move the locked buffer on screen, returning the one it replaces.
    pub fn present(&mut self) -> Option<B> {
        let next = self.locked.take()?;
        self.on_screen.replace(next)
    }

    /// Give the locked buffer back without showing it.
    pub fn abandon(&mut self) -> Option<B> {
        self.locked.take()
    }

    pub fn clear(&mut self) {
        self.locked = None;
        self.on_screen = None;
    }
}
