//! One frame from the render target to the screen.
//!
//! Order per frame: draw, swap, lock the front buffer, look up its framebuffer, then
//! either mode-set (first frame) or flip and wait. The buffer that was on screen is
//! released only once the new one is known to be scanned out.

use std::io;

use smithay::{
    backend::drm::DrmDeviceFd,
    reexports::drm::control::{Device as ControlDevice, Mode, connector, crtc, framebuffer},
};

use super::{
    RenderTarget,
    flip::{FlipDevice, FlipEventSource, PageFlipSynchronizer},
    framebuffer::{BufferKey, BufferLayout, FramebufferCache, FramebufferDevice},
    surface::{self, BufferRing, GbmBuffer, GbmSurface},
};
use crate::{DisplayError, ErrorSlot, Result};

/// Everything the frame step needs from the kernel.
pub trait ScanoutDevice: FramebufferDevice + FlipDevice {
    type Mode: Copy;

    fn set_mode(
        &self,
        crtc: crtc::Handle,
        connector: connector::Handle,
        framebuffer: framebuffer::Handle,
        mode: Self::Mode,
    ) -> io::Result<()>;
}

impl ScanoutDevice for DrmDeviceFd {
    type Mode = Mode;

    fn set_mode(
        &self,
        crtc: crtc::Handle,
        connector: connector::Handle,
        framebuffer: framebuffer::Handle,
        mode: Mode,
    ) -> io::Result<()> {
        self.set_crtc(crtc, Some(framebuffer), (0, 0), &[connector], Some(mode))
    }
}

pub trait ScanoutBuffer {
    fn key(&self) -> BufferKey;

    fn layout(&self) -> BufferLayout;
}

impl ScanoutBuffer for GbmBuffer {
    fn key(&self) -> BufferKey {
        BufferKey::of(self)
    }

    fn layout(&self) -> BufferLayout {
        BufferLayout::of(self)
    }
}

/// Hands out the buffer the render target just finished.
pub trait FrontBufferSource {
    type Buffer: ScanoutBuffer;

    fn lock_front_buffer(&self) -> Result<Self::Buffer>;
}

impl FrontBufferSource for GbmSurface {
    type Buffer = GbmBuffer;

    fn lock_front_buffer(&self) -> Result<GbmBuffer> {
        surface::lock_front_buffer(self)
    }
}

enum ScanoutFailure {
    /// The kernel never took the buffer.
    NotQueued(DisplayError),
    /// A flip was queued but its completion was not observed.
    Queued(DisplayError),
}

pub struct FramePresenter<D: ScanoutDevice, B> {
    flip: PageFlipSynchronizer,
    ring: BufferRing<B>,
    /// Buffers of flips that were queued but never confirmed. The kernel may still
    /// scan them out, so they stay locked until teardown.
    unconfirmed: Vec<B>,
    framebuffers: FramebufferCache<D>,
    device: D,
    crtc: crtc::Handle,
    connector: connector::Handle,
    mode: D::Mode,
    mode_set: bool,
    frames_presented: u64,
    last_error: ErrorSlot,
}

impl<D: ScanoutDevice, B: ScanoutBuffer> FramePresenter<D, B> {
    pub fn new(device: D, crtc: crtc::Handle, connector: connector::Handle, mode: D::Mode) -> Self {
        Self {
            flip: PageFlipSynchronizer::new(),
            ring: BufferRing::new(),
            unconfirmed: Vec::new(),
            framebuffers: FramebufferCache::new(device.clone()),
            device,
            crtc,
            connector,
            mode,
            mode_set: false,
            frames_presented: 0,
            last_error: ErrorSlot::default(),
        }
    }

    /// Render one frame with `draw`, show it, and record any failure as the last error.
    pub fn present_frame<S, E, T, F>(
        &mut self,
        source: &S,
        events: &mut E,
        target: &mut T,
        draw: F,
    ) -> Result<()>
    where
        S: FrontBufferSource<Buffer = B>,
        E: FlipEventSource,
        T: RenderTarget,
        F: FnOnce(&mut T) -> Result<()>,
    {
        let result = self.present(source, events, target, draw);
        self.last_error.record(result)
    }

    fn present<S, E, T, F>(&mut self, source: &S, events: &mut E, target: &mut T, draw: F) -> Result<()>
    where
        S: FrontBufferSource<Buffer = B>,
        E: FlipEventSource,
        T: RenderTarget,
        F: FnOnce(&mut T) -> Result<()>,
    {
        draw(target)?;
        target.swap_buffers()?;

        let buffer = source.lock_front_buffer()?;
        // On failure `buffer` is dropped here, which hands it back to the surface.
        let fb = self
            .framebuffers
            .get_or_create(buffer.key(), || buffer.layout())?;
        self.ring.lock(buffer)?;

        match self.scan_out(fb, events) {
            Ok(()) => {}
            Err(ScanoutFailure::NotQueued(err)) => {
                self.ring.abandon();
                return Err(err);
            }
            Err(ScanoutFailure::Queued(err)) => {
                if let Some(buffer) = self.ring.abandon() {
                    self.unconfirmed.push(buffer);
                }
                tracing::warn!(
                    held = self.unconfirmed.len(),
                    "flip outcome unknown, keeping its buffer locked"
                );
                return Err(err);
            }
        }

        // The buffer that was on screen until now is free again.
        drop(self.ring.present());
        self.frames_presented += 1;
        Ok(())
    }

    fn scan_out<E: FlipEventSource>(
        &mut self,
        fb: framebuffer::Handle,
        events: &mut E,
    ) -> std::result::Result<(), ScanoutFailure> {
        if !self.mode_set {
            self.device
                .set_mode(self.crtc, self.connector, fb, self.mode)
                .map_err(|err| ScanoutFailure::NotQueued(DisplayError::ModeSetFailed(err)))?;
            self.mode_set = true;
            tracing::info!(crtc = ?self.crtc, "mode set");
            return Ok(());
        }

        self.flip.reset();
        self.flip
            .submit(&self.device, self.crtc, fb)
            .map_err(ScanoutFailure::NotQueued)?;
        self.flip
            .wait(&self.device, events)
            .map_err(ScanoutFailure::Queued)
    }

    /// Whether the CRTC has been mode-set by this session.
    pub fn mode_set(&self) -> bool {
        self.mode_set
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.message()
    }

    pub fn on_screen(&self) -> Option<&B> {
        self.ring.on_screen()
    }

    /// Release every buffer, then every framebuffer.
    pub fn clear(&mut self) {
        self.ring.clear();
        self.unconfirmed.clear();
        self.framebuffers.clear();
    }
}
