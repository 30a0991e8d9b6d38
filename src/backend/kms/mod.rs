//! Direct KMS scanout session: one connector, one CRTC, one GBM render surface.
//!
//! [`KmsDisplay::initialize`] resolves everything needed to put pixels on screen and
//! [`KmsDisplay::present_frame`] shows one rendered frame, synchronized to the
//! display's page flips. The session is driven from a single thread.

pub mod device;
pub mod flip;
pub mod framebuffer;
pub mod output;
pub mod present;
pub mod surface;

use std::path::Path;

use smithay::{
    backend::{
        allocator::{Fourcc, Modifier},
        drm::DrmDeviceFd,
    },
    reexports::{
        drm::control::{Device as ControlDevice, connector, crtc, from_u32},
        gbm::Device as GbmDevice,
    },
};

use self::{
    device::KmsDevice,
    flip::CalloopFlipWaiter,
    output::{CrtcBinding, OutputMode, ResourceSnapshot},
    present::FramePresenter,
    surface::{GbmBuffer, GbmSurface},
};
use crate::{DisplayError, Result, config::DisplayConfig};

/// Something that finishes a frame into the session's GBM surface, typically an
/// EGL window surface created on top of [`KmsDisplay::gbm_surface`].
pub trait RenderTarget {
    fn swap_buffers(&mut self) -> Result<()>;
}

/// CRTC configuration found at startup, put back on shutdown.
#[derive(Debug)]
struct SavedCrtc {
    crtc: crtc::Handle,
    connector: connector::Handle,
    info: crtc::Info,
}

// Fields drop in declaration order, which is the teardown order: waiter, buffers and
// framebuffers, surface, gbm device, then the drm fd itself.
pub struct KmsDisplay {
    waiter: CalloopFlipWaiter,
    presenter: FramePresenter<DrmDeviceFd, GbmBuffer>,
    surface: GbmSurface,
    gbm: GbmDevice<DrmDeviceFd>,
    saved_crtc: Option<SavedCrtc>,
    device: KmsDevice,

    mode: OutputMode,
    binding: CrtcBinding,
    surface_size: (u32, u32),
    format: Fourcc,
    modifier: Modifier,
}

impl std::fmt::Debug for KmsDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsDisplay")
            .field("device", &self.device.path())
            .field("mode", &self.mode)
            .field("binding", &self.binding)
            .field("surface_size", &self.surface_size)
            .field("format", &self.format)
            .field("modifier", &self.modifier)
            .field("frames_presented", &self.presenter.frames_presented())
            .finish_non_exhaustive()
    }
}

impl KmsDisplay {
    pub fn initialize(config: &DisplayConfig) -> Result<Self> {
        let (device, resources) = device::open_device(config.device.as_deref())?;
        let snapshot = ResourceSnapshot::read(device.fd(), &resources);
        let selection = output::resolve_output(&snapshot, config.mode.as_ref())?;
        let binding = selection.binding;

        let (Some(connector), Some(crtc)) = (
            from_u32::<connector::Handle>(binding.connector_id),
            from_u32::<crtc::Handle>(binding.crtc_id),
        ) else {
            return Err(DisplayError::NoCrtcAvailable);
        };
        let drm_mode = selection.mode.kernel.ok_or(DisplayError::NoModeAvailable)?;

        let saved_crtc = match device.fd().get_crtc(crtc) {
            Ok(info) => Some(SavedCrtc {
                crtc,
                connector,
                info,
            }),
            Err(err) => {
                tracing::warn!(?crtc, "failed to read current crtc state, not restoring it: {err}");
                None
            }
        };

        let gbm = GbmDevice::new(device.fd().clone())
            .map_err(|err| DisplayError::kernel("gbm_create_device", err))?;
        let surface_size = surface::surface_size(&selection.mode, config.size);
        let surface =
            surface::allocate_surface(&gbm, surface_size, config.format, config.modifier)?;
        let presenter = FramePresenter::new(device.fd().clone(), crtc, connector, drm_mode);
        let waiter = CalloopFlipWaiter::new(device.fd())?;

        tracing::info!(
            device = %device.path().display(),
            width = surface_size.0,
            height = surface_size.1,
            format = ?config.format,
            modifier = ?config.modifier,
            "display initialized"
        );

        Ok(Self {
            waiter,
            presenter,
            surface,
            gbm,
            saved_crtc,
            device,
            mode: selection.mode,
            binding,
            surface_size,
            format: config.format,
            modifier: config.modifier,
        })
    }

    /// Render one frame with `draw` and put it on screen.
    ///
    /// Blocks until the flip completes. The first frame mode-sets the CRTC instead.
    pub fn present_frame<T, F>(&mut self, target: &mut T, draw: F) -> Result<()>
    where
        T: RenderTarget,
        F: FnOnce(&mut T) -> Result<()>,
    {
        self.presenter
            .present_frame(&self.surface, &mut self.waiter, target, draw)
    }

    /// Tear the session down. Equivalent to dropping it.
    pub fn shutdown(self) {
        tracing::debug!(frames = self.presenter.frames_presented(), "shutting down display");
    }

    pub fn mode(&self) -> &OutputMode {
        &self.mode
    }

    pub fn binding(&self) -> &CrtcBinding {
        &self.binding
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    pub fn gbm_device(&self) -> &GbmDevice<DrmDeviceFd> {
        &self.gbm
    }

    pub fn gbm_surface(&self) -> &GbmSurface {
        &self.surface
    }

    pub fn device_path(&self) -> &Path {
        self.device.path()
    }

    pub fn frames_presented(&self) -> u64 {
        self.presenter.frames_presented()
    }

    /// Message of the most recent failed [`present_frame`](Self::present_frame).
    pub fn last_error(&self) -> Option<&str> {
        self.presenter.last_error()
    }
}

impl Drop for KmsDisplay {
    fn drop(&mut self) {
        // Put the previous scanout back before our framebuffers disappear under it.
        if self.presenter.mode_set()
            && let Some(saved) = self.saved_crtc.take()
        {
            let info = &saved.info;
            let connectors: &[connector::Handle] = if info.mode().is_some() {
                &[saved.connector]
            } else {
                &[]
            };
            match self.device.fd().set_crtc(
                saved.crtc,
                info.framebuffer(),
                info.position(),
                connectors,
                info.mode(),
            ) {
                Ok(()) => tracing::debug!(crtc = ?saved.crtc, "restored previous crtc state"),
                Err(err) => tracing::warn!(crtc = ?saved.crtc, "failed to restore crtc: {err}"),
            }
        }

        self.presenter.clear();
    }
}

/// Open a device and read its connectors without touching the display.
pub fn read_outputs(device: Option<&Path>) -> Result<(KmsDevice, ResourceSnapshot)> {
    let (device, resources) = device::open_device(device)?;
    let snapshot = ResourceSnapshot::read(device.fd(), &resources);
    Ok((device, snapshot))
}
