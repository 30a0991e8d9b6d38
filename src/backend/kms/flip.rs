//! Page-flip submission and completion.
//!
//! A flip is queued with an event requested, then the caller blocks until the kernel
//! reports completion for the target CRTC. Readable input on stdin aborts the wait.

use std::io;

use smithay::{
    backend::drm::DrmDeviceFd,
    reexports::{
        calloop::{EventLoop, Interest, Mode, PostAction, generic::Generic},
        drm::control::{Device as ControlDevice, Event, PageFlipFlags, crtc, framebuffer},
    },
};

use crate::{DisplayError, ErrorKind, Result};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FlipState {
    #[default]
    Idle,
    Pending { crtc: crtc::Handle },
    Completed,
    Failed(ErrorKind),
}

/// Kernel side of a page flip.
pub trait FlipDevice {
    fn queue_flip(&self, crtc: crtc::Handle, framebuffer: framebuffer::Handle) -> io::Result<()>;

    /// Drain pending kernel events, returning the CRTCs whose flips completed.
    fn read_flip_events(&self) -> io::Result<Vec<crtc::Handle>>;
}

impl FlipDevice for DrmDeviceFd {
    fn queue_flip(&self, crtc: crtc::Handle, framebuffer: framebuffer::Handle) -> io::Result<()> {
        self.page_flip(crtc, framebuffer, PageFlipFlags::EVENT, None)
    }

    fn read_flip_events(&self) -> io::Result<Vec<crtc::Handle>> {
        let completed = self
            .receive_events()?
            .filter_map(|event| match event {
                Event::PageFlip(flip) => Some(flip.crtc),
                _ => None,
            })
            .collect();
        Ok(completed)
    }
}

/// What ended a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Device,
    Input,
}

/// Blocks until the device or the operator has something to say.
pub trait FlipEventSource {
    /// Input wins when both are ready. Failures are [`DisplayError::WaitError`].
    fn wait_ready(&mut self) -> Result<Wakeup>;
}

#[derive(Debug, Default)]
pub struct PageFlipSynchronizer {
    state: FlipState,
}

impl PageFlipSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FlipState {
        self.state
    }

    pub fn submit<D: FlipDevice>(
        &mut self,
        device: &D,
        crtc: crtc::Handle,
        framebuffer: framebuffer::Handle,
    ) -> Result<()> {
        match device.queue_flip(crtc, framebuffer) {
            Ok(()) => {
                tracing::trace!(?crtc, ?framebuffer, "queued page flip");
                self.state = FlipState::Pending { crtc };
                Ok(())
            }
            Err(err) => {
                let err = DisplayError::FlipRejected(err);
                self.state = FlipState::Failed(err.kind());
                Err(err)
            }
        }
    }

    /// Block until the pending flip completes. Returns at once when nothing is pending.
    pub fn wait<D: FlipDevice, E: FlipEventSource>(&mut self, device: &D, events: &mut E) -> Result<()> {
        let FlipState::Pending { crtc } = self.state else {
            return Ok(());
        };

        loop {
            let wakeup = match events.wait_ready() {
                Ok(wakeup) => wakeup,
                Err(err) => {
                    self.state = FlipState::Failed(err.kind());
                    return Err(err);
                }
            };

            match wakeup {
                Wakeup::Input => {
                    tracing::info!("input on stdin, aborting flip wait");
                    self.state = FlipState::Failed(ErrorKind::WaitInterrupted);
                    return Err(DisplayError::UserInterrupted);
                }
                Wakeup::Device => {
                    let completed = device.read_flip_events().map_err(|err| {
                        self.state = FlipState::Failed(ErrorKind::WaitFailed);
                        DisplayError::WaitError(format!("failed to read drm events: {err}"))
                    })?;
                    if completed.contains(&crtc) {
                        tracing::trace!(?crtc, "page flip completed");
                        self.state = FlipState::Completed;
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = FlipState::Idle;
    }
}

#[derive(Debug, Default)]
struct Readiness {
    device: bool,
    input: bool,
}

/// Waits on the device fd and stdin through a calloop event loop.
pub struct CalloopFlipWaiter {
    event_loop: EventLoop<'static, Readiness>,
    watches_input: bool,
}

impl std::fmt::Debug for CalloopFlipWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalloopFlipWaiter")
            .field("watches_input", &self.watches_input)
            .finish_non_exhaustive()
    }
}

impl CalloopFlipWaiter {
    pub fn new(device: &DrmDeviceFd) -> Result<Self> {
        let event_loop: EventLoop<'static, Readiness> = EventLoop::try_new()
            .map_err(|err| DisplayError::WaitError(format!("failed to create event loop: {err}")))?;
        let handle = event_loop.handle();

        handle
            .insert_source(
                Generic::new(device.clone(), Interest::READ, Mode::Level),
                |_, _, ready: &mut Readiness| {
                    ready.device = true;
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| {
                DisplayError::WaitError(format!("failed to watch drm device: {}", err.error))
            })?;

        let watches_input = match handle.insert_source(
            Generic::new(io::stdin(), Interest::READ, Mode::Level),
            |_, _, ready: &mut Readiness| {
                ready.input = true;
                Ok(PostAction::Continue)
            },
        ) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("stdin cannot be watched, flips can't be interrupted: {}", err.error);
                false
            }
        };

        Ok(Self {
            event_loop,
            watches_input,
        })
    }

    pub fn watches_input(&self) -> bool {
        self.watches_input
    }
}

impl FlipEventSource for CalloopFlipWaiter {
    fn wait_ready(&mut self) -> Result<Wakeup> {
        loop {
            let mut ready = Readiness::default();
            self.event_loop
                .dispatch(None, &mut ready)
                .map_err(|err| DisplayError::WaitError(err.to_string()))?;

            if ready.input {
                return Ok(Wakeup::Input);
            }
            if ready.device {
                return Ok(Wakeup::Device);
            }
        }
    }
}
