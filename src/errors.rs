use std::{io, path::PathBuf};

use smithay::backend::allocator::Modifier;

/// Broad classification of a [`DisplayError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A device, connector, mode or CRTC could not be found.
    ResourceNotFound,
    /// The hardware or driver lacks a requested capability.
    CapabilityUnsupported,
    /// An ioctl or allocator call was rejected by the kernel/driver.
    KernelRejected,
    /// The flip wait was interrupted by the operator.
    WaitInterrupted,
    /// The flip wait itself failed.
    WaitFailed,
    /// The caller broke a usage contract or supplied bad configuration.
    Usage,
    /// An external collaborator (draw step, buffer swap) failed.
    External,
}

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("no drm device found")]
    NoDeviceFound,

    #[error("{} does not look like a modeset device", path.display())]
    NotAModesetDevice { path: PathBuf },

    #[error("no connected connector")]
    NoConnectedOutput,

    #[error("could not find mode")]
    NoModeAvailable,

    #[error("no crtc found")]
    NoCrtcAvailable,

    #[error("modifiers requested but support isn't available (modifier {0:?})")]
    UnsupportedModifier(Modifier),

    #[error("{operation} failed: {source}")]
    Kernel {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to create fb: {0}")]
    FramebufferCreateFailed(#[source] io::Error),

    #[error("failed to set mode: {0}")]
    ModeSetFailed(#[source] io::Error),

    #[error("failed to queue page flip: {0}")]
    FlipRejected(#[source] io::Error),

    #[error("select error: {0}")]
    WaitError(String),

    #[error("user interrupted")]
    UserInterrupted,

    #[error("a buffer is already locked for presentation")]
    BufferAlreadyLocked,

    #[error("invalid frame rate {0}")]
    InvalidFrameRate(f64),

    #[error("config error: {0}")]
    Config(String),

    #[error("render failed: {0}")]
    Render(String),
}

impl DisplayError {
    pub fn kernel(operation: &'static str, source: io::Error) -> Self {
        DisplayError::Kernel { operation, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DisplayError::NoDeviceFound
            | DisplayError::NoConnectedOutput
            | DisplayError::NoModeAvailable
            | DisplayError::NoCrtcAvailable => ErrorKind::ResourceNotFound,
            DisplayError::NotAModesetDevice { .. } | DisplayError::UnsupportedModifier(_) => {
                ErrorKind::CapabilityUnsupported
            }
            DisplayError::Kernel { .. }
            | DisplayError::FramebufferCreateFailed(_)
            | DisplayError::ModeSetFailed(_)
            | DisplayError::FlipRejected(_) => ErrorKind::KernelRejected,
            DisplayError::UserInterrupted => ErrorKind::WaitInterrupted,
            DisplayError::WaitError(_) => ErrorKind::WaitFailed,
            DisplayError::BufferAlreadyLocked
            | DisplayError::InvalidFrameRate(_)
            | DisplayError::Config(_) => ErrorKind::Usage,
            DisplayError::Render(_) => ErrorKind::External,
        }
    }
}

pub type Result<T> = std::result::Result<T, DisplayError>;

/// Single last-error message, overwritten by every failing call that reports into it.
///
/// Owned by a session and only touched from the thread driving that session.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    message: Option<String>,
}

impl ErrorSlot {
    /// Record the error of `result`, if any, and hand the result back unchanged.
    pub fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.message = Some(err.to_string());
        }
        result
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn clear(&mut self) {
        self.message = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(DisplayError::NoCrtcAvailable.kind(), ErrorKind::ResourceNotFound);
        assert_eq!(
            DisplayError::UnsupportedModifier(Modifier::from(0x0100_0000_0000_0001_u64)).kind(),
            ErrorKind::CapabilityUnsupported
        );
        assert_eq!(
            DisplayError::FlipRejected(io::Error::from_raw_os_error(libc::EBUSY)).kind(),
            ErrorKind::KernelRejected
        );
        assert_eq!(DisplayError::UserInterrupted.kind(), ErrorKind::WaitInterrupted);
        assert_eq!(
            DisplayError::WaitError("boom".into()).kind(),
            ErrorKind::WaitFailed
        );
    }

    #[test]
    fn kernel_errors_carry_os_text() {
        let err = DisplayError::FramebufferCreateFailed(io::Error::from_raw_os_error(libc::EINVAL));
        let message = err.to_string();
        assert!(message.starts_with("failed to create fb: "));
        assert!(message.contains("Invalid argument"), "{message}");
    }

    #[test]
    fn slot_keeps_only_the_latest_failure() {
        let mut slot = ErrorSlot::default();
        assert!(slot.message().is_none());

        let _ = slot.record::<()>(Err(DisplayError::NoDeviceFound));
        assert_eq!(slot.message(), Some("no drm device found"));

        let ok = slot.record(Ok(5));
        assert_eq!(ok.ok(), Some(5));
        assert_eq!(slot.message(), Some("no drm device found"));

        let _ = slot.record::<()>(Err(DisplayError::UserInterrupted));
        assert_eq!(slot.message(), Some("user interrupted"));

        slot.clear();
        assert!(slot.message().is_none());
    }
}
