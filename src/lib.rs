pub mod backend;
pub mod clock;
pub mod config;
pub mod errors;

pub use backend::kms::{KmsDisplay, RenderTarget};
pub use clock::FrameClock;
pub use config::DisplayConfig;
pub use errors::{DisplayError, ErrorKind, ErrorSlot, Result};
