//! Tiny Bootloader flasher for PIC16 microcontrollers.

pub mod bootloader;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod image;
pub mod progress;
pub mod protocol;
pub mod transport;

pub use self::bootloader::{Bootloader, ResetStrategy};
pub use self::config::Config;
pub use self::device::{Chip, ChipDB};
pub use self::error::{Error, ErrorCategory, Result};
pub use self::flashing::{CancelToken, FlashResult, Session, SessionState};
pub use self::image::FirmwareImage;
pub use self::protocol::{Command, Response};
pub use self::transport::Transport;
