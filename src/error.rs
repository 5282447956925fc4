//! Error types for picloader.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for picloader operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure classes, what an operator has to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration file or command line.
    Config,
    /// The firmware file itself.
    Image,
    /// Port, wiring, or a device that never answered.
    Connection,
    /// The device answered but rejected or corrupted the data.
    Device,
    /// Aborted by the user.
    Cancelled,
}

/// Error type for picloader operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No firmware file was given on the command line or in the configuration.
    #[error("No firmware file specified")]
    NoFirmware,

    /// The firmware file could not be read.
    #[error("Cannot read firmware file {}: {source}", .path.display())]
    ImageRead { path: PathBuf, source: io::Error },

    /// Malformed Intel HEX record.
    #[error("Invalid HEX record at line {line}: {reason}")]
    ImageParse { line: usize, reason: String },

    /// Firmware data does not fit below the bootloader.
    #[error("Firmware address {address:#06x} is outside the flashable range (limit {limit:#06x})")]
    ImageOutOfRange { address: u32, limit: u32 },

    /// The application did not answer the reset sequence.
    #[error("Device did not acknowledge the reset sequence after {attempts} attempt(s)")]
    ResetFailed { attempts: u32 },

    /// Nobody answered the identify request.
    #[error("Bootloader not detected after {attempts} sync attempt(s)")]
    SyncFailed { attempts: u32 },

    /// Type id reported by the bootloader is not in the device database.
    #[error("Unknown device type id {0:#04x}")]
    UnknownDevice(u8),

    /// Configured device name is not in the device database.
    #[error("Unknown device {0:?}")]
    UnknownDeviceName(String),

    /// The bootloader reports a different device than configured.
    #[error("Expected {expected} but the bootloader reports type id {found:#04x}")]
    DeviceMismatch { expected: String, found: u8 },

    /// Device family the protocol engine does not drive.
    #[error("Unsupported device family {0}")]
    UnsupportedDevice(String),

    /// Page write retries exhausted.
    #[error("Writing page at {address:#06x} failed after {attempts} attempt(s)")]
    PageWriteFailed { address: u32, attempts: u32 },

    /// Page read-back retries exhausted.
    #[error("Reading back page at {address:#06x} failed after {attempts} attempt(s)")]
    PageReadFailed { address: u32, attempts: u32 },

    /// Read-back content differs from what was written.
    #[error(
        "Verify failed in page {address:#06x} at offset {offset}: expected {expected:#04x}, found {found:#04x}"
    )]
    VerifyMismatch {
        address: u32,
        offset: usize,
        expected: u8,
        found: u8,
    },

    /// Cancellation was requested between two pages.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::NoFirmware => ErrorCategory::Config,
            Error::ImageRead { .. } | Error::ImageParse { .. } | Error::ImageOutOfRange { .. } => {
                ErrorCategory::Image
            }
            Error::Io(_)
            | Error::Serial(_)
            | Error::ResetFailed { .. }
            | Error::SyncFailed { .. }
            | Error::PageReadFailed { .. } => ErrorCategory::Connection,
            Error::UnknownDevice(_)
            | Error::UnknownDeviceName(_)
            | Error::DeviceMismatch { .. }
            | Error::UnsupportedDevice(_)
            | Error::PageWriteFailed { .. }
            | Error::VerifyMismatch { .. } => ErrorCategory::Device,
            Error::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Process exit status, distinct per failure kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::UnknownDeviceName(_) => 1,
            Error::Io(_) | Error::Serial(_) => 2,
            Error::ResetFailed { .. } => 3,
            Error::SyncFailed { .. }
            | Error::UnknownDevice(_)
            | Error::DeviceMismatch { .. }
            | Error::UnsupportedDevice(_) => 4,
            Error::NoFirmware => 5,
            Error::ImageRead { .. } | Error::ImageParse { .. } | Error::ImageOutOfRange { .. } => 6,
            Error::PageWriteFailed { .. } | Error::PageReadFailed { .. } => 7,
            Error::VerifyMismatch { .. } => 8,
            Error::Cancelled => 130,
        }
    }
}
