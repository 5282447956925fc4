//! Chip flashing logic.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bootloader::{resolve_chip, Bootloader, ResetStrategy};
use crate::config::Config;
use crate::device::{Chip, ChipDB};
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::progress::{Progress, ProgressObserver};
use crate::transport::Transport;

/// Where a session currently is. `Completed`, `Failed` and `Cancelled` are
/// terminal, a new session is needed to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resetting,
    Synchronizing,
    /// Writing the page with this 0-based index
    Flashing(usize),
    /// Reading back the page with this 0-based index
    Verifying(usize),
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of a flashing run.
#[derive(Debug)]
pub enum FlashResult {
    Success {
        pages_written: usize,
        bytes_written: usize,
    },
    Failed {
        /// Index of the failing page, `None` when no page was attempted
        page: Option<usize>,
        pages_written: usize,
        reason: Error,
    },
    Cancelled {
        pages_written: usize,
    },
}

impl FlashResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FlashResult::Success { .. })
    }

    pub fn pages_written(&self) -> usize {
        match self {
            FlashResult::Success { pages_written, .. }
            | FlashResult::Failed { pages_written, .. }
            | FlashResult::Cancelled { pages_written } => *pages_written,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            FlashResult::Success { .. } => 0,
            FlashResult::Failed { reason, .. } => reason.exit_code(),
            FlashResult::Cancelled { .. } => Error::Cancelled.exit_code(),
        }
    }

    /// Collapse into a `Result`, cancellation becomes `Error::Cancelled`.
    pub fn into_result(self) -> Result<usize> {
        match self {
            FlashResult::Success { pages_written, .. } => Ok(pages_written),
            FlashResult::Failed { reason, .. } => Err(reason),
            FlashResult::Cancelled { .. } => Err(Error::Cancelled),
        }
    }
}

/// Cancellation request shared with a signal handler or another thread.
///
/// Checked between pages only, a frame is never cut in half.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Apply what the bootloader needs to an image before it is paged.
pub fn prepare_image(image: &FirmwareImage, chip: &Chip, relocate: bool) -> Result<FirmwareImage> {
    chip.ensure_supported()?;
    let program = image.program_memory(chip)?;
    if program.is_empty() {
        log::warn!("No program memory data in the image, nothing to flash");
        return Ok(program);
    }
    if relocate {
        Ok(program.relocate_reset_vector(chip))
    } else {
        Ok(program)
    }
}

/// One flashing attempt, owning the port for its whole lifetime.
pub struct Session<T: Transport> {
    bootloader: Bootloader<T>,
    db: ChipDB,
    /// Chip named in the configuration
    chip: Option<Chip>,
    reset: ResetStrategy,
    probe_first: bool,
    verify: bool,
    relocate: bool,

    state: SessionState,
    pages_written: usize,
    bytes_written: usize,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: &Config) -> Result<Self> {
        let db = ChipDB::load()?;
        let chip = config
            .device
            .name
            .as_deref()
            .map(|name| db.find_by_name(name))
            .transpose()?;
        Ok(Session {
            bootloader: Bootloader::new(transport, config.timeouts.clone(), config.retries.clone()),
            db,
            chip,
            reset: config.reset_strategy()?,
            probe_first: config.reset.probe_first,
            verify: config.flash.verify,
            relocate: config.flash.relocate_reset_vector,
            state: SessionState::Idle,
            pages_written: 0,
            bytes_written: 0,
        })
    }

    /// Flash for `chip` instead of a device database entry.
    pub fn with_chip(mut self, chip: Chip) -> Self {
        self.chip = Some(chip);
        self
    }

    /// Drive DTR resets on a separate port.
    pub fn with_reset_line(mut self, line: Box<dyn Transport>) -> Self {
        self.bootloader = self.bootloader.with_reset_line(line);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pages_written(&self) -> usize {
        self.pages_written
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Hand the port back, whatever the outcome was.
    pub fn into_transport(self) -> T {
        self.bootloader.into_transport()
    }

    /// Reset the device and find out what it is.
    pub fn detect(&mut self) -> Result<Chip> {
        match self.connect() {
            Ok(chip) => {
                self.state = SessionState::Completed;
                Ok(chip)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Only run the reset procedure.
    pub fn reset(&mut self) -> Result<()> {
        self.state = SessionState::Resetting;
        let ret = self.bootloader.reset_device(&self.reset);
        self.state = if ret.is_ok() {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        ret
    }

    fn connect(&mut self) -> Result<Chip> {
        if self.probe_first && self.reset != ResetStrategy::None {
            self.state = SessionState::Synchronizing;
            if let Some(ready) = self.bootloader.probe()? {
                log::info!("Bootloader already active, skipping reset");
                return resolve_chip(&self.db, ready.device_id, self.chip.as_ref());
            }
        }
        self.state = SessionState::Resetting;
        self.bootloader.reset_device(&self.reset)?;

        self.state = SessionState::Synchronizing;
        log::info!("Connecting to bootloader...");
        self.bootloader.identify(&self.db, self.chip.as_ref())
    }

    fn fail(&mut self, page: Option<usize>, reason: Error) -> FlashResult {
        match page {
            Some(page) => log::error!("Flashing failed at page {}: {}", page, reason),
            None => log::error!("Flashing failed: {}", reason),
        }
        self.state = SessionState::Failed;
        FlashResult::Failed {
            page,
            pages_written: self.pages_written,
            reason,
        }
    }

    fn cancelled(&mut self) -> FlashResult {
        log::warn!("Cancelled after {} page(s)", self.pages_written);
        self.state = SessionState::Cancelled;
        FlashResult::Cancelled {
            pages_written: self.pages_written,
        }
    }

    /// Write `image` page by page in ascending address order.
    ///
    /// Stops at the first page that fails after its retries, nothing after
    /// it is sent.
    pub fn run(
        &mut self,
        image: &FirmwareImage,
        observer: &mut dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> FlashResult {
        self.pages_written = 0;
        self.bytes_written = 0;

        if image.is_empty() {
            log::info!("Firmware image is empty, nothing to flash");
            self.state = SessionState::Completed;
            return FlashResult::Success {
                pages_written: 0,
                bytes_written: 0,
            };
        }

        // Known device: reject the image before touching the port
        let prepared = match self.chip.as_ref().map(|c| prepare_image(image, c, self.relocate)) {
            Some(Err(e)) => return self.fail(None, e),
            Some(Ok(prepared)) => Some(prepared),
            None => None,
        };
        if cancel.is_cancelled() {
            return self.cancelled();
        }

        let chip = match self.connect() {
            Ok(chip) => chip,
            Err(e) => return self.fail(None, e),
        };
        let prepared = match prepared {
            Some(prepared) => prepared,
            None => match prepare_image(image, &chip, self.relocate) {
                Ok(prepared) => prepared,
                Err(e) => return self.fail(None, e),
            },
        };

        let pages = prepared.pages(chip.page_bytes());
        let total_pages = pages.len();
        let image_bytes_total = prepared.len();
        let mut image_bytes_done = 0;
        log::info!(
            "Flashing {} bytes in {} page(s) of {} bytes...",
            image_bytes_total,
            total_pages,
            chip.page_bytes()
        );

        for (i, page) in pages.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.cancelled();
            }

            self.state = SessionState::Flashing(i);
            log::debug!("Writing page {}/{} at {:#06x}", i + 1, total_pages, page.address);
            if let Err(e) = self.bootloader.write_page(page.address, &page.data) {
                return self.fail(Some(i), e);
            }
            if self.verify {
                self.state = SessionState::Verifying(i);
                if let Err(e) = self.bootloader.verify_page(page.address, &page.data) {
                    return self.fail(Some(i), e);
                }
            }

            self.pages_written += 1;
            self.bytes_written += page.data.len();
            image_bytes_done += page.used;
            observer.on_progress(&Progress {
                page: i + 1,
                total_pages,
                address: page.address,
                bytes_written: self.bytes_written,
                image_bytes_done,
                image_bytes_total,
            });
        }

        self.state = SessionState::Completed;
        log::info!(
            "Flash complete: {} page(s), {} bytes written",
            self.pages_written,
            self.bytes_written
        );
        FlashResult::Success {
            pages_written: self.pages_written,
            bytes_written: self.bytes_written,
        }
    }
}
