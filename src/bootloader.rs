//! Tiny Bootloader protocol engine.
//!
//! Turns page level intents into framed, checksummed exchanges and owns the
//! retry policy: transient failures (timeouts, NAKs, corrupted responses) are
//! retried here up to the configured budget and then surfaced unchanged.
//! Transport I/O errors are never retried.
use std::thread::sleep;
use std::time::Duration;

use crate::config::{RetryPolicy, Timeouts};
use crate::device::{Chip, ChipDB};
use crate::error::{Error, Result};
use crate::protocol::{Command, Response};
use crate::transport::Transport;

/// How the device gets into its bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetStrategy {
    /// Nothing to do, the bootloader is expected to be listening already.
    None,
    /// Ask the running application to jump into the bootloader.
    Sequence {
        sequence: Vec<u8>,
        /// Expected answer of the application, if it sends one
        reply: Option<Vec<u8>>,
        attempts: u32,
        timeout: Duration,
    },
    /// Pulse DTR, wired to MCLR, and give the chip time to come up.
    Dtr { pulse: Duration, settle: Duration },
}

/// A bootloader answered the identify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub device_id: u8,
    pub attempts: u32,
}

/// A page write was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub attempts: u32,
}

pub struct Bootloader<T: Transport> {
    transport: T,
    /// Separate port used only for its DTR line
    reset_line: Option<Box<dyn Transport>>,
    timeouts: Timeouts,
    retries: RetryPolicy,
}

impl<T: Transport> Bootloader<T> {
    pub fn new(transport: T, timeouts: Timeouts, retries: RetryPolicy) -> Self {
        Bootloader {
            transport,
            reset_line: None,
            timeouts,
            retries,
        }
    }

    /// Drive DTR resets on `line` instead of the data port.
    pub fn with_reset_line(mut self, line: Box<dyn Transport>) -> Self {
        self.reset_line = Some(line);
        self
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// One identify exchange.
    pub fn probe(&mut self) -> Result<Option<Ready>> {
        self.transport.clear_input()?;
        match self
            .transport
            .transfer(&Command::Identify, self.timeouts.sync())?
        {
            Response::Identified { device_id } => Ok(Some(Ready {
                device_id,
                attempts: 1,
            })),
            resp => {
                log::debug!("identify: {:?}", resp);
                Ok(None)
            }
        }
    }

    /// Identify with the configured attempt budget.
    pub fn synchronize(&mut self) -> Result<Ready> {
        let attempts = self.retries.sync_attempts;
        for attempt in 1..=attempts {
            if let Some(ready) = self.probe()? {
                log::debug!(
                    "Bootloader answered with type id {:#04x} on attempt #{}",
                    ready.device_id,
                    attempt
                );
                return Ok(Ready {
                    device_id: ready.device_id,
                    attempts: attempt,
                });
            }
            if attempt < attempts {
                log::warn!("No bootloader reply on attempt #{}. Retrying...", attempt);
            }
        }
        log::error!("Failed to detect bootloader during {} attempt(s)", attempts);
        Err(Error::SyncFailed { attempts })
    }

    /// Synchronize and resolve the reported type id to a supported chip.
    pub fn identify(&mut self, db: &ChipDB, expected: Option<&Chip>) -> Result<Chip> {
        let ready = self.synchronize()?;
        resolve_chip(db, ready.device_id, expected)
    }

    /// Program one page. `address` is the byte address of the page.
    pub fn write_page(&mut self, address: u32, data: &[u8]) -> Result<Ack> {
        let cmd = Command::write_page(word_address(address)?, data.to_vec());
        let attempts = self.retries.page_attempts;
        for attempt in 1..=attempts {
            self.transport.clear_input()?;
            match self.transport.transfer(&cmd, self.timeouts.write())? {
                Response::Ack => return Ok(Ack { attempts: attempt }),
                resp => log::warn!(
                    "Writing page {:#06x} failed on attempt #{}: {:?}",
                    address,
                    attempt,
                    resp
                ),
            }
        }
        log::error!("Error writing memory block starting from position {:#06X}", address);
        Err(Error::PageWriteFailed { address, attempts })
    }

    /// Read the page back and compare it with `expected`.
    pub fn verify_page(&mut self, address: u32, expected: &[u8]) -> Result<()> {
        let len = u8::try_from(expected.len()).map_err(|_| {
            Error::Config(format!("page of {} bytes cannot be read back", expected.len()))
        })?;
        let cmd = Command::read_page(word_address(address)?, len);
        let attempts = self.retries.page_attempts;
        let mut mismatch = None;
        for attempt in 1..=attempts {
            self.transport.clear_input()?;
            match self.transport.transfer(&cmd, self.timeouts.verify())? {
                Response::Data(data) => {
                    match expected.iter().zip(&data).position(|(e, d)| e != d) {
                        None => return Ok(()),
                        Some(offset) => {
                            log::warn!(
                                "Page {:#06x} differs at offset {} on attempt #{}",
                                address,
                                offset,
                                attempt
                            );
                            mismatch = Some(Error::VerifyMismatch {
                                address,
                                offset,
                                expected: expected[offset],
                                found: data[offset],
                            });
                        }
                    }
                }
                resp => log::warn!(
                    "Reading back page {:#06x} failed on attempt #{}: {:?}",
                    address,
                    attempt,
                    resp
                ),
            }
        }
        Err(mismatch.unwrap_or(Error::PageReadFailed { address, attempts }))
    }

    /// Bring the device into its bootloader.
    pub fn reset_device(&mut self, strategy: &ResetStrategy) -> Result<()> {
        match strategy {
            ResetStrategy::None => Ok(()),
            ResetStrategy::Sequence {
                sequence,
                reply,
                attempts,
                timeout,
            } => self.send_reset_sequence(sequence, reply.as_deref(), *attempts, *timeout),
            ResetStrategy::Dtr { pulse, settle } => {
                log::info!("Resetting PIC with hardware reset...");
                match self.reset_line.as_mut() {
                    Some(line) => pulse_dtr(line.as_mut(), *pulse, *settle),
                    None => pulse_dtr(&mut self.transport, *pulse, *settle),
                }
            }
        }
    }

    fn send_reset_sequence(
        &mut self,
        sequence: &[u8],
        reply: Option<&[u8]>,
        attempts: u32,
        timeout: Duration,
    ) -> Result<()> {
        log::info!("Resetting PIC with {} sequence...", hex::encode(sequence));
        let Some(reply) = reply else {
            self.transport.clear_input()?;
            return self.transport.send_raw(sequence);
        };
        for attempt in 1..=attempts {
            self.transport.clear_input()?;
            self.transport.send_raw(sequence)?;
            let received = self.transport.recv_raw(reply.len(), timeout)?;
            log::debug!("Received {} bytes", received.len());
            if received == reply {
                return Ok(());
            }
            if attempt < attempts {
                log::warn!(
                    "Failed to read PIC reply sequence on attempt #{}. Retrying...",
                    attempt
                );
            }
        }
        log::error!("Failed to reset PIC by command during {} attempt(s)", attempts);
        Err(Error::ResetFailed { attempts })
    }
}

/// Map a reported type id to a chip.
///
/// An `expected` chip is used as is once the bootloader reports its type id,
/// otherwise the id is looked up in `db`.
pub fn resolve_chip(db: &ChipDB, device_id: u8, expected: Option<&Chip>) -> Result<Chip> {
    let chip = match expected {
        Some(chip) if chip.chip_id == device_id => chip.clone(),
        Some(chip) => {
            return Err(Error::DeviceMismatch {
                expected: chip.name.clone(),
                found: device_id,
            });
        }
        None => db.find_by_id(device_id)?,
    };
    chip.ensure_supported()?;
    log::info!("Chip: {}", chip);
    Ok(chip)
}

/// Assert DTR for `pulse`, release it and wait `settle`.
pub fn pulse_dtr<T: Transport + ?Sized>(
    transport: &mut T,
    pulse: Duration,
    settle: Duration,
) -> Result<()> {
    transport.set_dtr(true)?;
    sleep(pulse);
    transport.set_dtr(false)?;
    sleep(settle);
    Ok(())
}

fn word_address(address: u32) -> Result<u16> {
    if address % 2 != 0 {
        return Err(Error::Config(format!(
            "page address {:#06x} is not word aligned",
            address
        )));
    }
    u16::try_from(address / 2).map_err(|_| Error::ImageOutOfRange {
        address,
        limit: 0x2_0000,
    })
}
