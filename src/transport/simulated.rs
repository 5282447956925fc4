//! Simulated Tiny Bootloader device.
//!
//! Speaks the PIC16 wire protocol from memory, with knobs to inject the
//! failures seen on real links: a bootloader that never answers, dropped or
//! rejected frames, corrupted bits and flash cells that do not program.
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::time::Duration;

use super::Transport;
use crate::constants::{commands, ACK, ERASE_VALUE};
use crate::error::{Error, Result};
use crate::protocol::{checksum, checksum_ok};

/// Reply of the bootloader to a frame with a bad checksum.
const NAK: u8 = b'N';

/// Counters of what the device has seen on the line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub identify_requests: usize,
    pub write_frames: usize,
    pub read_frames: usize,
    pub reset_sequences: usize,
    pub dtr_resets: usize,
    /// Byte addresses of accepted page writes, in arrival order.
    pub written_pages: Vec<u32>,
}

pub struct SimulatedDevice {
    device_id: u8,
    flash: BTreeMap<u32, u8>,
    listening: bool,
    in_bootloader: bool,
    reset_sequence: Option<Vec<u8>>,
    reset_reply: Vec<u8>,
    dtr: bool,
    rx: VecDeque<u8>,

    write_timeouts: usize,
    write_naks: usize,
    read_corruptions: usize,
    corrupt_write: Option<(usize, usize)>,
    io_error_write: Option<usize>,
    stuck_bits: BTreeMap<u32, u8>,

    stats: Stats,
}

impl SimulatedDevice {
    /// A device already sitting in its bootloader.
    pub fn new(device_id: u8) -> Self {
        SimulatedDevice {
            device_id,
            flash: BTreeMap::new(),
            listening: true,
            in_bootloader: true,
            reset_sequence: None,
            reset_reply: Vec::new(),
            dtr: false,
            rx: VecDeque::new(),
            write_timeouts: 0,
            write_naks: 0,
            read_corruptions: 0,
            corrupt_write: None,
            io_error_write: None,
            stuck_bits: BTreeMap::new(),
            stats: Stats::default(),
        }
    }

    /// Never answers the identify request.
    pub fn not_listening(mut self) -> Self {
        self.listening = false;
        self
    }

    /// Runs the user application, which jumps to the bootloader when it
    /// receives `sequence` and answers with `reply`.
    pub fn running_application(mut self, sequence: &[u8], reply: &[u8]) -> Self {
        self.in_bootloader = false;
        self.reset_sequence = Some(sequence.to_vec());
        self.reset_reply = reply.to_vec();
        self
    }

    /// Runs the user application and only a hardware reset gets it back
    /// into the bootloader.
    pub fn running_application_without_reset_hook(mut self) -> Self {
        self.in_bootloader = false;
        self.reset_sequence = None;
        self
    }

    /// Silently drops the next `n` write frames.
    pub fn with_write_timeouts(mut self, n: usize) -> Self {
        self.write_timeouts = n;
        self
    }

    /// Answers the next `n` write frames with a NAK.
    pub fn with_write_naks(mut self, n: usize) -> Self {
        self.write_naks = n;
        self
    }

    /// Flips `bit` of the `nth` (0-based) write frame on its way in.
    pub fn with_corrupted_write(mut self, nth: usize, bit: usize) -> Self {
        self.corrupt_write = Some((nth, bit));
        self
    }

    /// The port fails while sending the `nth` (0-based) write frame.
    pub fn with_io_error_on_write(mut self, nth: usize) -> Self {
        self.io_error_write = Some(nth);
        self
    }

    /// Corrupts one data byte of the next `n` read-back responses.
    pub fn with_read_corruptions(mut self, n: usize) -> Self {
        self.read_corruptions = n;
        self
    }

    /// Bits of `mask` at byte `address` always read back as zero.
    pub fn with_stuck_bits(mut self, address: u32, mask: u8) -> Self {
        self.stuck_bits.insert(address, mask);
        self
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn flash(&self) -> &BTreeMap<u32, u8> {
        &self.flash
    }

    pub fn in_bootloader(&self) -> bool {
        self.in_bootloader
    }

    fn read_flash(&self, address: u32, len: usize) -> Vec<u8> {
        (address..address + len as u32)
            .map(|addr| *self.flash.get(&addr).unwrap_or(&ERASE_VALUE))
            .collect()
    }

    fn handle_application(&mut self, raw: &[u8]) {
        if self.reset_sequence.as_deref() == Some(raw) {
            self.stats.reset_sequences += 1;
            self.in_bootloader = true;
            self.rx.extend(self.reset_reply.iter().copied());
        }
    }

    fn handle_read(&mut self, raw: &[u8]) {
        self.stats.read_frames += 1;
        if raw.len() != 5 || !checksum_ok(raw) {
            self.rx.push_back(NAK);
            return;
        }
        let address = u16::from_be_bytes([raw[1], raw[2]]) as u32 * 2;
        let mut data = self.read_flash(address, raw[3] as usize);
        let chk = checksum(&data);
        if self.read_corruptions > 0 && !data.is_empty() {
            self.read_corruptions -= 1;
            data[0] ^= 0x01;
        }
        self.rx.extend(data);
        self.rx.push_back(chk);
        self.rx.push_back(ACK);
    }

    fn handle_write(&mut self, raw: &[u8]) {
        let nth = self.stats.write_frames;
        self.stats.write_frames += 1;

        let mut frame = raw.to_vec();
        if let Some((target, bit)) = self.corrupt_write {
            if target == nth && bit / 8 < frame.len() {
                frame[bit / 8] ^= 1 << (bit % 8);
            }
        }

        if self.write_timeouts > 0 {
            self.write_timeouts -= 1;
            return;
        }
        if self.write_naks > 0 {
            self.write_naks -= 1;
            self.rx.push_back(NAK);
            return;
        }
        if frame.len() < 4 || frame.len() != frame[2] as usize + 4 || !checksum_ok(&frame) {
            self.rx.push_back(NAK);
            return;
        }

        let address = u16::from_be_bytes([frame[0], frame[1]]) as u32 * 2;
        for (i, &byte) in frame[3..frame.len() - 1].iter().enumerate() {
            let addr = address + i as u32;
            let mask = self.stuck_bits.get(&addr).copied().unwrap_or(0);
            self.flash.insert(addr, byte & !mask);
        }
        self.stats.written_pages.push(address);
        self.rx.push_back(ACK);
    }
}

impl Transport for SimulatedDevice {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        if !self.in_bootloader {
            self.handle_application(raw);
            return Ok(());
        }
        match raw[0] {
            commands::IDENTIFY if raw.len() == 1 => {
                self.stats.identify_requests += 1;
                if self.listening {
                    self.rx.extend([self.device_id, ACK]);
                }
            }
            commands::READ_PAGE => self.handle_read(raw),
            _ if self.io_error_write == Some(self.stats.write_frames) => {
                self.stats.write_frames += 1;
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "serial line went away",
                )));
            }
            _ => self.handle_write(raw),
        }
        Ok(())
    }

    fn recv_raw(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        let n = len.min(self.rx.len());
        Ok(self.rx.drain(..n).collect())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        // reset is released on the falling edge
        if self.dtr && !level {
            self.stats.dtr_resets += 1;
            self.in_bootloader = true;
            self.rx.clear();
        }
        self.dtr = level;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Response};

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn test_identify_and_write() {
        let mut dev = SimulatedDevice::new(0x31);
        assert_eq!(
            dev.transfer(&Command::Identify, TIMEOUT).unwrap(),
            Response::Identified { device_id: 0x31 }
        );
        let resp = dev
            .transfer(&Command::write_page(0x20, vec![0xaa, 0x55]), TIMEOUT)
            .unwrap();
        assert_eq!(resp, Response::Ack);
        assert_eq!(dev.flash().get(&0x40), Some(&0xaa));
        assert_eq!(dev.flash().get(&0x41), Some(&0x55));
        assert_eq!(dev.stats().written_pages, vec![0x40]);
    }

    #[test]
    fn test_corrupted_frame_is_rejected() {
        let mut dev = SimulatedDevice::new(0x31).with_corrupted_write(0, 20);
        let resp = dev
            .transfer(&Command::write_page(0, vec![1, 2, 3, 4]), TIMEOUT)
            .unwrap();
        assert_eq!(resp, Response::Nak(NAK));
        assert!(dev.flash().is_empty());
    }

    #[test]
    fn test_application_ignores_protocol_until_reset() {
        let mut dev = SimulatedDevice::new(0x31).running_application(b"\x55\xaa", b"OK");
        assert_eq!(
            dev.transfer(&Command::Identify, TIMEOUT).unwrap(),
            Response::Timeout { received: 0 }
        );
        dev.send_raw(b"\x55\xaa").unwrap();
        assert_eq!(dev.recv_raw(2, TIMEOUT).unwrap(), b"OK".to_vec());
        assert!(dev.in_bootloader());
    }

    #[test]
    fn test_write_io_error() {
        let mut dev = SimulatedDevice::new(0x31).with_io_error_on_write(0);
        let cmd = Command::write_page(0, vec![1, 2]);
        assert!(matches!(dev.transfer(&cmd, TIMEOUT), Err(Error::Io(_))));
        assert_eq!(dev.transfer(&cmd, TIMEOUT).unwrap(), Response::Ack);
        assert_eq!(dev.stats().write_frames, 2);
    }

    #[test]
    fn test_dtr_pulse_enters_bootloader() {
        let mut dev = SimulatedDevice::new(0x31).running_application_without_reset_hook();
        dev.set_dtr(true).unwrap();
        assert!(!dev.in_bootloader());
        dev.set_dtr(false).unwrap();
        assert!(dev.in_bootloader());
        assert_eq!(dev.stats().dtr_resets, 1);
    }
}
