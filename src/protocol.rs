//! The underlying binary protocol of Tiny Bootloader (PIC16 flavour)

use std::fmt;

use scroll::{Pwrite, BE};

use crate::constants::{commands, ACK, MAX_PAYLOAD_SIZE};
use crate::error::{Error, Result};

/// Two's-complement 8-bit checksum: the value that brings the byte sum to 0.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &val| acc.wrapping_add(val))
        .wrapping_neg()
}

/// A frame whose trailing checksum byte is consistent with the rest of it.
pub fn checksum_ok(frame: &[u8]) -> bool {
    !frame.is_empty() && frame.iter().fold(0u8, |acc, &val| acc.wrapping_add(val)) == 0
}

/// Tiny Bootloader command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Ask the bootloader for its device type id.
    ///
    /// Only answered during the short window after reset in which the
    /// bootloader waits before starting the application.
    Identify,
    /// Program one page of flash.
    ///
    /// `address` is a word address, `data` is the little-endian byte image
    /// of the page, two bytes per word.
    WritePage { address: u16, data: Vec<u8> },
    /// Read back `len` bytes starting at word `address`.
    ReadPage { address: u16, len: u8 },
}

impl Command {
    pub fn write_page(address: u16, data: Vec<u8>) -> Self {
        Command::WritePage { address, data }
    }

    pub fn read_page(address: u16, len: u8) -> Self {
        Command::ReadPage { address, len }
    }

    pub fn to_raw(&self) -> Result<Vec<u8>> {
        match self {
            Command::Identify => Ok(vec![commands::IDENTIFY]),
            Command::WritePage { address, data } => {
                if data.is_empty() || data.len() > MAX_PAYLOAD_SIZE {
                    return Err(Error::Config(format!(
                        "page payload of {} bytes does not fit in a frame",
                        data.len()
                    )));
                }
                // ADDR_H, ADDR_L, LEN, DATA, CHK
                let mut buf = vec![0u8; 2 + 1 + data.len() + 1];
                buf.pwrite_with(*address, 0, BE).map_err(scroll_error)?;
                buf[2] = data.len() as u8;
                buf[3..3 + data.len()].copy_from_slice(data);
                let end = buf.len() - 1;
                buf[end] = checksum(&buf[..end]);
                Ok(buf)
            }
            Command::ReadPage { address, len } => {
                let mut buf = [commands::READ_PAGE, 0, 0, *len, 0];
                buf.pwrite_with(*address, 1, BE).map_err(scroll_error)?;
                buf[4] = checksum(&buf[..4]);
                Ok(buf.to_vec())
            }
        }
    }

    /// Number of bytes the bootloader sends back for this command.
    pub fn response_len(&self) -> usize {
        match self {
            Command::Identify => 2,
            Command::WritePage { .. } => 1,
            // DATA, CHK, ACK
            Command::ReadPage { len, .. } => *len as usize + 2,
        }
    }
}

fn scroll_error(err: scroll::Error) -> Error {
    Error::Config(format!("frame encoding: {}", err))
}

/// Response to a Command, interpreted against the request it answers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Response {
    /// Identify answer
    Identified { device_id: u8 },
    /// Frame accepted
    Ack,
    /// Page content of a ReadPage, checksum already validated
    Data(Vec<u8>),
    /// Something other than the ACK byte where the ACK should be
    Nak(u8),
    /// Correct length but the checksum does not match the payload
    Corrupt(Vec<u8>),
    /// Fewer bytes than expected before the read timeout
    Timeout { received: usize },
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Identified { device_id } => write!(f, "IDENTIFIED({:#04x})", device_id),
            Response::Ack => write!(f, "ACK"),
            Response::Data(data) => write!(f, "DATA[{}]", hex::encode(data)),
            Response::Nak(code) => write!(f, "NAK({:#04x})", code),
            Response::Corrupt(raw) => write!(f, "CORRUPT[{}]", hex::encode(raw)),
            Response::Timeout { received } => write!(f, "TIMEOUT({} bytes)", received),
        }
    }
}

impl Response {
    pub fn from_raw(cmd: &Command, raw: &[u8]) -> Self {
        let expected = cmd.response_len();
        if raw.len() < expected {
            return Response::Timeout {
                received: raw.len(),
            };
        }
        let raw = &raw[..expected];
        match cmd {
            Command::Identify => {
                if raw[1] == ACK {
                    Response::Identified { device_id: raw[0] }
                } else {
                    Response::Nak(raw[1])
                }
            }
            Command::WritePage { .. } => {
                if raw[0] == ACK {
                    Response::Ack
                } else {
                    Response::Nak(raw[0])
                }
            }
            Command::ReadPage { .. } => {
                let (body, ack) = raw.split_at(expected - 1);
                if ack[0] != ACK {
                    Response::Nak(ack[0])
                } else if checksum_ok(body) {
                    Response::Data(body[..body.len() - 1].to_vec())
                } else {
                    Response::Corrupt(body.to_vec())
                }
            }
        }
    }
}
