//! Abstract Device transport interface.
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{Command, Response};

pub use self::serial::SerialTransport;
pub use self::simulated::{SimulatedDevice, Stats};

mod serial;
mod simulated;

/// Abstraction of the transport layer.
/// A serial port in practice, or a simulated device in tests.
pub trait Transport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;

    /// Read up to `len` bytes. Returns what arrived before `timeout` expired,
    /// which may be fewer than `len` bytes or none at all.
    fn recv_raw(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Drive the DTR control line.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Drop anything left in the receive buffer.
    fn clear_input(&mut self) -> Result<()>;

    fn transfer(&mut self, cmd: &Command, timeout: Duration) -> Result<Response> {
        let req = cmd.to_raw()?;
        log::trace!("=> {}", hex::encode(&req));
        self.send_raw(&req)?;

        let resp = self.recv_raw(cmd.response_len(), timeout)?;
        log::trace!("<= {}", hex::encode(&resp));
        Ok(Response::from_raw(cmd, &resp))
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).recv_raw(len, timeout)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }

    fn clear_input(&mut self) -> Result<()> {
        (**self).clear_input()
    }
}
