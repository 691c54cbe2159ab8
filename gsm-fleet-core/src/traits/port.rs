use std::io::{Read, Write};

use crate::models::error::ChannelError;

/// The two halves of an opened serial link.
///
/// Reads must return within a bounded time (`io::ErrorKind::TimedOut` or
/// `WouldBlock` when idle) so the reader thread can observe shutdown.
pub struct PortHandles {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Opens serial links to modems.
///
/// Implemented by:
/// - `SerialPortOpener` (gsm-fleet-serial, real hardware)
/// - `SimulatedPorts` (in-process SIM800C simulator)
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32) -> Result<PortHandles, ChannelError>;
}
