//! Serial link to a SIM800C over a USB-UART adapter.
//!
//! Opens the port 8N1 without flow control and splits it into a reader
//! (via `try_clone`) and a writer, as the AT channel expects.

use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, StopBits};

use gsm_fleet_core::models::error::ChannelError;
use gsm_fleet_core::traits::port::{PortHandles, PortOpener};

pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// `PortOpener` backed by the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    /// Upper bound on a single blocking read; the reader re-checks its
    /// running flag at this interval.
    read_timeout: Duration,
}

impl SerialPortOpener {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SerialPortOpener {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &str, baud_rate: u32) -> Result<PortHandles, ChannelError> {
        if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
            return Err(ChannelError::Connection(format!("unsupported baud rate {}", baud_rate)));
        }

        let writer = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| ChannelError::Connection(format!("{}: {}", port, e)))?;

        if let Err(e) = writer.clear(serialport::ClearBuffer::All) {
            log::debug!("{}: could not clear buffers: {}", port, e);
        }

        let reader = writer
            .try_clone()
            .map_err(|e| ChannelError::Connection(format!("{}: failed to clone handle: {}", port, e)))?;

        log::info!("opened {} at {} baud", port, baud_rate);
        Ok(PortHandles {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_baud_rate() {
        let opener = SerialPortOpener::default();
        let result = opener.open("/dev/ttyUSB0", 12345);
        assert!(matches!(result, Err(ChannelError::Connection(_))));
    }

    #[test]
    fn missing_port_is_connection_error() {
        let opener = SerialPortOpener::default();
        let result = opener.open("/dev/gsm-fleet-no-such-port", 9600);
        assert!(matches!(result, Err(ChannelError::Connection(_))));
    }
}
