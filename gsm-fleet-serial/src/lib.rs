//! # gsm-fleet-serial
//!
//! Hardware backends for gsm-fleet-core.
//!
//! Provides:
//! - `SerialPortOpener`: SIM800C serial links via the `serialport` crate
//! - `AlsaBackend`: call audio capture from USB sound cards via `arecord`
//! - `device_discovery`: serial port and sound card enumeration
//! - `console`: the operator console served by `gsm-fleetd`
//!
//! ## Usage
//! ```ignore
//! use gsm_fleet_core::{FleetConfig, Gateway};
//! use gsm_fleet_serial::hardware;
//!
//! let config = FleetConfig::from_file("fleet.json".as_ref())?;
//! let gateway = Gateway::from_config(&config, hardware(&config))?;
//! println!("{:?}", gateway.list_modules());
//! ```

use std::sync::Arc;

use gsm_fleet_core::{FleetConfig, Hardware};

pub mod alsa_input;
pub mod console;
pub mod device_discovery;
pub mod serial_port;

pub use alsa_input::AlsaBackend;
pub use serial_port::SerialPortOpener;

/// Backends for `config`: the in-process simulator when `simulate` is set,
/// real serial ports and ALSA devices otherwise.
pub fn hardware(config: &FleetConfig) -> Hardware {
    if config.simulate {
        log::warn!("simulate is set, using the in-process modem simulator");
        return Hardware::simulated().0;
    }
    Hardware {
        opener: Arc::new(SerialPortOpener::new(config.channel.read_poll())),
        audio: Some(Arc::new(AlsaBackend::new())),
    }
}
