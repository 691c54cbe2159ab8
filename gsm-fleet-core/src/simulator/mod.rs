//! In-process stand-ins for SIM800C modems and their audio outputs.
//!
//! Backs the fleet when `simulate` is set in the configuration, and the tests.

pub mod audio;
pub mod modem;

pub use audio::SimulatedAudio;
pub use modem::{DialBehavior, SimulatedModem, SimulatedPorts, SmsBehavior};
