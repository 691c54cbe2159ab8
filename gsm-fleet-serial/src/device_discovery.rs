//! Discovery of attached modems and USB sound cards.
//!
//! Serial ports come from `serialport::available_ports`; capture cards are
//! read from `/proc/asound/cards`.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serialport::SerialPortType;
use thiserror::Error;

const ASOUND_CARDS: &str = "/proc/asound/cards";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("serial port enumeration failed: {0}")]
    Serial(#[from] serialport::Error),

    #[error("failed to read sound cards: {0}")]
    Io(#[from] std::io::Error),
}

/// A serial port that may have a SIM800C behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialDevice {
    pub port: String,
    pub usb: bool,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// An ALSA sound card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoundCard {
    pub index: u32,
    pub id: String,
    pub driver: String,
    pub name: String,
}

impl SoundCard {
    pub fn is_usb(&self) -> bool {
        self.driver == "USB-Audio"
    }

    /// Device string usable as a module's `audio_device`.
    pub fn capture_device(&self) -> String {
        format!("plughw:{},0", self.index)
    }
}

/// Every serial port the OS reports, USB adapters first.
pub fn list_serial_ports() -> Result<Vec<SerialDevice>, DiscoveryError> {
    let mut devices: Vec<SerialDevice> = serialport::available_ports()?
        .into_iter()
        .map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) => SerialDevice {
                port: info.port_name,
                usb: true,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => SerialDevice {
                port: info.port_name,
                usb: false,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            },
        })
        .collect();
    devices.sort_by(|a, b| b.usb.cmp(&a.usb).then_with(|| a.port.cmp(&b.port)));
    Ok(devices)
}

/// USB capture cards, in card order. Empty when ALSA is not present.
pub fn list_capture_cards() -> Result<Vec<SoundCard>, DiscoveryError> {
    if !Path::new(ASOUND_CARDS).exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(ASOUND_CARDS)?;
    Ok(parse_asound_cards(&text)
        .into_iter()
        .filter(SoundCard::is_usb)
        .collect())
}

/// Parse the card header lines of `/proc/asound/cards`:
///
/// ```text
///  1 [Device         ]: USB-Audio - USB PnP Sound Device
///                       C-Media Electronics Inc. USB PnP Sound Device at usb-0000:00:14.0-2
/// ```
pub fn parse_asound_cards(text: &str) -> Vec<SoundCard> {
    text.lines().filter_map(parse_card_line).collect()
}

fn parse_card_line(line: &str) -> Option<SoundCard> {
    let line = line.trim_start();
    let (index, rest) = line.split_once(' ')?;
    let index: u32 = index.parse().ok()?;
    let rest = rest.trim_start().strip_prefix('[')?;
    let (id, rest) = rest.split_once(']')?;
    let rest = rest.trim_start().strip_prefix(':')?.trim();
    let (driver, name) = rest.split_once(" - ").unwrap_or((rest, ""));
    Some(SoundCard {
        index,
        id: id.trim().to_string(),
        driver: driver.trim().to_string(),
        name: name.trim().to_string(),
    })
}
