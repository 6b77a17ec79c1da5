//! SpringCard vendor escape commands
//!
//! Escape payloads start with the vendor class byte `0x58`. The reader answers
//! with a status byte, `0x00` on success, followed by the command output.

use bytes::Bytes;

use crate::device::FirmwareVersion;
use crate::error::{Error, Result, ResultExt};

/// Vendor class byte
pub const VENDOR_CLA: u8 = 0x58;

/// `GET_DATA` instruction
pub const GET_DATA: u8 = 0x20;

/// `GET_DATA` identifier of the firmware revision string
pub const FIRMWARE_REVISION: u8 = 0x06;

/// `CCID_GET_SLOT_NAME` instruction
pub const GET_SLOT_NAME: u8 = 0x21;

/// Power and battery query
pub const POWER_STATUS: u8 = 0xBC;

/// Shutdown instruction
pub const SHUTDOWN: u8 = 0xAF;

/// Status byte of a successful control response
pub const STATUS_OK: u8 = 0x00;

/// Read the firmware revision string
pub fn get_firmware_revision() -> Bytes {
    Bytes::from_static(&[VENDOR_CLA, GET_DATA, FIRMWARE_REVISION])
}

/// Read the name of a slot
pub fn get_slot_name(slot: u8) -> Bytes {
    Bytes::copy_from_slice(&[VENDOR_CLA, GET_SLOT_NAME, slot])
}

/// Query power source and battery level
pub fn get_power_status() -> Bytes {
    Bytes::from_static(&[VENDOR_CLA, POWER_STATUS])
}

/// Switch the reader off
pub fn shutdown() -> Bytes {
    Bytes::from_static(&[VENDOR_CLA, SHUTDOWN])
}

/// Wake a sleeping reader; any harmless query does, the power query is used
pub fn wake_up() -> Bytes {
    get_power_status()
}

/// Strip the status byte of a control response
pub fn parse_control_response(response: &[u8]) -> Result<&[u8]> {
    match response.split_first() {
        Some((&STATUS_OK, data)) => Ok(data),
        Some(_) => Err(Error::protocol("Vendor command rejected by the reader")),
        None => Err(Error::protocol("Empty control response")),
    }
}

/// Parse the answer to [`get_firmware_revision`]
pub fn parse_firmware_revision(response: &[u8]) -> Result<FirmwareVersion> {
    parse_string(response)
        .context("Reading firmware revision")?
        .parse()
}

/// Parse the answer to [`get_slot_name`]
pub fn parse_slot_name(response: &[u8]) -> Result<String> {
    parse_string(response).context("Reading slot name")
}

/// Power source reported by [`get_power_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStatus {
    /// Raw power source byte
    pub source: u8,
    /// Battery level in percent, when reported
    pub battery_level: Option<u8>,
}

/// Parse the answer to [`get_power_status`]
pub fn parse_power_status(response: &[u8]) -> Result<PowerStatus> {
    let data = parse_control_response(response)?;
    let (&source, rest) = data
        .split_first()
        .ok_or(Error::protocol("Empty power status"))?;
    Ok(PowerStatus {
        source,
        battery_level: rest.first().copied(),
    })
}

fn parse_string(response: &[u8]) -> Result<String> {
    let data = parse_control_response(response)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    std::str::from_utf8(&data[..end])
        .map(|s| s.trim().to_string())
        .map_err(|_| Error::protocol("Invalid UTF-8 in vendor string"))
}
