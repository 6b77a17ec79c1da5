//! Enumeration of CCID readers on the USB bus

use std::time::Duration;

use rusb::{Context, Device, DeviceDescriptor, Direction, TransferType, UsbContext};
use springcard_ccid::DeviceInfo;
use tracing::{debug, trace};

use crate::descriptor::{self, CCID_CLASS, SPRINGCARD_VID};
use crate::error::UsbError;

const STRING_TIMEOUT: Duration = Duration::from_millis(500);

/// CCID interface found on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbReader {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
    /// USB vendor identifier
    pub vendor_id: u16,
    /// USB product identifier
    pub product_id: u16,
    /// Interface number of the CCID function
    pub interface: u8,
    /// Alternate setting carrying the CCID function
    pub setting: u8,
    /// Bulk IN endpoint (responses)
    pub bulk_in: u8,
    /// Bulk OUT endpoint (commands)
    pub bulk_out: u8,
    /// Interrupt IN endpoint (slot change notifications)
    pub interrupt_in: Option<u8>,
    /// `bMaxSlotIndex + 1`
    pub slot_count: u8,
    /// String descriptors, empty when the device could not be opened
    pub info: DeviceInfo,
}

impl UsbReader {
    /// Display name, from the string descriptors when available
    pub fn name(&self) -> String {
        match (self.info.vendor_name.is_empty(), self.info.product_name.is_empty()) {
            (false, false) => format!("{} {}", self.info.vendor_name, self.info.product_name),
            (true, false) => self.info.product_name.clone(),
            _ => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }

    /// Whether the device is a SpringCard product
    pub const fn is_springcard(&self) -> bool {
        self.vendor_id == SPRINGCARD_VID
    }

    /// Match a serial number or a case insensitive fragment of the name
    pub fn matches(&self, pattern: &str) -> bool {
        if self.info.serial_number.eq_ignore_ascii_case(pattern) {
            return true;
        }
        self.name()
            .to_ascii_lowercase()
            .contains(&pattern.to_ascii_lowercase())
    }
}

/// List every CCID interface currently attached
pub fn list_readers(context: &Context) -> Result<Vec<UsbReader>, UsbError> {
    let mut readers = Vec::new();
    for device in context.devices()?.iter() {
        match probe(&device) {
            Ok(Some(reader)) => {
                debug!(
                    name = %reader.name(),
                    bus = reader.bus,
                    address = reader.address,
                    slots = reader.slot_count,
                    "Found CCID reader"
                );
                readers.push(reader);
            }
            Ok(None) => {}
            Err(e) => debug!(
                bus = device.bus_number(),
                address = device.address(),
                error = %e,
                "Skipping device"
            ),
        }
    }
    Ok(readers)
}

/// First reader, or the first one matching `pattern`
pub fn find_reader(context: &Context, pattern: Option<&str>) -> Result<UsbReader, UsbError> {
    let readers = list_readers(context)?;
    match pattern {
        None => readers.into_iter().next().ok_or(UsbError::NoReader),
        Some(pattern) => readers
            .into_iter()
            .find(|reader| reader.matches(pattern))
            .ok_or_else(|| UsbError::ReaderNotFound(pattern.into())),
    }
}

fn probe(device: &Device<Context>) -> Result<Option<UsbReader>, UsbError> {
    let desc = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;

    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            if setting.class_code() != CCID_CLASS {
                continue;
            }
            trace!(
                interface = setting.interface_number(),
                setting = setting.setting_number(),
                "CCID interface"
            );

            let mut bulk_in = None;
            let mut bulk_out = None;
            let mut interrupt_in = None;
            for endpoint in setting.endpoint_descriptors() {
                match (endpoint.transfer_type(), endpoint.direction()) {
                    (TransferType::Bulk, Direction::In) => bulk_in = Some(endpoint.address()),
                    (TransferType::Bulk, Direction::Out) => bulk_out = Some(endpoint.address()),
                    (TransferType::Interrupt, Direction::In) => {
                        interrupt_in = Some(endpoint.address())
                    }
                    _ => {}
                }
            }

            return Ok(Some(UsbReader {
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                interface: setting.interface_number(),
                setting: setting.setting_number(),
                bulk_in: bulk_in.ok_or(UsbError::MissingEndpoint("bulk IN"))?,
                bulk_out: bulk_out.ok_or(UsbError::MissingEndpoint("bulk OUT"))?,
                interrupt_in,
                slot_count: descriptor::slot_count(setting.extra()).unwrap_or(1),
                info: read_info(device, &desc),
            }));
        }
    }
    Ok(None)
}

fn read_info(device: &Device<Context>, desc: &DeviceDescriptor) -> DeviceInfo {
    let version = desc.device_version();
    let mut info = DeviceInfo {
        hardware_revision: Some(format!("{}.{}", version.major(), version.minor())),
        ..DeviceInfo::default()
    };

    let handle = match device.open() {
        Ok(handle) => handle,
        Err(e) => {
            debug!(error = %e, "Cannot open device to read strings");
            return info;
        }
    };
    let languages = handle.read_languages(STRING_TIMEOUT).unwrap_or_default();
    let Some(&language) = languages.first() else {
        return info;
    };

    info.vendor_name = handle
        .read_manufacturer_string(language, desc, STRING_TIMEOUT)
        .unwrap_or_default();
    info.product_name = handle
        .read_product_string(language, desc, STRING_TIMEOUT)
        .unwrap_or_default();
    info.serial_number = handle
        .read_serial_number_string(language, desc, STRING_TIMEOUT)
        .unwrap_or_default();
    info
}
