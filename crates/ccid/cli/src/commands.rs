use colored::Colorize;
use eyre::WrapErr;
use springcard_ccid::{SessionEvent, escape};
use springcard_ccid_usb::{Context, list_readers};

use crate::session::ReaderSession;

/// Parse hex input, ignoring whitespace and `:` separators
pub fn parse_hex(input: &str) -> eyre::Result<Vec<u8>> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&digits).wrap_err_with(|| format!("invalid hex input '{input}'"))
}

/// List the CCID readers attached over USB
pub fn list_command() -> eyre::Result<()> {
    let context = Context::new()?;
    let readers = list_readers(&context)?;

    if readers.is_empty() {
        println!("{}", "No readers found!".yellow());
        return Ok(());
    }

    println!("Available readers:");
    for (i, reader) in readers.iter().enumerate() {
        let serial = if reader.info.serial_number.is_empty() {
            "-"
        } else {
            reader.info.serial_number.as_str()
        };
        println!(
            "{}. {} (serial {serial}, {} slot(s), bus {:03} address {:03})",
            i + 1,
            reader.name().green(),
            reader.slot_count,
            reader.bus,
            reader.address
        );
    }
    Ok(())
}

/// Show the device and the state of every slot
pub fn info_command(session: &ReaderSession) -> eyre::Result<()> {
    let device = &session.device;
    println!("{}", "Reader".bold());
    println!("  Vendor:   {}", device.info.vendor_name);
    println!("  Product:  {}", device.info.product_name);
    println!("  Serial:   {}", device.info.serial_number);
    if let Some(revision) = &device.info.hardware_revision {
        println!("  Hardware: {revision}");
    }
    match &device.firmware {
        Some(firmware) => println!("  Firmware: {firmware}"),
        None => println!("  Firmware: unknown"),
    }
    println!("  Service:  {}", device.service);
    println!(
        "  Channel:  {}",
        if device.is_secure {
            "secure".green()
        } else {
            "plain".normal()
        }
    );
    if device.is_sleeping {
        println!("  {}", "Low power mode".yellow());
    }

    println!("{}", "Slots".bold());
    for reader in &device.readers {
        let state = match (reader.card_present, reader.card_powered) {
            (false, _) => "empty".dimmed(),
            (true, false) => "card present".yellow(),
            (true, true) => "card powered".green(),
        };
        println!("  {}. {} ({state})", reader.index, reader.name);
        if !reader.channel.atr.is_empty() {
            println!("     ATR: {}", hex::encode_upper(&reader.channel.atr));
        }
    }
    Ok(())
}

/// Print the ATR of the card in a slot, powering it when needed
pub fn atr_command(session: &ReaderSession, slot: u8) -> eyre::Result<()> {
    let atr = session.ensure_powered(slot)?;
    println!("{}", hex::encode_upper(&atr));
    Ok(())
}

/// Send an APDU to the card in a slot
pub fn transmit_command(session: &ReaderSession, slot: u8, apdu: &str) -> eyre::Result<()> {
    let apdu = parse_hex(apdu)?;
    session.ensure_powered(slot)?;
    session.handle().transmit(slot, apdu)?;

    let response = session.wait(|event| match event {
        SessionEvent::TransmitResponse { slot: s, response } if s == slot => Some(response),
        _ => None,
    })?;

    match response.len().checked_sub(2) {
        Some(split) => {
            let (data, sw) = response.split_at(split);
            if !data.is_empty() {
                println!("{}", hex::encode_upper(data));
            }
            let sw = hex::encode_upper(sw);
            if sw == "9000" {
                println!("SW: {}", sw.green());
            } else {
                println!("SW: {}", sw.red());
            }
        }
        None => println!("{}", hex::encode_upper(&response)),
    }
    Ok(())
}

/// Send a raw escape command to the reader
pub fn control_command(session: &ReaderSession, command: &str) -> eyre::Result<()> {
    let command = parse_hex(command)?;
    session.handle().control(command)?;
    let response = wait_control(session)?;
    println!("{}", hex::encode_upper(&response));
    Ok(())
}

/// Power off the card in a slot
pub fn power_off_command(session: &ReaderSession, slot: u8) -> eyre::Result<()> {
    session.handle().power_off(slot)?;
    session.wait(|event| match event {
        SessionEvent::CardDisconnected { slot: s } if s == slot => Some(()),
        _ => None,
    })?;
    println!("Slot {slot} powered off");
    Ok(())
}

/// Show power source and battery level
pub fn power_status_command(session: &ReaderSession) -> eyre::Result<()> {
    session.handle().power_status()?;
    let status = escape::parse_power_status(&wait_control(session)?)?;
    println!("Power source: 0x{:02X}", status.source);
    match status.battery_level {
        Some(level) => println!("Battery:      {level}%"),
        None => println!("Battery:      n/a"),
    }
    Ok(())
}

/// Switch the reader off
pub fn shutdown_command(session: &ReaderSession) -> eyre::Result<()> {
    session.handle().shutdown()?;
    escape::parse_control_response(&wait_control(session)?)?;
    println!("Reader switched off");
    Ok(())
}

fn wait_control(session: &ReaderSession) -> eyre::Result<springcard_ccid::Bytes> {
    session.wait(|event| match event {
        SessionEvent::ControlResponse { response } => Some(response),
        _ => None,
    })
}
