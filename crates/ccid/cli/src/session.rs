//! Session on a USB reader, driven synchronously from the command line

use std::time::{Duration, Instant};

use eyre::{bail, eyre};
use springcard_ccid::{
    Bytes, Device, Session, SessionConfig, SessionEvent, SessionHandle,
    event::channel::{SessionEventReceiver, forward_to, session_event_channel},
};
use springcard_ccid_usb::UsbTransport;
use tracing::{debug, info, warn};

/// How long a single command may take
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ReaderSession {
    handle: SessionHandle,
    events: SessionEventReceiver,
    pub device: Device,
}

impl ReaderSession {
    /// Open the reader and wait until the session is created
    pub fn open(reader: Option<&str>, config: SessionConfig) -> eyre::Result<Self> {
        let transport = UsbTransport::open(reader)?;
        info!("Using reader: {}", transport.reader().name());

        let creation = config.connect_timeout.saturating_add(EVENT_TIMEOUT);
        let (tx, events) = session_event_channel();
        let handle = SessionHandle::spawn(Session::new(transport, config, forward_to(tx)))?;

        let device = wait_created(&events, creation)?;
        Ok(Self {
            handle,
            events,
            device,
        })
    }

    pub const fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Power the card of a slot unless it already is, returns its ATR
    pub fn ensure_powered(&self, slot: u8) -> eyre::Result<Bytes> {
        let reader = self.device.reader(slot)?;
        if !reader.card_present {
            bail!("no card in slot {slot}");
        }
        if reader.card_powered {
            return Ok(reader.channel.atr.clone());
        }

        self.handle.power_on(slot)?;
        self.wait(|event| match event {
            SessionEvent::CardConnected { slot: s, atr } if s == slot => Some(atr),
            _ => None,
        })
    }

    /// Wait for the first event `select` accepts, a card or reader error ends the wait
    pub fn wait<T>(&self, mut select: impl FnMut(SessionEvent) -> Option<T>) -> eyre::Result<T> {
        wait_for(&self.events, EVENT_TIMEOUT, |event| match event {
            SessionEvent::ReaderError { error, .. } => Some(Err(error)),
            other => select(other).map(Ok),
        })?
        .map_err(Into::into)
    }

    /// Disconnect and wait for the link to close
    pub fn close(self) -> eyre::Result<()> {
        self.handle.disconnect()?;
        while let Ok(event) = self.events.recv_timeout(EVENT_TIMEOUT) {
            if event == SessionEvent::SessionClosed {
                break;
            }
        }
        Ok(())
    }
}

/// Wait for the session to be created. Card errors from auto-connect leave the
/// session usable and are only logged.
fn wait_created(events: &SessionEventReceiver, timeout: Duration) -> eyre::Result<Device> {
    wait_for(events, timeout, |event| match event {
        SessionEvent::SessionCreated(device) => Some(device),
        SessionEvent::ReaderError { slot, error } => {
            warn!(slot, error = %error, "Card error while opening");
            None
        }
        _ => None,
    })
}

/// Wait for the first event `select` accepts, stopping when the session fails
fn wait_for<T>(
    events: &SessionEventReceiver,
    timeout: Duration,
    mut select: impl FnMut(SessionEvent) -> Option<T>,
) -> eyre::Result<T> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        let received = match deadline {
            Some(deadline) => events.recv_deadline(deadline).ok(),
            None => events.recv().ok(),
        };
        let event =
            received.ok_or_else(|| eyre!("no answer from the reader within {timeout:?}"))?;
        debug!(?event, "Session event");

        match event {
            SessionEvent::SessionError(e) => bail!(e),
            SessionEvent::SessionClosed => bail!("session closed"),
            other => {
                if let Some(value) = select(other) {
                    return Ok(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use springcard_ccid::{CcidServiceKind, DeviceInfo, Error};

    #[test]
    fn test_card_error_does_not_abort_opening() {
        let (tx, events) = session_event_channel();
        let device = Device::new(DeviceInfo::default(), CcidServiceKind::Plain, 1);
        tx.send(SessionEvent::ReaderError {
            slot: 0,
            error: Error::CardAbsent(0),
        })
        .unwrap();
        tx.send(SessionEvent::SessionCreated(device.clone())).unwrap();

        assert_eq!(wait_created(&events, Duration::from_secs(1)).unwrap(), device);
    }

    #[test]
    fn test_session_error_aborts_opening() {
        let (tx, events) = session_event_channel();
        tx.send(SessionEvent::SessionError(Error::DummyDevice)).unwrap();
        assert!(wait_created(&events, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_unbounded_wait() {
        let (tx, events) = session_event_channel();
        tx.send(SessionEvent::SessionClosed).unwrap();
        let result = wait_for(&events, Duration::MAX, |_| Some(()));
        assert!(result.is_err());
    }
}
