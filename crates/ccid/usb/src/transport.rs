//! USB implementation of the reader transport
//!
//! Commands are written as whole frames on the bulk OUT endpoint. Two worker
//! threads poll bulk IN (responses) and interrupt IN (slot changes); they only
//! ever talk to the session through the [`TransportSink`].

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Bytes;
use rusb::{Context, DeviceHandle, UsbContext};
use springcard_ccid::{
    CcidServiceKind, Discovery, Transport, TransportError, TransportEvent, TransportSink,
    frame::{HEADER_LEN, MAX_PAYLOAD_LEN},
};
use tracing::{debug, trace, warn};

use crate::descriptor::{self, HARDWARE_ERROR, NOTIFY_SLOT_CHANGE};
use crate::error::UsbError;
use crate::reader::{UsbReader, find_reader};

/// How long a worker blocks before checking whether it should stop
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bulk OUT timeout
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open link to a reader
struct Link {
    handle: Arc<DeviceHandle<Context>>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    sink: TransportSink,
}

/// CCID transport over USB bulk and interrupt endpoints
pub struct UsbTransport {
    context: Context,
    reader: UsbReader,
    write_timeout: Duration,
    link: Option<Link>,
}

impl fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbTransport")
            .field("reader", &self.reader.name())
            .field("bus", &self.reader.bus)
            .field("address", &self.reader.address)
            .field("connected", &self.link.is_some())
            .finish()
    }
}

impl UsbTransport {
    /// Transport for a reader found by enumeration
    pub const fn new(context: Context, reader: UsbReader) -> Self {
        Self {
            context,
            reader,
            write_timeout: WRITE_TIMEOUT,
            link: None,
        }
    }

    /// First reader matching `pattern` (serial number or name fragment), or the
    /// first reader when no pattern is given
    pub fn open(pattern: Option<&str>) -> Result<Self, UsbError> {
        let context = Context::new()?;
        let reader = find_reader(&context, pattern)?;
        Ok(Self::new(context, reader))
    }

    /// Set the bulk OUT timeout
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Reader this transport talks to
    pub const fn reader(&self) -> &UsbReader {
        &self.reader
    }

    fn open_handle(&self) -> Result<DeviceHandle<Context>, UsbError> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == self.reader.bus && d.address() == self.reader.address)
            .ok_or_else(|| UsbError::ReaderNotFound(self.reader.name()))?;

        let handle = device.open()?;
        #[cfg(target_os = "linux")]
        {
            if handle
                .kernel_driver_active(self.reader.interface)
                .unwrap_or(false)
            {
                debug!(interface = self.reader.interface, "Detaching kernel driver");
                handle.detach_kernel_driver(self.reader.interface)?;
            }
        }
        handle.claim_interface(self.reader.interface)?;
        if self.reader.setting != 0 {
            handle.set_alternate_setting(self.reader.interface, self.reader.setting)?;
        }
        Ok(handle)
    }

    fn start(&self, sink: TransportSink) -> Result<Link, UsbError> {
        let handle = Arc::new(self.open_handle()?);
        let running = Arc::new(AtomicBool::new(true));
        let mut workers = Vec::with_capacity(2);

        let bulk = Worker {
            handle: Arc::clone(&handle),
            running: Arc::clone(&running),
            sink: sink.clone(),
            endpoint: self.reader.bulk_in,
        };
        workers.push(spawn_worker("ccid-usb-bulk", move || bulk.read_responses())?);

        if let Some(endpoint) = self.reader.interrupt_in {
            let interrupt = Worker {
                handle: Arc::clone(&handle),
                running: Arc::clone(&running),
                sink: sink.clone(),
                endpoint,
            };
            let slot_count = self.reader.slot_count;
            let spawned = spawn_worker("ccid-usb-interrupt", move || {
                interrupt.read_notifications(slot_count)
            });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    running.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }

        Ok(Link {
            handle,
            running,
            workers,
            sink,
        })
    }

    fn stop(&mut self) -> Option<TransportSink> {
        let link = self.link.take()?;
        link.running.store(false, Ordering::Release);
        for worker in link.workers {
            let _ = worker.join();
        }
        if let Err(e) = link.handle.release_interface(self.reader.interface) {
            debug!(error = %e, "Failed to release interface");
        }
        debug!(reader = %self.reader.name(), "USB link closed");
        Some(link.sink)
    }
}

impl Transport for UsbTransport {
    fn connect(&mut self, sink: TransportSink) -> Result<(), TransportError> {
        // A link left over from an unplug
        self.stop();

        let link = self.start(sink.clone())?;
        self.link = Some(link);
        debug!(
            reader = %self.reader.name(),
            slots = self.reader.slot_count,
            "USB link open"
        );

        // Bulk readers carry no status bytes at connect time
        sink.send(TransportEvent::Connected(Discovery {
            info: self.reader.info.clone(),
            service: CcidServiceKind::Plain,
            slot_count: self.reader.slot_count,
            status: None,
        }));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let sink = self.stop().ok_or(TransportError::NotConnected)?;
        sink.send(TransportEvent::Disconnected);
        Ok(())
    }

    fn close(&mut self) {
        self.stop();
    }

    fn do_write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        let written = link
            .handle
            .write_bulk(self.reader.bulk_out, data, self.write_timeout)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        if written != data.len() {
            return Err(UsbError::IncompleteWrite {
                written,
                expected: data.len(),
            }
            .into());
        }
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker<F>(name: &str, f: F) -> Result<JoinHandle<()>, UsbError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|e| UsbError::Spawn(e.to_string()))
}

/// Endpoint polling loop shared by both workers
struct Worker {
    handle: Arc<DeviceHandle<Context>>,
    running: Arc<AtomicBool>,
    sink: TransportSink,
    endpoint: u8,
}

impl Worker {
    fn read_responses(self) {
        let mut buf = vec![0u8; HEADER_LEN + MAX_PAYLOAD_LEN];
        while self.running.load(Ordering::Acquire) {
            match self.handle.read_bulk(self.endpoint, &mut buf, POLL_INTERVAL) {
                Ok(0) | Err(rusb::Error::Timeout) => {}
                Ok(n) => {
                    trace!(len = n, "Bulk IN");
                    self.sink
                        .send(TransportEvent::DataReceived(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(e) => {
                    self.lost(e);
                    return;
                }
            }
        }
    }

    fn read_notifications(self, slot_count: u8) {
        let mut buf = [0u8; 64];
        while self.running.load(Ordering::Acquire) {
            match self
                .handle
                .read_interrupt(self.endpoint, &mut buf, POLL_INTERVAL)
            {
                Ok(0) | Err(rusb::Error::Timeout) => {}
                Ok(n) => self.notification(&buf[..n], slot_count),
                Err(e) => {
                    self.lost(e);
                    return;
                }
            }
        }
    }

    fn notification(&self, message: &[u8], slot_count: u8) {
        trace!(data = %hex::encode(message), "Interrupt IN");
        match message.first() {
            Some(&NOTIFY_SLOT_CHANGE) => {
                match descriptor::slot_change_to_status(message, slot_count) {
                    Some(status) => self.sink.send(TransportEvent::StatusNotification(status)),
                    None => warn!(data = %hex::encode(message), "Malformed slot change"),
                }
            }
            Some(&HARDWARE_ERROR) if message.len() >= 4 => {
                let error = UsbError::Hardware {
                    slot: message[1],
                    code: message[3],
                };
                warn!(%error, "Reader hardware error");
            }
            _ => debug!(data = %hex::encode(message), "Unknown interrupt message"),
        }
    }

    /// Report a dead endpoint once; the first worker to notice wins
    fn lost(&self, e: rusb::Error) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        match e {
            rusb::Error::NoDevice => {
                debug!("Reader unplugged");
                self.sink.send(TransportEvent::Disconnected);
            }
            other => {
                warn!(error = %other, endpoint = self.endpoint, "USB read failed");
                self.sink.send(TransportEvent::Error(TransportError::ReadFailed(
                    other.to_string(),
                )));
            }
        }
    }
}
