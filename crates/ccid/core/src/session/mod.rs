//! Session state machine
//!
//! A [`Session`] drives one reader through its whole lifecycle: transport
//! connection, optional secure channel handshake, vendor information reads,
//! power-on of the cards already inserted, then steady-state command exchange.
//!
//! The session is synchronous. Every input (a [`TransportEvent`], a request, a
//! timer [`tick`](Session::tick)) is one method call that runs to completion, so
//! transitions never interleave. Results are reported through a
//! [`SessionObserver`]. [`SessionHandle`] runs a session on its own thread.

mod actor;
mod state;

use std::{collections::VecDeque, fmt, time::Instant};

use bytes::Bytes;
use rand::{RngCore, SeedableRng, rngs::StdRng};
use tracing::{debug, error, trace, warn};

pub use actor::SessionHandle;
pub use state::{CreatingPhase, SessionState};

use crate::config::SessionConfig;
use crate::device::{Device, Reader};
use crate::error::{Error, Result};
use crate::escape;
use crate::event::{SessionEvent, SessionObserver};
use crate::frame::{Assembly, CommandCode, FrameBuffer, Response};
use crate::handler::CcidHandler;
use crate::secure_channel::Authenticator;
use crate::status::{HeaderStatus, IccStatus, SlotState};
use crate::transport::{Discovery, Transport, TransportError, TransportEvent, TransportSink};

/// Requests accepted by an open session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Send an APDU to the card of a slot
    Transmit {
        /// Slot index
        slot: u8,
        /// Command APDU
        apdu: Bytes,
    },
    /// Power the card of a slot
    PowerOn {
        /// Slot index
        slot: u8,
    },
    /// Power off the card of a slot
    PowerOff {
        /// Slot index
        slot: u8,
    },
    /// Query the status of a slot
    GetSlotStatus {
        /// Slot index
        slot: u8,
    },
    /// Send a raw escape command
    Control {
        /// Escape payload
        command: Bytes,
    },
    /// Wake a sleeping reader
    WakeUp,
    /// Query power source and battery level
    PowerStatus,
    /// Switch the reader off
    Shutdown,
    /// Close the session
    Disconnect,
}

/// Creation step queued before the session becomes idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    DiscoverSlot(u8),
    ReadFirmware,
    ReadSlotName(u8),
    AutoConnect(u8),
}

impl Step {
    fn command(&self) -> (CommandCode, u8, Bytes) {
        match *self {
            Self::DiscoverSlot(slot) => (CommandCode::GetSlotStatus, slot, Bytes::new()),
            Self::ReadFirmware => (CommandCode::Escape, 0, escape::get_firmware_revision()),
            Self::ReadSlotName(slot) => (CommandCode::Escape, 0, escape::get_slot_name(slot)),
            Self::AutoConnect(slot) => (CommandCode::IccPowerOn, slot, Bytes::new()),
        }
    }
}

/// What the outstanding command was sent for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    Step(Step),
    Authenticate,
    PowerOn(u8),
    PowerOff(u8),
    Transmit(u8),
    GetSlotStatus(u8),
    Control,
    WakeUp,
}

/// CCID session over a transport
pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    handler: CcidHandler,
    buffer: FrameBuffer,
    device: Option<Device>,
    last_error: Option<Error>,
    observer: Box<dyn SessionObserver>,
    rng: Box<dyn RngCore + Send>,
    auth: Option<Authenticator>,
    queue: VecDeque<Step>,
    discover_slots: bool,
    in_flight: Option<Exchange>,
    sent_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("device", &self.device)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Session<T> {
    /// Create a closed session
    pub fn new<O>(transport: T, config: SessionConfig, observer: O) -> Self
    where
        O: SessionObserver + 'static,
    {
        Self {
            transport,
            config,
            state: SessionState::Closed,
            handler: CcidHandler::new(),
            buffer: FrameBuffer::new(),
            device: None,
            last_error: None,
            observer: Box::new(observer),
            rng: Box::new(StdRng::from_os_rng()),
            auth: None,
            queue: VecDeque::new(),
            discover_slots: false,
            in_flight: None,
            sent_at: None,
            deadline: None,
        }
    }

    /// Use a specific random number generator for the handshake
    pub fn with_rng<R>(mut self, rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        self.rng = Box::new(rng);
        self
    }

    /// Current state
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Connected device, between transport connection and close
    pub const fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Last fatal error
    pub const fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Session configuration
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sequence number of the next command
    pub const fn sequence(&self) -> u8 {
        self.handler.sequence()
    }

    /// Open the transport and start session creation
    pub fn connect(&mut self, sink: TransportSink) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(Error::InvalidState(self.state.name()));
        }

        self.handler.reset();
        self.buffer.clear();
        self.queue.clear();
        self.auth = None;
        self.in_flight = None;
        self.device = None;
        self.last_error = None;

        self.set_state(SessionState::Creating(CreatingPhase::Connecting));
        // No deadline when the timeout does not fit in an instant
        self.deadline = Instant::now().checked_add(self.config.connect_timeout);

        if let Err(e) = self.transport.connect(sink) {
            self.fail(e.into());
        }
        Ok(())
    }

    /// Feed one transport event
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(discovery) => self.on_connected(discovery),
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::DataReceived(data) => self.on_data(&data),
            TransportEvent::StatusNotification(data) => self.on_status(&data),
            TransportEvent::Error(e) => self.fail(e.into()),
        }
    }

    /// Check the supervision, reassembly and response timers
    pub fn tick(&mut self) {
        if self.state.is_closing() {
            return;
        }

        if self.state.is_creating() && self.deadline.is_some_and(|at| Instant::now() >= at) {
            warn!(timeout = ?self.config.connect_timeout, "Session creation timed out");
            self.fail(TransportError::Timeout.into());
            return;
        }

        let reassembly = self.config.reassembly_timeout;
        if self
            .buffer
            .started_at()
            .is_some_and(|at| at.elapsed() >= reassembly)
        {
            self.buffer.clear();
            self.fail(Error::ReassemblyTimeout(reassembly));
            return;
        }

        if let Some(timeout) = self.config.response_timeout {
            let waiting = matches!(
                self.state,
                SessionState::WritingCmdAndWaitingResp | SessionState::WakingUp
            );
            if waiting && self.sent_at.is_some_and(|at| at.elapsed() >= timeout) {
                self.handler.abort();
                self.fail(Error::ResponseTimeout(timeout));
            }
        }
    }

    /// Dispatch a request
    pub fn request(&mut self, request: Request) -> Result<()> {
        match request {
            Request::Transmit { slot, apdu } => self.transmit(slot, &apdu),
            Request::PowerOn { slot } => self.power_on(slot),
            Request::PowerOff { slot } => self.power_off(slot),
            Request::GetSlotStatus { slot } => self.get_slot_status(slot),
            Request::Control { command } => self.control(&command),
            Request::WakeUp => self.wake_up(),
            Request::PowerStatus => self.power_status(),
            Request::Shutdown => self.shutdown(),
            Request::Disconnect => self.disconnect(),
        }
    }

    /// Send an APDU to a powered card
    pub fn transmit(&mut self, slot: u8, apdu: &[u8]) -> Result<()> {
        self.check_ready()?;
        let reader = self.open_device()?.reader(slot)?;
        if !reader.card_present {
            return Err(Error::CardAbsent(slot));
        }
        if !reader.card_powered {
            return Err(Error::CardNotPowered(slot));
        }
        self.submit(Exchange::Transmit(slot), CommandCode::XfrBlock, slot, apdu)
    }

    /// Power the card of a slot
    pub fn power_on(&mut self, slot: u8) -> Result<()> {
        self.check_ready()?;
        if !self.open_device()?.reader(slot)?.card_present {
            return Err(Error::CardAbsent(slot));
        }
        self.submit(Exchange::PowerOn(slot), CommandCode::IccPowerOn, slot, &[])
    }

    /// Power off the card of a slot
    pub fn power_off(&mut self, slot: u8) -> Result<()> {
        self.check_ready()?;
        self.open_device()?.reader(slot)?;
        self.submit(Exchange::PowerOff(slot), CommandCode::IccPowerOff, slot, &[])
    }

    /// Query the status of a slot
    pub fn get_slot_status(&mut self, slot: u8) -> Result<()> {
        self.check_ready()?;
        self.open_device()?.reader(slot)?;
        self.submit(
            Exchange::GetSlotStatus(slot),
            CommandCode::GetSlotStatus,
            slot,
            &[],
        )
    }

    /// Send a raw escape command to the reader
    pub fn control(&mut self, command: &[u8]) -> Result<()> {
        self.check_ready()?;
        self.submit(Exchange::Control, CommandCode::Escape, 0, command)
    }

    /// Query power source and battery level
    pub fn power_status(&mut self) -> Result<()> {
        self.control(&escape::get_power_status())
    }

    /// Switch the reader off
    pub fn shutdown(&mut self) -> Result<()> {
        self.control(&escape::shutdown())
    }

    /// Wake the reader, the only command accepted while sleeping
    pub fn wake_up(&mut self) -> Result<()> {
        match self.state {
            SessionState::Sleeping => {
                self.send(Exchange::WakeUp, CommandCode::Escape, 0, &escape::wake_up())?;
                if !self.state.is_closing() {
                    self.set_state(SessionState::WakingUp);
                }
                Ok(())
            }
            SessionState::Idle => {
                self.submit(Exchange::WakeUp, CommandCode::Escape, 0, &escape::wake_up())
            }
            SessionState::WakingUp | SessionState::WritingCmdAndWaitingResp => Err(Error::Busy),
            other => Err(Error::InvalidState(other.name())),
        }
    }

    /// Start closing the session
    pub fn disconnect(&mut self) -> Result<()> {
        if self.state.is_closing() {
            return Ok(());
        }

        debug!("Disconnecting");
        self.set_state(SessionState::Closing);
        if let Err(e) = self.transport.disconnect() {
            debug!(error = ?e, "Transport disconnect failed, closing");
            self.transport.close();
            self.closed();
        }
        Ok(())
    }

    /// Release the transport immediately, without waiting for the link to close
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transport.close();
        self.closed();
    }

    fn open_device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or(Error::InvalidState(self.state.name()))
    }

    fn check_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::Sleeping | SessionState::WakingUp => Err(Error::Sleeping),
            SessionState::WritingCmdAndWaitingResp => Err(Error::Busy),
            other => Err(Error::InvalidState(other.name())),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if next == self.state {
            return;
        }
        if let Err(e) = self.state.validate_transition(next) {
            warn!(from = %self.state, to = %next, error = %e, "Unexpected state transition");
        }
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    fn emit(&mut self, event: SessionEvent) {
        trace!(?event, "Emitting event");
        self.observer.on_event(event);
    }

    /// Write a user command from `Idle`
    fn submit(&mut self, exchange: Exchange, code: CommandCode, slot: u8, payload: &[u8]) -> Result<()> {
        self.send(exchange, code, slot, payload)?;
        if !self.state.is_closing() {
            self.set_state(SessionState::WritingCmdAndWaitingResp);
        }
        Ok(())
    }

    /// Build a frame and hand it to the transport. Write failures close the
    /// session and are reported as events.
    fn send(&mut self, exchange: Exchange, code: CommandCode, slot: u8, payload: &[u8]) -> Result<()> {
        let raw = self.handler.build(code, slot as usize, payload)?;
        self.in_flight = Some(exchange);
        self.sent_at = Some(Instant::now());

        let chunk_len = self
            .transport
            .max_write_len()
            .filter(|len| *len > 0)
            .unwrap_or(raw.len());
        for chunk in raw.chunks(chunk_len) {
            if let Err(e) = self.transport.write(chunk) {
                self.fail(e.into());
                break;
            }
        }
        Ok(())
    }

    fn send_step(&mut self, step: Step) {
        let (code, slot, payload) = step.command();
        if let Err(e) = self.send(Exchange::Step(step), code, slot, &payload) {
            self.fail(e);
        }
    }

    fn on_connected(&mut self, discovery: Discovery) {
        if self.state != SessionState::Creating(CreatingPhase::Connecting) {
            debug!(state = %self.state, "Ignoring connection event");
            return;
        }

        debug!(
            vendor = %discovery.info.vendor_name,
            product = %discovery.info.product_name,
            slots = discovery.slot_count,
            service = %discovery.service,
            "Transport connected"
        );

        if discovery.slot_count == 0 {
            self.fail(Error::DummyDevice);
            return;
        }

        let mut device = Device::new(discovery.info, discovery.service, discovery.slot_count);
        match &discovery.status {
            Some(status) => match self.handler.interpret_status(status, &mut device.readers) {
                Ok(update) => device.is_sleeping = update.low_power,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            },
            None => self.discover_slots = true,
        }
        self.device = Some(device);

        let Some(secure) = self.config.secure_channel.clone() else {
            self.advance_creation();
            return;
        };

        self.set_state(SessionState::Creating(CreatingPhase::Authenticating));
        let auth = Authenticator::new(&secure.key, secure.key_index, &mut *self.rng);
        let cmd = auth.host_auth_cmd();
        self.auth = Some(auth);
        debug!(key_index = secure.key_index, "Starting mutual authentication");
        if let Err(e) = self.send(Exchange::Authenticate, CommandCode::Escape, 0, &cmd) {
            self.fail(e);
        }
    }

    /// Send the next creation step, moving through the phases as queues drain
    fn advance_creation(&mut self) {
        loop {
            let SessionState::Creating(phase) = self.state else {
                return;
            };

            if let Some(step) = self.queue.pop_front() {
                self.send_step(step);
                return;
            }

            match phase {
                CreatingPhase::Connecting | CreatingPhase::Authenticating => {
                    self.set_state(SessionState::Creating(CreatingPhase::ReadingInfo));
                    self.queue_info_reads();
                }
                CreatingPhase::ReadingInfo => {
                    self.set_state(SessionState::Creating(CreatingPhase::ConnectingToCards));
                    if self.config.auto_connect {
                        self.queue_auto_connect();
                    }
                }
                CreatingPhase::ConnectingToCards => {
                    self.finish_creation();
                    return;
                }
            }
        }
    }

    fn queue_info_reads(&mut self) {
        let slot_count = self.device.as_ref().map_or(0, |d| d.readers.len() as u8);
        if std::mem::take(&mut self.discover_slots) {
            self.queue.extend((0..slot_count).map(Step::DiscoverSlot));
        }
        if self.config.read_device_info {
            self.queue.push_back(Step::ReadFirmware);
            self.queue.extend((0..slot_count).map(Step::ReadSlotName));
        }
    }

    fn queue_auto_connect(&mut self) {
        if let Some(device) = &self.device {
            self.queue.extend(
                device
                    .readers
                    .iter()
                    .filter(|reader| reader.needs_power_on())
                    .map(|reader| Step::AutoConnect(reader.index)),
            );
        }
    }

    fn finish_creation(&mut self) {
        self.deadline = None;
        let Some(device) = self.device.clone() else {
            self.fail(Error::protocol("Session created without a device"));
            return;
        };

        let next = if device.is_sleeping {
            SessionState::Sleeping
        } else {
            SessionState::Idle
        };
        self.set_state(next);
        debug!(slots = device.readers.len(), secure = device.is_secure, "Session created");
        self.emit(SessionEvent::SessionCreated(device));
    }

    fn on_disconnected(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state != SessionState::Closing {
            let e = Error::Transport(TransportError::NotConnected);
            error!(error = %e, "Link lost");
            self.record_error(e.clone());
            self.emit(SessionEvent::SessionError(e));
        }
        self.closed();
    }

    fn on_data(&mut self, data: &[u8]) {
        if self.state.is_closing() {
            trace!("Dropping data received while closing");
            return;
        }

        match self.buffer.push(data) {
            Ok(Assembly::Incomplete) => {}
            Ok(Assembly::Complete(raw)) => self.on_frame(&raw),
            Err(e) => self.fail(e),
        }
    }

    fn on_frame(&mut self, raw: &[u8]) {
        let response = match self.handler.consume(raw) {
            Ok(response) => response,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if response.header_status().is_time_extension() {
            // Response timer restarts, the final answer is still to come
            self.sent_at = Some(Instant::now());
            return;
        }
        self.sent_at = None;

        let Some(exchange) = self.in_flight.take() else {
            self.fail(Error::Unsolicited);
            return;
        };

        if exchange == Exchange::Authenticate {
            self.on_auth_response(&response);
            return;
        }

        self.dispatch(exchange, response);
        self.settle();
    }

    fn on_auth_response(&mut self, response: &Response) {
        if response.header_status().is_failed() {
            self.fail(Error::authentication("Reader rejected the authentication"));
            return;
        }
        let Some(auth) = self.auth.as_mut() else {
            self.fail(Error::authentication("No handshake in progress"));
            return;
        };

        if !auth.is_challenged() {
            let answer = match auth.device_challenge(response.payload()) {
                Ok(answer) => answer,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            if let Err(e) = self.send(Exchange::Authenticate, CommandCode::Escape, 0, &answer) {
                self.fail(e);
            }
            return;
        }

        match auth.device_confirmation(response.payload()) {
            Ok(keys) => {
                self.auth = None;
                self.handler.set_session_keys(keys);
                if let Some(device) = self.device.as_mut() {
                    device.is_secure = true;
                }
                self.advance_creation();
            }
            Err(e) => self.fail(e),
        }
    }

    /// Turn a response into device updates and events
    fn dispatch(&mut self, exchange: Exchange, response: Response) {
        let slot = response.slot();
        let status = response.header_status();
        let failure = slot_failure(&response, matches!(exchange, Exchange::Transmit(_)));

        match exchange {
            Exchange::Step(Step::DiscoverSlot(slot)) => {
                if let Some(reader) = self.reader_mut(slot) {
                    reader.apply_header_status(status);
                }
            }
            Exchange::Step(Step::ReadFirmware) => {
                match escape::parse_firmware_revision(response.payload()) {
                    Ok(firmware) => {
                        debug!(%firmware, "Firmware revision");
                        if let Some(device) = self.device.as_mut() {
                            device.firmware = Some(firmware);
                        }
                    }
                    Err(e) => warn!(error = %e, "Could not read firmware revision"),
                }
            }
            Exchange::Step(Step::ReadSlotName(slot)) => {
                match escape::parse_slot_name(response.payload()) {
                    Ok(name) if !name.is_empty() => {
                        if let Some(reader) = self.reader_mut(slot) {
                            reader.name = name;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(slot, error = %e, "Could not read slot name"),
                }
            }
            Exchange::Step(Step::AutoConnect(_)) | Exchange::PowerOn(_) => match failure {
                Some(e) => self.card_error(slot, status, e),
                None => {
                    let atr = response.payload().clone();
                    if let Some(reader) = self.reader_mut(slot) {
                        reader.card_connected(atr.clone());
                    }
                    debug!(slot, atr = %hex::encode(&atr), "Card connected");
                    self.emit(SessionEvent::CardConnected { slot, atr });
                }
            },
            Exchange::PowerOff(_) => match failure {
                Some(e) => self.card_error(slot, status, e),
                None => {
                    if let Some(reader) = self.reader_mut(slot) {
                        reader.card_disconnected();
                        reader.apply_header_status(status);
                    }
                    self.emit(SessionEvent::CardDisconnected { slot });
                }
            },
            Exchange::Transmit(_) => match failure {
                Some(e) => self.card_error(slot, status, e),
                None => self.emit(SessionEvent::TransmitResponse {
                    slot,
                    response: response.payload().clone(),
                }),
            },
            Exchange::GetSlotStatus(_) => {
                if let Some(reader) = self.reader_mut(slot) {
                    reader.apply_header_status(status);
                }
                self.emit(SessionEvent::SlotStatus { slot, status });
            }
            Exchange::Control | Exchange::WakeUp => {
                if exchange == Exchange::WakeUp {
                    self.woke_up();
                }
                match failure {
                    Some(e) => {
                        warn!(error = %e, "Control command failed");
                        self.emit(SessionEvent::ReaderError { slot, error: e });
                    }
                    None => self.emit(SessionEvent::ControlResponse {
                        response: response.payload().clone(),
                    }),
                }
            }
            Exchange::Authenticate => {}
        }
    }

    fn card_error(&mut self, slot: u8, status: HeaderStatus, error: Error) {
        warn!(slot, error = %error, "Card error");
        if let Some(reader) = self.reader_mut(slot) {
            reader.apply_header_status(status);
        }
        self.emit(SessionEvent::ReaderError { slot, error });
    }

    fn woke_up(&mut self) {
        let was_sleeping = self
            .device
            .as_mut()
            .is_some_and(|device| std::mem::replace(&mut device.is_sleeping, false));
        if was_sleeping {
            self.emit(SessionEvent::PowerStateChanged { sleeping: false });
        }
    }

    /// Pick the next state once a response has been handled
    fn settle(&mut self) {
        match self.state {
            SessionState::Creating(_) => self.advance_creation(),
            SessionState::Closing | SessionState::Closed => {}
            _ => {
                if let Some(step) = self.queue.pop_front() {
                    self.set_state(SessionState::WritingCmdAndWaitingResp);
                    self.send_step(step);
                } else if self.device.as_ref().is_some_and(|d| d.is_sleeping) {
                    self.set_state(SessionState::Sleeping);
                } else {
                    self.set_state(SessionState::Idle);
                }
            }
        }
    }

    fn on_status(&mut self, data: &[u8]) {
        if self.state.is_closing() {
            return;
        }
        let Some(device) = self.device.as_mut() else {
            debug!("Status notification before discovery, ignored");
            return;
        };

        trace!(status = %hex::encode(data), "Status notification");
        let update = match self.handler.interpret_status(data, &mut device.readers) {
            Ok(update) => update,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let power_changed = device.is_sleeping != update.low_power;
        device.is_sleeping = update.low_power;

        if self.state.is_creating() {
            // Earlier phases pick new cards up when auto-connect is queued
            if self.config.auto_connect
                && self.state == SessionState::Creating(CreatingPhase::ConnectingToCards)
            {
                for &(slot, state) in &update.changes {
                    let step = Step::AutoConnect(slot);
                    if state == SlotState::Inserted && !self.queue.contains(&step) {
                        self.queue.push_back(step);
                    }
                }
            }
            return;
        }

        for &(slot, state) in &update.changes {
            self.emit(SessionEvent::CardStatusChanged { slot, state });
            if state.is_present() && self.config.auto_connect {
                self.queue.push_back(Step::AutoConnect(slot));
            }
        }

        if power_changed {
            debug!(sleeping = update.low_power, "Power state changed");
            self.emit(SessionEvent::PowerStateChanged {
                sleeping: update.low_power,
            });
        }

        match self.state {
            SessionState::Idle if update.low_power => self.set_state(SessionState::Sleeping),
            SessionState::Sleeping if !update.low_power => self.set_state(SessionState::Idle),
            _ => {}
        }

        if self.state == SessionState::Idle {
            self.settle();
        }
    }

    fn reader_mut(&mut self, slot: u8) -> Option<&mut Reader> {
        self.device
            .as_mut()
            .and_then(|device| device.reader_mut(slot).ok())
    }

    fn record_error(&mut self, error: Error) {
        if let Some(device) = self.device.as_mut() {
            device.last_error = Some(error.clone());
        }
        self.last_error = Some(error);
    }

    /// Report a fatal error once and tear the link down
    fn fail(&mut self, error: Error) {
        if self.state.is_closing() {
            debug!(error = %error, "Error while closing, ignored");
            return;
        }

        error!(state = %self.state, error = %error, "Session failed");
        self.record_error(error.clone());
        self.emit(SessionEvent::SessionError(error));

        self.set_state(SessionState::Closing);
        if let Err(e) = self.transport.disconnect() {
            debug!(error = ?e, "Transport disconnect failed, closing");
            self.transport.close();
            self.closed();
        }
    }

    fn closed(&mut self) {
        self.set_state(SessionState::Closed);
        self.handler.reset();
        self.buffer.clear();
        self.queue.clear();
        self.auth = None;
        self.in_flight = None;
        self.sent_at = None;
        self.deadline = None;
        self.discover_slots = false;
        self.device = None;
        self.emit(SessionEvent::SessionClosed);
    }
}

/// Card error carried by a failed response, `None` when the command succeeded
fn slot_failure(response: &Response, card_in_use: bool) -> Option<Error> {
    let status = response.header_status();
    if !status.is_failed() {
        return None;
    }

    let slot = response.slot();
    let error = response.header_error()?;
    Some(match status.icc {
        IccStatus::Absent if card_in_use => Error::CardRemoved(slot),
        IccStatus::Absent => Error::CardAbsent(slot),
        _ => Error::Card { slot, error },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, ResponseCode};
    use crate::status::SlotError;

    fn response(status: u8, error: u8) -> Response {
        Response::new(Frame::response(ResponseCode::DataBlock, 2, 0, status, error, Bytes::new()))
    }

    #[test]
    fn test_slot_failure() {
        assert_eq!(slot_failure(&response(0x00, 0x00), false), None);
        assert_eq!(slot_failure(&response(0x41, 0x00), false), None);
        assert_eq!(
            slot_failure(&response(0x41, 0xFE), false),
            Some(Error::Card {
                slot: 2,
                error: SlotError::IccMute
            })
        );
        assert_eq!(
            slot_failure(&response(0x42, 0xFE), false),
            Some(Error::CardAbsent(2))
        );
        assert_eq!(
            slot_failure(&response(0x42, 0xFE), true),
            Some(Error::CardRemoved(2))
        );
    }

    #[test]
    fn test_step_commands() {
        assert_eq!(
            Step::ReadSlotName(1).command(),
            (CommandCode::Escape, 0, Bytes::from_static(&[0x58, 0x21, 0x01]))
        );
        assert_eq!(Step::AutoConnect(3).command().0, CommandCode::IccPowerOn);
        assert_eq!(Step::DiscoverSlot(1).command().1, 1);
    }
}
