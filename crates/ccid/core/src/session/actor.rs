//! Session actor
//!
//! [`SessionHandle`] moves a [`Session`] onto a dedicated thread. Transport
//! events and requests travel on the same queue, so the session sees one input at
//! a time whatever thread produced it.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use tracing::{debug, trace};

use super::{Request, Session};
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent, TransportSink};

/// How often timers are checked when the queue is quiet
const TICK_INTERVAL: Duration = Duration::from_millis(100);

enum Input {
    Transport(TransportEvent),
    Request(Request, Sender<Result<()>>),
    Shutdown,
}

/// Handle to a session running on its own thread
///
/// Dropping the handle closes the session and joins the thread.
#[derive(Debug)]
pub struct SessionHandle {
    input: Sender<Input>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(event) => f.debug_tuple("Transport").field(event).finish(),
            Self::Request(request, _) => f.debug_tuple("Request").field(request).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl SessionHandle {
    /// Connect the session and start its thread
    pub fn spawn<T>(mut session: Session<T>) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let (input, queue) = unbounded();

        let events = input.clone();
        let sink = TransportSink::new(move |event| {
            // The actor is gone, the session with it
            let _ = events.send(Input::Transport(event));
        });
        session.connect(sink)?;

        let thread = thread::Builder::new()
            .name("ccid-session".into())
            .spawn(move || run(session, queue))
            .map_err(|e| Error::message(format!("Failed to spawn session thread: {e}")))?;

        Ok(Self {
            input,
            thread: Some(thread),
        })
    }

    /// Submit a request and wait until the session accepts or rejects it
    pub fn request(&self, request: Request) -> Result<()> {
        let (reply, answer) = bounded(1);
        self.input
            .send(Input::Request(request, reply))
            .map_err(|_| Error::ActorStopped)?;
        answer.recv().map_err(|_| Error::ActorStopped)?
    }

    /// Send an APDU to the card of a slot
    pub fn transmit(&self, slot: u8, apdu: impl Into<Bytes>) -> Result<()> {
        self.request(Request::Transmit {
            slot,
            apdu: apdu.into(),
        })
    }

    /// Power the card of a slot
    pub fn power_on(&self, slot: u8) -> Result<()> {
        self.request(Request::PowerOn { slot })
    }

    /// Power off the card of a slot
    pub fn power_off(&self, slot: u8) -> Result<()> {
        self.request(Request::PowerOff { slot })
    }

    /// Query the status of a slot
    pub fn get_slot_status(&self, slot: u8) -> Result<()> {
        self.request(Request::GetSlotStatus { slot })
    }

    /// Send a raw escape command
    pub fn control(&self, command: impl Into<Bytes>) -> Result<()> {
        self.request(Request::Control {
            command: command.into(),
        })
    }

    /// Wake a sleeping reader
    pub fn wake_up(&self) -> Result<()> {
        self.request(Request::WakeUp)
    }

    /// Query power source and battery level
    pub fn power_status(&self) -> Result<()> {
        self.request(Request::PowerStatus)
    }

    /// Switch the reader off
    pub fn shutdown(&self) -> Result<()> {
        self.request(Request::Shutdown)
    }

    /// Start closing the session
    pub fn disconnect(&self) -> Result<()> {
        self.request(Request::Disconnect)
    }

    /// Whether the session thread is still running
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.input.send(Input::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run<T: Transport>(mut session: Session<T>, queue: Receiver<Input>) {
    debug!("Session actor started");
    loop {
        match queue.recv_timeout(TICK_INTERVAL) {
            Ok(Input::Transport(event)) => {
                trace!(?event, "Transport event");
                session.handle_transport_event(event);
            }
            Ok(Input::Request(request, reply)) => {
                trace!(?request, "Request");
                let _ = reply.send(session.request(request));
            }
            Ok(Input::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        session.tick();
    }

    session.close();
    debug!("Session actor stopped");
}
